// The global directory of class shapes. A class is a name plus the
// table of its simple-typed attributes; there are no methods.

use indexmap::IndexMap;

use crate::error::{ErrorKind, ProgramError, ProgramResult};
use crate::variables::VariableTable;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassDetail {
    pub name: String,
    pub variables: VariableTable,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassDirectory {
    dir: IndexMap<String, ClassDetail>,
}

impl ClassDirectory {
    pub fn new() -> ClassDirectory {
        ClassDirectory {
            dir: IndexMap::new(),
        }
    }

    pub fn add(&mut self, name: &str) {
        self.dir.insert(
            name.to_string(),
            ClassDetail {
                name: name.to_string(),
                variables: VariableTable::new(),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dir.contains_key(name)
    }

    pub fn get(&self, name: &str) -> ProgramResult<&ClassDetail> {
        self.dir.get(name).ok_or_else(|| {
            ProgramError::runtime(
                ErrorKind::UndeclaredIdentifier,
                format!("The information for class '{}' does not exist", name),
            )
        })
    }

    pub fn get_mut(&mut self, name: &str) -> ProgramResult<&mut ClassDetail> {
        self.dir.get_mut(name).ok_or_else(|| {
            ProgramError::runtime(
                ErrorKind::UndeclaredIdentifier,
                format!("The information for class '{}' does not exist", name),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Type;

    #[test]
    fn test_directory() {
        let mut classes = ClassDirectory::new();
        assert!(!classes.contains("P"));
        classes.add("P");
        assert!(classes.contains("P"));

        let detail = classes.get_mut("P").unwrap();
        detail.variables.add("x", Type::Int, 0, None).unwrap();
        assert!(classes.get("P").unwrap().variables.contains("x"));
        assert!(classes.get("Q").is_err());
    }
}
