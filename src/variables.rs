// Variable records and the per-context variable table.

use indexmap::IndexMap;

use crate::arrays::ArrayManager;
use crate::error::{ErrorKind, ProgramError, ProgramResult};
use crate::memory::Type;

#[derive(Clone, Debug, PartialEq)]
pub struct Variable {
    pub name: String,
    pub ty: Type,
    pub address: usize,
    pub array: Option<ArrayManager>,
}

// Insertion-ordered name → variable mapping. Declaration order matters:
// object assignment pairs up the attribute address lists of both sides
// positionally.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableTable {
    table: IndexMap<String, Variable>,
}

impl VariableTable {
    pub fn new() -> VariableTable {
        VariableTable {
            table: IndexMap::new(),
        }
    }

    pub fn add(
        &mut self,
        name: &str,
        ty: Type,
        address: usize,
        array: Option<ArrayManager>,
    ) -> ProgramResult<Variable> {
        if self.table.contains_key(name) {
            return Err(ProgramError::runtime(
                ErrorKind::RedeclarationError,
                format!("There is already a variable named '{}' in the directory", name),
            ));
        }
        let variable = Variable {
            name: name.to_string(),
            ty,
            address,
            array,
        };
        self.table.insert(name.to_string(), variable.clone());
        Ok(variable)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.table.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    // The addresses of every variable whose name starts with the given
    // prefix, in declaration order. Whole-object assignment compiles to
    // one `=` per paired address.
    pub fn attribute_addresses(&self, prefix: &str) -> Vec<usize> {
        self.table
            .values()
            .filter(|v| v.name.starts_with(prefix))
            .map(|v| v.address)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.table.values()
    }
}
