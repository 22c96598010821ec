// Function directories.
//
// The compiler-side record tracks everything code generation needs:
// where the name constant lives, the return slot, the parameter list,
// and the activation footprint snapshotted at function end. The VM
// keeps only what a call needs: the entry point and the footprint.

use indexmap::IndexMap;

use crate::error::{ErrorKind, ProgramError, ProgramResult};
use crate::memory::{Resources, Type};
use crate::variables::Variable;

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    // Address of the name string pooled in global memory; ERA and GOSUB
    // carry this so the VM can recover the callee by name.
    pub address: usize,
    pub return_type: Option<Type>,
    pub return_address: Option<usize>,
    pub initial_quad_address: usize,
    pub parameters: Vec<Variable>,
    pub resources: Resources,
    pub return_present: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionDirectory {
    dir: IndexMap<String, Function>,
}

impl FunctionDirectory {
    pub fn new() -> FunctionDirectory {
        FunctionDirectory {
            dir: IndexMap::new(),
        }
    }

    pub fn add(
        &mut self,
        name: &str,
        address: usize,
        return_type: Option<Type>,
        return_address: Option<usize>,
    ) {
        self.dir.insert(
            name.to_string(),
            Function {
                name: name.to_string(),
                address,
                return_type,
                return_address,
                initial_quad_address: 0,
                parameters: Vec::new(),
                resources: Resources::default(),
                return_present: false,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dir.contains_key(name)
    }

    pub fn get(&self, name: &str) -> ProgramResult<&Function> {
        self.dir.get(name).ok_or_else(|| missing(name))
    }

    pub fn get_mut(&mut self, name: &str) -> ProgramResult<&mut Function> {
        self.dir.get_mut(name).ok_or_else(|| missing(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.dir.values()
    }
}

fn missing(name: &str) -> ProgramError {
    ProgramError::runtime(
        ErrorKind::UndeclaredIdentifier,
        format!("The information for function '{}' does not exist", name),
    )
}

// The subset of a function record the VM needs to enter a call.
#[derive(Clone, Debug, PartialEq)]
pub struct VmFunction {
    pub name: String,
    pub initial_quad_address: usize,
    pub resources: Resources,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmFunctionDirectory {
    dir: IndexMap<String, VmFunction>,
}

impl VmFunctionDirectory {
    pub fn new() -> VmFunctionDirectory {
        VmFunctionDirectory {
            dir: IndexMap::new(),
        }
    }

    pub fn add(&mut self, name: &str, initial_quad_address: usize, resources: Resources) {
        self.dir.insert(
            name.to_string(),
            VmFunction {
                name: name.to_string(),
                initial_quad_address,
                resources,
            },
        );
    }

    pub fn get(&self, name: &str) -> ProgramResult<&VmFunction> {
        self.dir.get(name).ok_or_else(|| missing(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &VmFunction> {
        self.dir.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiler_directory() {
        let mut functions = FunctionDirectory::new();
        functions.add("fact", 2000, Some(Type::Int), Some(0));
        assert!(functions.contains("fact"));
        assert!(!functions.contains("main"));

        let f = functions.get_mut("fact").unwrap();
        f.initial_quad_address = 2;
        f.return_present = true;
        assert_eq!(functions.get("fact").unwrap().initial_quad_address, 2);
        assert_eq!(
            functions.get("nope").unwrap_err().kind,
            ErrorKind::UndeclaredIdentifier
        );
    }

    #[test]
    fn test_vm_directory() {
        let mut functions = VmFunctionDirectory::new();
        let resources = Resources {
            ints: 2,
            ..Resources::default()
        };
        functions.add("main", 4, resources);
        let f = functions.get("main").unwrap();
        assert_eq!(f.initial_quad_address, 4);
        assert_eq!(f.resources, resources);
    }
}
