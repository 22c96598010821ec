// Lexical scope frames.
//
// A context pairs a scope kind with the memory manager that owns its
// variables' cells and the table of names declared in it. Global and
// Class contexts allocate from global memory; Function, Local, and
// Loop contexts from the shared temporal memory. Resolution walks the
// stack from the top; the first frame that knows the name wins.

use std::cell::RefCell;
use std::rc::Rc;

use crate::arrays::ArrayManager;
use crate::error::{ErrorKind, ProgramError, ProgramResult};
use crate::memory::{MemoryManager, Type};
use crate::variables::{Variable, VariableTable};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scope {
    Global,
    Function,
    Local,
    Loop,
    Class,
}

pub type SharedMemory = Rc<RefCell<MemoryManager>>;

pub struct Context {
    pub scope: Scope,
    pub memory: SharedMemory,
    pub vars: VariableTable,
}

impl Context {
    pub fn new(scope: Scope, memory: SharedMemory) -> Context {
        Context {
            scope,
            memory,
            vars: VariableTable::new(),
        }
    }

    // Declare a variable in this context, reserving its cells.
    //
    // Simple types get one cell, or a whole block for a finalized
    // array. An object variable owns no cell of its own (its
    // attributes are declared separately) and records address 0.
    pub fn add_variable(
        &mut self,
        name: &str,
        ty: Type,
        array: Option<ArrayManager>,
    ) -> ProgramResult<Variable> {
        let address = if self.scope != Scope::Class && ty.is_simple() {
            let size = array.as_ref().map(|a| a.size as usize).unwrap_or(1);
            self.memory
                .borrow_mut()
                .reserve(&ty, size)
                .map_err(|e| ProgramError::runtime(ErrorKind::UnsupportedOperation, e.to_string()))?
        } else if self.scope == Scope::Class {
            self.memory
                .borrow_mut()
                .reserve(&ty, 1)
                .map_err(|e| ProgramError::runtime(ErrorKind::UnsupportedOperation, e.to_string()))?
        } else {
            0
        };
        self.vars.add(name, ty, address, array)
    }

    pub fn check_variable_exists(&self, name: &str) -> bool {
        self.vars.contains(name)
    }

    pub fn get_variable(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }
}

#[derive(Default)]
pub struct ContextStack {
    contexts: Vec<Context>,
}

impl ContextStack {
    pub fn new() -> ContextStack {
        ContextStack {
            contexts: Vec::new(),
        }
    }

    pub fn push(&mut self, context: Context) {
        self.contexts.push(context);
    }

    pub fn pop(&mut self) -> Option<Context> {
        self.contexts.pop()
    }

    pub fn top_mut(&mut self) -> &mut Context {
        self.contexts.last_mut().expect("empty context stack")
    }

    pub fn top(&self) -> &Context {
        self.contexts.last().expect("empty context stack")
    }

    // Topmost frame that knows the name.
    pub fn get_variable(&self, name: &str) -> Option<&Variable> {
        self.contexts
            .iter()
            .rev()
            .find_map(|context| context.get_variable(name))
    }

    // The frame holding a name; object assignment needs both sides'
    // frames to read their attribute address lists.
    pub fn containing_context(&self, name: &str) -> Option<&Context> {
        self.contexts
            .iter()
            .rev()
            .find(|context| context.check_variable_exists(name))
    }

    pub fn check_variable_exists(&self, name: &str) -> bool {
        self.contexts
            .iter()
            .rev()
            .any(|context| context.check_variable_exists(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{type_from_address, GLOBAL_BASE, LOCAL_BASE};

    fn shared(base: usize) -> SharedMemory {
        Rc::new(RefCell::new(MemoryManager::new(base)))
    }

    #[test]
    fn test_scope_memory_policy() {
        let global = shared(GLOBAL_BASE);
        let temporal = shared(LOCAL_BASE);

        let mut stack = ContextStack::new();
        stack.push(Context::new(Scope::Global, global.clone()));
        let g = stack.top_mut().add_variable("g", Type::Int, None).unwrap();
        stack.push(Context::new(Scope::Function, temporal.clone()));
        let l = stack.top_mut().add_variable("n", Type::Int, None).unwrap();

        assert!(g.address < LOCAL_BASE);
        assert!(l.address >= LOCAL_BASE);
        assert_eq!(type_from_address(l.address), Type::Int);
        assert_eq!(temporal.borrow().resources().ints, 1);
    }

    #[test]
    fn test_resolution_topmost_wins() {
        let global = shared(GLOBAL_BASE);
        let temporal = shared(LOCAL_BASE);

        let mut stack = ContextStack::new();
        stack.push(Context::new(Scope::Global, global));
        stack.top_mut().add_variable("x", Type::Int, None).unwrap();
        stack.push(Context::new(Scope::Local, temporal));
        stack.top_mut().add_variable("x", Type::Float, None).unwrap();

        assert_eq!(stack.get_variable("x").unwrap().ty, Type::Float);
        stack.pop();
        assert_eq!(stack.get_variable("x").unwrap().ty, Type::Int);
        assert!(stack.get_variable("y").is_none());
    }

    #[test]
    fn test_object_variable_owns_no_cell() {
        let temporal = shared(LOCAL_BASE);
        let mut context = Context::new(Scope::Local, temporal.clone());
        let p = context
            .add_variable("p", Type::Object("P".to_string()), None)
            .unwrap();
        assert_eq!(p.address, 0);
        assert_eq!(temporal.borrow().resources().ints, 0);
    }

    #[test]
    fn test_array_reserves_block() {
        let temporal = shared(LOCAL_BASE);
        let mut context = Context::new(Scope::Local, temporal.clone());
        let mut array = ArrayManager::new();
        array.add_dimension(3).unwrap();
        array.finalize();
        context.add_variable("a", Type::Int, Some(array)).unwrap();
        assert_eq!(temporal.borrow().resources().ints, 3);
    }
}
