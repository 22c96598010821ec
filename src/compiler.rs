// The front-end driver: walks the AST and drives the memory managers,
// directories, and quadruple list into a complete program image.
//
// All compiler state lives in one record threaded through the walk:
// the three memory managers (global, constant, temporal), the function
// and class directories, the context stack, and the side-effect stacks
// used by backpatching (jumps, end-jumps with their per-level counter,
// and the function stack).
//
// Control flow compiles with backpatching: a forward jump is emitted
// with an empty result field and its index pushed on the jump stack;
// once the target instruction is known, the quad is patched with the
// address of an int constant holding the target index. Jump targets
// are therefore constant-pool addresses, like every other quad field.

use std::cell::RefCell;
use std::rc::Rc;

use crate::arrays::ArrayManager;
use crate::ast;
use crate::classes::ClassDirectory;
use crate::context::{Context, ContextStack, Scope, SharedMemory};
use crate::error::{ErrorKind, ProgramError, ProgramResult};
use crate::functions::FunctionDirectory;
use crate::memory::{MemoryManager, Type, Value, CONSTANT_BASE, GLOBAL_BASE, LOCAL_BASE};
use crate::parser;
use crate::quadruples::{Op, Quad, Quadruples};
use crate::semantics::result_type;
use crate::variables::Variable;

// What an expression evaluates to: a named variable, an anonymous
// (type, address) pair, or nothing at all (a void call).
#[derive(Clone, Debug)]
pub enum Operand {
    Var(Variable),
    Temp { ty: Type, address: usize },
    Void,
}

pub struct Compiler {
    pub global_memory: SharedMemory,
    pub constant_memory: SharedMemory,
    pub temporal_memory: SharedMemory,
    pub functions: FunctionDirectory,
    pub classes: ClassDirectory,
    pub contexts: ContextStack,
    pub quads: Quadruples,
    jumps: Vec<usize>,
    end_count: Vec<usize>,
    end_jumps: Vec<usize>,
    function_stack: Vec<String>,
    line_starts: Vec<usize>,
}

impl Compiler {
    // Compile a whole source file into a program image.
    pub fn compile(source: &str) -> ProgramResult<Compiler> {
        let program = parser::parse(source)?;
        let mut compiler = Compiler::new(source);
        compiler.program(&program)?;
        Ok(compiler)
    }

    fn new(source: &str) -> Compiler {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Compiler {
            global_memory: Rc::new(RefCell::new(MemoryManager::new(GLOBAL_BASE))),
            constant_memory: Rc::new(RefCell::new(MemoryManager::new(CONSTANT_BASE))),
            temporal_memory: Rc::new(RefCell::new(MemoryManager::new(LOCAL_BASE))),
            functions: FunctionDirectory::new(),
            classes: ClassDirectory::new(),
            contexts: ContextStack::new(),
            quads: Quadruples::new(),
            jumps: Vec::new(),
            end_count: Vec::new(),
            end_jumps: Vec::new(),
            function_stack: Vec::new(),
            line_starts,
        }
    }

    fn line_at(&self, pos: usize) -> usize {
        self.line_starts.partition_point(|start| *start <= pos)
    }

    // Reserve one temporal cell for an intermediate result.
    fn temp(&mut self, ty: &Type, line: usize) -> ProgramResult<usize> {
        self.temporal_memory
            .borrow_mut()
            .reserve(ty, 1)
            .map_err(|e| ProgramError::at(ErrorKind::UnsupportedOperation, line, e.to_string()))
    }

    // Pool a constant, returning its address.
    fn constant(&mut self, value: Value, line: usize) -> ProgramResult<usize> {
        self.constant_memory
            .borrow_mut()
            .find_or_insert(value)
            .map_err(|e| ProgramError::at(ErrorKind::UnsupportedOperation, line, e.to_string()))
    }

    fn parts(&self, operand: &Operand, line: usize) -> ProgramResult<(Type, usize)> {
        match operand {
            Operand::Var(v) => Ok((v.ty.clone(), v.address)),
            Operand::Temp { ty, address } => Ok((ty.clone(), *address)),
            Operand::Void => Err(mismatch(line)),
        }
    }

    fn lookup(&self, name: &str, line: usize) -> ProgramResult<Variable> {
        self.contexts.get_variable(name).cloned().ok_or_else(|| {
            ProgramError::at(
                ErrorKind::UndeclaredIdentifier,
                line,
                format!("The variable '{}' has not been declared", name),
            )
        })
    }

    // Point the jump quad at `index` to the current instruction.
    fn patch_to_here(&mut self, index: usize, line: usize) -> ProgramResult<()> {
        let target = self.constant(Value::Int(self.quads.instr_ptr() as i64), line)?;
        self.quads.patch(index, target);
        Ok(())
    }

    /*
     * Program structure
     */

    fn program(&mut self, program: &ast::Program) -> ProgramResult<()> {
        // Placeholder prologue; patched with main's address once the
        // main block is reached.
        self.quads.emit(Op::Era, None, None, None);
        self.quads.emit(Op::Gosub, None, None, None);
        self.contexts
            .push(Context::new(Scope::Global, self.global_memory.clone()));

        for class in &program.classes {
            self.class_declaration(class)?;
        }
        for decl in &program.globals {
            self.variable_declaration(decl)?;
        }
        for function in &program.functions {
            self.function_declaration(function)?;
        }
        self.main_block(&program.main)
    }

    fn main_block(&mut self, block: &ast::Block) -> ProgramResult<()> {
        let f_address = self
            .global_memory
            .borrow_mut()
            .find_or_insert(Value::Str("main".to_string()))
            .map_err(|e| ProgramError::at(ErrorKind::UnsupportedOperation, 1, e.to_string()))?;
        self.functions.add("main", f_address, None, None);
        self.functions.get_mut("main")?.initial_quad_address = self.quads.instr_ptr();
        self.quads
            .set(1, Quad::new(Op::Gosub, None, None, Some(f_address)));

        self.contexts
            .push(Context::new(Scope::Local, self.temporal_memory.clone()));
        for decl in &block.vars {
            self.variable_declaration(decl)?;
        }
        for statement in &block.statements {
            self.statement(statement)?;
        }

        self.quads
            .set(0, Quad::new(Op::Era, None, None, Some(f_address)));
        self.functions.get_mut("main")?.resources = self.temporal_memory.borrow().resources();
        self.contexts.pop();
        self.quads.emit(Op::EndProg, None, None, None);
        Ok(())
    }

    fn class_declaration(&mut self, class: &ast::ClassDecl) -> ProgramResult<()> {
        let line = self.line_at(class.pos);
        if self.classes.contains(&class.name) {
            return Err(ProgramError::at(
                ErrorKind::RedeclarationError,
                line,
                format!("There is already a class named '{}' in the directory", class.name),
            ));
        }
        self.classes.add(&class.name);

        // Attribute templates live in global memory; the table moves
        // into the directory once the context pops.
        self.contexts
            .push(Context::new(Scope::Class, self.global_memory.clone()));
        for (ty, name) in &class.attributes {
            if self.contexts.check_variable_exists(name) {
                return Err(ProgramError::at(
                    ErrorKind::RedeclarationError,
                    line,
                    format!("There is already an attribute named '{}' in the directory", name),
                ));
            }
            self.contexts
                .top_mut()
                .add_variable(name, ty.clone(), None)
                .map_err(stamp(line))?;
        }
        let context = self.contexts.pop().expect("class context missing");
        self.classes.get_mut(&class.name)?.variables = context.vars;
        Ok(())
    }

    fn variable_declaration(&mut self, decl: &ast::VarDecl) -> ProgramResult<()> {
        match decl {
            ast::VarDecl::Simple {
                pos,
                ty,
                declarators,
            } => {
                let line = self.line_at(*pos);
                for declarator in declarators {
                    if self.contexts.top().check_variable_exists(&declarator.name) {
                        return Err(redeclared(&declarator.name, line));
                    }
                    let array = if declarator.dims.is_empty() {
                        None
                    } else {
                        let mut array = ArrayManager::new();
                        for dim in &declarator.dims {
                            array.add_dimension(*dim).map_err(stamp(line))?;
                        }
                        array.finalize();
                        Some(array)
                    };
                    self.contexts
                        .top_mut()
                        .add_variable(&declarator.name, ty.clone(), array)
                        .map_err(stamp(line))?;
                }
                Ok(())
            }
            ast::VarDecl::Object { pos, class, names } => {
                let line = self.line_at(*pos);
                if !self.classes.contains(class) {
                    return Err(ProgramError::at(
                        ErrorKind::UndeclaredIdentifier,
                        line,
                        format!("The class '{}' has not been declared", class),
                    ));
                }
                let attributes: Vec<(String, Type)> = self
                    .classes
                    .get(class)?
                    .variables
                    .iter()
                    .map(|v| (v.name.clone(), v.ty.clone()))
                    .collect();
                for name in names {
                    // Object names collide with anything visible, not
                    // just the current frame.
                    if self.contexts.check_variable_exists(name) {
                        return Err(redeclared(name, line));
                    }
                    self.contexts
                        .top_mut()
                        .add_variable(name, Type::Object(class.clone()), None)
                        .map_err(stamp(line))?;
                    for (attribute, ty) in &attributes {
                        let nested = format!("{}.{}", name, attribute);
                        self.contexts
                            .top_mut()
                            .add_variable(&nested, ty.clone(), None)
                            .map_err(stamp(line))?;
                    }
                }
                Ok(())
            }
        }
    }

    fn function_declaration(&mut self, function: &ast::FunctionDecl) -> ProgramResult<()> {
        let line = self.line_at(function.pos);
        if self.functions.contains(&function.name) {
            return Err(ProgramError::at(
                ErrorKind::RedeclarationError,
                line,
                format!(
                    "There is already a function named '{}' in the directory",
                    function.name
                ),
            ));
        }

        // The return slot is a global cell; the callee assigns into it
        // and the caller copies it out right after GOSUB.
        let return_address = match &function.return_type {
            Some(ty) => Some(
                self.global_memory
                    .borrow_mut()
                    .reserve(ty, 1)
                    .map_err(|e| {
                        ProgramError::at(ErrorKind::UnsupportedOperation, line, e.to_string())
                    })?,
            ),
            None => None,
        };
        let f_address = self
            .global_memory
            .borrow_mut()
            .find_or_insert(Value::Str(function.name.clone()))
            .map_err(|e| ProgramError::at(ErrorKind::UnsupportedOperation, line, e.to_string()))?;
        self.functions.add(
            &function.name,
            f_address,
            function.return_type.clone(),
            return_address,
        );

        self.contexts
            .push(Context::new(Scope::Function, self.temporal_memory.clone()));
        for (ty, name) in &function.params {
            if self.contexts.top().check_variable_exists(name) {
                return Err(ProgramError::at(
                    ErrorKind::RedeclarationError,
                    line,
                    format!("There is already a parameter named '{}' in the directory", name),
                ));
            }
            let parameter = self
                .contexts
                .top_mut()
                .add_variable(name, ty.clone(), None)
                .map_err(stamp(line))?;
            self.functions
                .get_mut(&function.name)?
                .parameters
                .push(parameter);
        }
        self.function_stack.push(function.name.clone());
        self.functions.get_mut(&function.name)?.initial_quad_address = self.quads.instr_ptr();

        self.contexts
            .push(Context::new(Scope::Local, self.temporal_memory.clone()));
        for decl in &function.body.vars {
            self.variable_declaration(decl)?;
        }
        for statement in &function.body.statements {
            self.statement(statement)?;
        }
        self.contexts.pop();
        self.contexts.pop();
        self.function_stack.pop();

        if self.functions.get(&function.name)?.return_type.is_some()
            && !self.functions.get(&function.name)?.return_present
        {
            return Err(ProgramError::at(
                ErrorKind::ReturnStatementMissing,
                line,
                format!(
                    "The function named '{}' is missing a return statement",
                    function.name
                ),
            ));
        }

        // Snapshot the activation footprint, close void functions, and
        // hand the temporal page back in pristine state.
        self.functions.get_mut(&function.name)?.resources =
            self.temporal_memory.borrow().resources();
        if function.return_type.is_none() {
            self.quads.emit(Op::EndFunc, None, None, None);
        }
        self.temporal_memory.borrow_mut().clear();
        Ok(())
    }

    /*
     * Statements
     */

    fn statement(&mut self, statement: &ast::Statement) -> ProgramResult<()> {
        match statement {
            ast::Statement::Assign(assignment) => {
                self.assignment(assignment)?;
                Ok(())
            }
            ast::Statement::If {
                branches,
                otherwise,
            } => self.conditional(branches, otherwise.as_deref()),
            ast::Statement::While { pos, cond, body } => self.while_loop(*pos, cond, body),
            ast::Statement::For {
                pos,
                var,
                from,
                to,
                body,
            } => self.for_loop(*pos, var, from, to, body),
            ast::Statement::Print { pos, args } => self.print(*pos, args),
            ast::Statement::Read { pos, target } => self.read(*pos, target),
            ast::Statement::Call(call) => {
                self.call(call)?;
                Ok(())
            }
            ast::Statement::Return { pos, value } => self.return_statement(*pos, value),
        }
    }

    fn assignment(&mut self, assignment: &ast::Assignment) -> ProgramResult<Operand> {
        let line = self.line_at(assignment.pos);
        let target = self.variable(&assignment.target)?;
        let value = match &assignment.value {
            ast::AssignRhs::Chain(inner) => self.assignment(inner)?,
            ast::AssignRhs::Expr(expr) => self.expression(expr, line)?,
        };
        let (value_ty, value_address) = self.parts(&value, line)?;
        let result = result_type(&target.ty, Op::Assign, &value_ty).ok_or_else(|| mismatch(line))?;

        if !target.ty.is_simple() || !value_ty.is_simple() {
            // Whole-object copy: one assignment per attribute, the two
            // sides paired up in declaration order.
            let source = match value {
                Operand::Var(v) => v,
                _ => return Err(mismatch(line)),
            };
            let left_addresses = self
                .contexts
                .containing_context(&target.name)
                .map(|c| c.vars.attribute_addresses(&format!("{}.", target.name)))
                .ok_or_else(|| undeclared(&target.name, line))?;
            let right_addresses = self
                .contexts
                .containing_context(&source.name)
                .map(|c| c.vars.attribute_addresses(&format!("{}.", source.name)))
                .ok_or_else(|| undeclared(&source.name, line))?;
            for (left, right) in left_addresses.iter().zip(&right_addresses) {
                self.quads.emit(Op::Assign, Some(*right), None, Some(*left));
            }
            Ok(Operand::Var(target))
        } else {
            self.quads
                .emit(Op::Assign, Some(value_address), None, Some(target.address));
            Ok(Operand::Temp {
                ty: result,
                address: target.address,
            })
        }
    }

    // Evaluate a guard, require bool, and emit the pending GOTOF.
    fn guard_jump(&mut self, guard: &Operand, line: usize) -> ProgramResult<()> {
        let (ty, address) = self.parts(guard, line)?;
        if ty != Type::Bool {
            return Err(ProgramError::at(
                ErrorKind::TypeMismatch,
                line,
                "Expression should be boolean",
            ));
        }
        self.jumps.push(self.quads.instr_ptr());
        self.quads.emit(Op::GotoF, Some(address), None, None);
        Ok(())
    }

    // Loop and conditional bodies share a context kind that tracks how
    // many end-jumps this nesting level queued.
    fn push_loop_context(&mut self) {
        self.contexts
            .push(Context::new(Scope::Loop, self.temporal_memory.clone()));
        self.end_count.push(0);
    }

    fn pop_loop_context(&mut self, line: usize) -> ProgramResult<()> {
        self.contexts.pop();
        let pending = self.end_count.pop().expect("end-count stack underflow");
        for _ in 0..pending {
            let jump = self.end_jumps.pop().expect("end-jump stack underflow");
            self.patch_to_here(jump, line)?;
        }
        Ok(())
    }

    fn conditional(
        &mut self,
        branches: &[ast::CondBranch],
        otherwise: Option<&[ast::Statement]>,
    ) -> ProgramResult<()> {
        let first = &branches[0];
        let line = self.line_at(first.pos);
        let guard = self.expression(&first.guard, line)?;
        self.guard_jump(&guard, line)?;
        self.push_loop_context();
        for statement in &first.body {
            self.statement(statement)?;
        }

        for branch in &branches[1..] {
            let line = self.line_at(branch.pos);
            // Close the previous arm: queue a jump to the end, then
            // land the previous GOTOF here.
            self.end_jumps.push(self.quads.instr_ptr());
            *self.end_count.last_mut().expect("end-count stack underflow") += 1;
            self.quads.emit(Op::Goto, None, None, None);
            let last_jump = self.jumps.pop().expect("jump stack underflow");
            self.patch_to_here(last_jump, line)?;

            let guard = self.expression(&branch.guard, line)?;
            self.guard_jump(&guard, line)?;
            for statement in &branch.body {
                self.statement(statement)?;
            }
        }

        if let Some(body) = otherwise {
            let line = self.line_at(first.pos);
            let goto_index = self.quads.instr_ptr();
            self.quads.emit(Op::Goto, None, None, None);
            let last_jump = self.jumps.pop().expect("jump stack underflow");
            self.jumps.push(goto_index);
            self.patch_to_here(last_jump, line)?;
            for statement in body {
                self.statement(statement)?;
            }
        }

        let line = self.line_at(first.pos);
        self.pop_loop_context(line)?;
        let last_jump = self.jumps.pop().expect("jump stack underflow");
        self.patch_to_here(last_jump, line)
    }

    fn while_loop(
        &mut self,
        pos: usize,
        cond: &ast::Expr,
        body: &[ast::Statement],
    ) -> ProgramResult<()> {
        let line = self.line_at(pos);
        // Loop top first: the guard re-evaluates on every iteration.
        self.jumps.push(self.quads.instr_ptr());
        let guard = self.expression(cond, line)?;
        self.guard_jump(&guard, line)?;

        self.push_loop_context();
        for statement in body {
            self.statement(statement)?;
        }
        self.pop_loop_context(line)?;

        let exit_jump = self.jumps.pop().expect("jump stack underflow");
        let loop_top = self.jumps.pop().expect("jump stack underflow");
        let back = self.constant(Value::Int(loop_top as i64), line)?;
        self.quads.emit(Op::Goto, None, None, Some(back));
        self.patch_to_here(exit_jump, line)
    }

    fn for_loop(
        &mut self,
        pos: usize,
        var: &str,
        from: &ast::Expr,
        to: &ast::Expr,
        body: &[ast::Statement],
    ) -> ProgramResult<()> {
        let line = self.line_at(pos);
        let counter = self.lookup(var, line)?;
        if counter.ty != Type::Int {
            return Err(ProgramError::at(
                ErrorKind::TypeMismatch,
                line,
                "Variable in for loop should be an integer",
            ));
        }

        // Initialize the counter, then remember the loop top.
        let from_operand = self.expression(from, line)?;
        let (from_ty, from_address) = self.parts(&from_operand, line)?;
        result_type(&counter.ty, Op::Assign, &from_ty).ok_or_else(|| mismatch(line))?;
        self.quads
            .emit(Op::Assign, Some(from_address), None, Some(counter.address));
        self.jumps.push(self.quads.instr_ptr());

        // Guard: counter < bound.
        let to_operand = self.expression(to, line)?;
        let (to_ty, to_address) = self.parts(&to_operand, line)?;
        let guard_ty = result_type(&counter.ty, Op::Lt, &to_ty).ok_or_else(|| mismatch(line))?;
        let guard = self.temp(&guard_ty, line)?;
        self.quads
            .emit(Op::Lt, Some(counter.address), Some(to_address), Some(guard));
        self.jumps.push(self.quads.instr_ptr());
        self.quads.emit(Op::GotoF, Some(guard), None, None);

        self.push_loop_context();
        for statement in body {
            self.statement(statement)?;
        }
        self.pop_loop_context(line)?;

        let exit_jump = self.jumps.pop().expect("jump stack underflow");
        let loop_top = self.jumps.pop().expect("jump stack underflow");

        // counter = counter + 1. The increment temporary lives in
        // global memory, and the copy-back carries the constant in its
        // unused right field; both quirks are part of the program image
        // format and kept as-is.
        let one = self.constant(Value::Int(1), line)?;
        let sum_ty =
            result_type(&counter.ty, Op::Add, &Type::Int).ok_or_else(|| mismatch(line))?;
        let sum = self
            .global_memory
            .borrow_mut()
            .reserve(&sum_ty, 1)
            .map_err(|e| ProgramError::at(ErrorKind::UnsupportedOperation, line, e.to_string()))?;
        self.quads
            .emit(Op::Add, Some(counter.address), Some(one), Some(sum));
        self.quads
            .emit(Op::Assign, Some(sum), Some(one), Some(counter.address));

        let back = self.constant(Value::Int(loop_top as i64), line)?;
        self.quads.emit(Op::Goto, None, None, Some(back));
        self.patch_to_here(exit_jump, line)
    }

    fn print(&mut self, pos: usize, args: &[ast::Expr]) -> ProgramResult<()> {
        let line = self.line_at(pos);
        for arg in args {
            let operand = self.expression(arg, line)?;
            if let Operand::Void = operand {
                return Err(ProgramError::at(
                    ErrorKind::UnsupportedOperation,
                    line,
                    "A void function cannot be called inside a print statement",
                ));
            }
            let (_, address) = self.parts(&operand, line)?;
            self.quads.emit(Op::Print, None, None, Some(address));
        }
        Ok(())
    }

    fn read(&mut self, pos: usize, target: &ast::Var) -> ProgramResult<()> {
        let line = self.line_at(pos);
        let variable = self.variable(target)?;
        if !variable.ty.is_simple() {
            return Err(ProgramError::at(
                ErrorKind::UnsupportedOperation,
                line,
                format!("Cannot read into '{}' because it is not a simple variable", variable.name),
            ));
        }
        self.quads.emit(Op::Read, None, None, Some(variable.address));
        Ok(())
    }

    fn return_statement(&mut self, pos: usize, value: &ast::Expr) -> ProgramResult<()> {
        let line = self.line_at(pos);
        let operand = self.expression(value, line)?;
        let name = self.function_stack.last().cloned().ok_or_else(|| {
            ProgramError::at(
                ErrorKind::UnsupportedOperation,
                line,
                "Return statements must be inside a function",
            )
        })?;
        let function = self.functions.get(&name)?.clone();
        if function.return_type.is_none() {
            return Err(ProgramError::at(
                ErrorKind::UnsupportedOperation,
                line,
                format!(
                    "A return statement cannot be used inside function '{}' because it is of type void",
                    name
                ),
            ));
        }
        let wrong_type = || {
            ProgramError::at(
                ErrorKind::ReturnTypeMismatch,
                line,
                format!(
                    "The item returned for the function '{}' does not match its expected return type",
                    name
                ),
            )
        };
        let (ty, address) = match operand {
            Operand::Void => return Err(wrong_type()),
            operand => self.parts(&operand, line)?,
        };
        match (function.return_address, &function.return_type) {
            (Some(slot), Some(expected)) if *expected == ty => {
                self.quads.emit(Op::Assign, Some(address), None, Some(slot));
                self.quads.emit(Op::EndFunc, None, None, None);
                self.functions.get_mut(&name)?.return_present = true;
                Ok(())
            }
            _ => Err(wrong_type()),
        }
    }

    /*
     * Expressions
     */

    fn expression(&mut self, expr: &ast::Expr, line: usize) -> ProgramResult<Operand> {
        match expr {
            ast::Expr::Const(constant) => {
                let value = match constant {
                    ast::Const::Int(i) => Value::Int(*i),
                    ast::Const::Float(f) => Value::Float(*f),
                    ast::Const::Str(s) => Value::Str(s.clone()),
                    ast::Const::Bool(b) => Value::Bool(*b),
                };
                let ty = value.type_of();
                let address = self.constant(value, line)?;
                Ok(Operand::Temp { ty, address })
            }
            ast::Expr::Variable(var) => Ok(Operand::Var(self.variable(var)?)),
            ast::Expr::Call(call) => self.call(call),
            ast::Expr::BinOp {
                pos,
                op,
                left,
                right,
            } => {
                let line = self.line_at(*pos);
                let left = self.expression(left, line)?;
                let right = self.expression(right, line)?;
                let (left_ty, left_address) = self.parts(&left, line)?;
                let (right_ty, right_address) = self.parts(&right, line)?;
                let ty = result_type(&left_ty, Op::from(*op), &right_ty)
                    .ok_or_else(|| mismatch(line))?;
                let address = self.temp(&ty, line)?;
                self.quads.emit(
                    Op::from(*op),
                    Some(left_address),
                    Some(right_address),
                    Some(address),
                );
                Ok(Operand::Temp { ty, address })
            }
        }
    }

    fn call(&mut self, call: &ast::Call) -> ProgramResult<Operand> {
        let line = self.line_at(call.pos);
        if !self.functions.contains(&call.name) {
            return Err(ProgramError::at(
                ErrorKind::UndeclaredIdentifier,
                line,
                format!("The function named '{}' was not declared", call.name),
            ));
        }
        let function = self.functions.get(&call.name)?.clone();
        if function.parameters.len() != call.args.len() {
            return Err(ProgramError::at(
                ErrorKind::MissingRequiredArgument,
                line,
                format!(
                    "The amount of call arguments does not match the amount of parameters for function '{}'",
                    call.name
                ),
            ));
        }

        // Arguments evaluate before ERA: a nested call must be done
        // with the pending activation before this one is allocated.
        let mut arguments = Vec::new();
        for arg in &call.args {
            arguments.push(self.expression(arg, line)?);
        }

        self.quads.emit(Op::Era, None, None, Some(function.address));
        for (parameter, argument) in function.parameters.iter().zip(&arguments) {
            let (ty, address) = self.parts(argument, line)?;
            if ty != parameter.ty && !(parameter.ty == Type::Float && ty == Type::Int) {
                return Err(ProgramError::at(
                    ErrorKind::TypeMismatch,
                    line,
                    format!(
                        "One or more call arguments in function '{}' do not match the parameter types",
                        call.name
                    ),
                ));
            }
            self.quads
                .emit(Op::Param, Some(address), None, Some(parameter.address));
        }
        self.quads
            .emit(Op::Gosub, None, None, Some(function.address));

        match (function.return_type, function.return_address) {
            (Some(ty), Some(slot)) => {
                let address = self.temp(&ty, line)?;
                self.quads.emit(Op::Assign, Some(slot), None, Some(address));
                Ok(Operand::Temp { ty, address })
            }
            _ => Ok(Operand::Void),
        }
    }

    // Resolve a storage reference. Indexed references compile the
    // bounds checks and the linearization, and yield a fresh variable
    // whose address is a ptr cell holding the element's address.
    fn variable(&mut self, var: &ast::Var) -> ProgramResult<Variable> {
        let line = self.line_at(var.pos());
        match var {
            ast::Var::Plain { name, .. } => self.lookup(name, line),
            ast::Var::Attribute { object, field, .. } => {
                self.lookup(&format!("{}.{}", object, field), line)
            }
            ast::Var::Index { name, indices, .. } => {
                let base = self.lookup(name, line)?;
                let array = base.array.clone().ok_or_else(|| {
                    ProgramError::at(
                        ErrorKind::UnsupportedOperation,
                        line,
                        format!("Cannot index the variable '{}' because it is not an array", name),
                    )
                })?;
                if indices.len() != array.dimensions.len() {
                    return Err(ProgramError::at(
                        ErrorKind::ArrayIndexOutOfBounds,
                        line,
                        format!("Wrong indexing when trying to access '{}'", name),
                    ));
                }

                // All index expressions evaluate before any check.
                let mut operands = Vec::new();
                for index in indices {
                    operands.push(self.expression(index, line)?);
                }

                let lower = self.constant(Value::Int(0), line)?;
                let last = array.dimensions.len() - 1;
                let mut addresses: Vec<usize> = Vec::new();
                for (i, (dim, operand)) in array.dimensions.iter().zip(&operands).enumerate() {
                    let (ty, address) = self.parts(operand, line)?;
                    if ty != Type::Int {
                        return Err(ProgramError::at(
                            ErrorKind::UnsupportedOperation,
                            line,
                            format!("Cannot index '{}' with a non-int expression", name),
                        ));
                    }
                    addresses.push(address);
                    let upper = self.constant(Value::Int(dim.upper), line)?;
                    let stride = self.constant(Value::Int(dim.m), line)?;
                    self.quads
                        .emit(Op::Ver, Some(address), Some(lower), Some(upper));
                    if i > 0 {
                        let current = addresses.pop().expect("address stack underflow");
                        let previous = addresses.pop().expect("address stack underflow");
                        let sum = self.temp(&Type::Int, line)?;
                        self.quads
                            .emit(Op::Add, Some(previous), Some(current), Some(sum));
                        addresses.push(sum);
                    }
                    if i < last {
                        let scaled = self.temp(&Type::Int, line)?;
                        let offset = addresses.pop().expect("address stack underflow");
                        self.quads
                            .emit(Op::Mul, Some(offset), Some(stride), Some(scaled));
                        addresses.push(scaled);
                    }
                }

                // Absolute element address, materialized into a ptr
                // cell the VM dereferences on use.
                let base_address = self.constant(Value::Int(base.address as i64), line)?;
                let offset = addresses.pop().expect("address stack underflow");
                let sum = self.temp(&Type::Int, line)?;
                self.quads
                    .emit(Op::Add, Some(offset), Some(base_address), Some(sum));
                let pointer = self.temp(&Type::Ptr, line)?;
                self.quads.emit(Op::Ptr, Some(sum), None, Some(pointer));
                Ok(Variable {
                    name: base.name,
                    ty: base.ty,
                    address: pointer,
                    array: None,
                })
            }
        }
    }
}

fn mismatch(line: usize) -> ProgramError {
    ProgramError::at(
        ErrorKind::TypeMismatch,
        line,
        "Operand does not match data type",
    )
}

fn redeclared(name: &str, line: usize) -> ProgramError {
    ProgramError::at(
        ErrorKind::RedeclarationError,
        line,
        format!("There is already a variable named '{}' in the directory", name),
    )
}

fn undeclared(name: &str, line: usize) -> ProgramError {
    ProgramError::at(
        ErrorKind::UndeclaredIdentifier,
        line,
        format!("The variable '{}' has not been declared", name),
    )
}

// Stamp a line onto an error raised below the statement level.
fn stamp(line: usize) -> impl Fn(ProgramError) -> ProgramError {
    move |mut error| {
        if error.line.is_none() {
            error.line = Some(line);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Resources;
    use pretty_assertions::assert_eq;

    fn compile(source: &str) -> Compiler {
        match Compiler::compile(source) {
            Ok(compiler) => compiler,
            Err(e) => panic!("compilation failed: {}", e),
        }
    }

    fn compile_err(source: &str) -> ProgramError {
        match Compiler::compile(source) {
            Ok(_) => panic!("compilation unexpectedly succeeded"),
            Err(e) => e,
        }
    }

    // The int value of a constant-pool cell, for following jumps.
    fn constant_at(compiler: &Compiler, address: usize) -> i64 {
        match compiler.constant_memory.borrow().get(address) {
            Some(Value::Int(i)) => *i,
            other => panic!("expected int constant at {}, got {:?}", address, other),
        }
    }

    #[test]
    fn test_prologue_and_epilogue() {
        let compiler = compile("main() { }");
        let era = compiler.quads.get(0).unwrap();
        let gosub = compiler.quads.get(1).unwrap();
        assert_eq!(era.op, Op::Era);
        assert_eq!(gosub.op, Op::Gosub);
        // Both carry the address of the pooled name "main".
        assert_eq!(era.result, gosub.result);
        let name = era.result.unwrap();
        assert_eq!(
            compiler.global_memory.borrow().get(name),
            Some(&Value::Str("main".to_string()))
        );
        assert_eq!(
            compiler.quads.get(compiler.quads.len() - 1).unwrap().op,
            Op::EndProg
        );
        assert_eq!(
            compiler.functions.get("main").unwrap().initial_quad_address,
            2
        );
    }

    #[test]
    fn test_expression_quads() {
        let compiler = compile("main() { var int: a; a = 3 + 4 * 2; }");
        let ops: Vec<Op> = compiler.quads.iter().map(|q| q.op).collect();
        assert_eq!(
            ops,
            vec![Op::Era, Op::Gosub, Op::Mul, Op::Add, Op::Assign, Op::EndProg]
        );
        // 4 * 2 evaluates first; its temporary feeds the addition.
        let mul = compiler.quads.get(2).unwrap().clone();
        let add = compiler.quads.get(3).unwrap().clone();
        assert_eq!(add.right, mul.result);
    }

    #[test]
    fn test_while_backpatching() {
        let compiler = compile("main() { var int: i; i = 0; while (i < 3) { i = i + 1; } }");
        let quads: Vec<Quad> = compiler.quads.iter().cloned().collect();
        let gotof = quads.iter().position(|q| q.op == Op::GotoF).unwrap();
        let goto = quads.iter().rposition(|q| q.op == Op::Goto).unwrap();
        // The back-edge returns to the guard evaluation, and the exit
        // jump lands just past the back-edge.
        let back = constant_at(&compiler, quads[goto].result.unwrap());
        let exit = constant_at(&compiler, quads[gotof].result.unwrap());
        assert!(back < gotof as i64);
        assert_eq!(exit, goto as i64 + 1);
    }

    #[test]
    fn test_conditional_backpatching() {
        let compiler = compile(
            "main() { var int: a; a = 1; if (a > 0) { print(1); } else { print(2); } print(3); }",
        );
        let quads: Vec<Quad> = compiler.quads.iter().cloned().collect();
        let gotof = quads.iter().position(|q| q.op == Op::GotoF).unwrap();
        let goto = quads.iter().position(|q| q.op == Op::Goto).unwrap();
        // The false edge lands after the end-of-arm jump; the jump
        // skips the else arm entirely.
        assert_eq!(constant_at(&compiler, quads[gotof].result.unwrap()), goto as i64 + 1);
        let join = constant_at(&compiler, quads[goto].result.unwrap()) as usize;
        assert_eq!(quads[join].op, Op::Print);
        assert!(join > goto + 1);
    }

    #[test]
    fn test_nested_conditionals() {
        // Each nesting level drains only its own end-jumps.
        let compiler = compile(
            "main() {\n\
             var int: a;\n\
             a = 1;\n\
             if (a > 0) {\n\
               if (a > 1) { print(1); } elseif (a > 2) { print(2); } else { print(3); }\n\
             } else { print(4); }\n\
             }",
        );
        // Every GOTO and GOTOF was patched with a real target.
        for quad in compiler.quads.iter() {
            if quad.op == Op::Goto || quad.op == Op::GotoF {
                let target = constant_at(&compiler, quad.result.unwrap());
                assert!(target >= 0 && (target as usize) <= compiler.quads.len());
            }
        }
    }

    #[test]
    fn test_for_loop_shape() {
        let compiler = compile("main() { var int: i; for i = 0 to 3 do { print(i); } }");
        let ops: Vec<Op> = compiler.quads.iter().map(|q| q.op).collect();
        assert_eq!(
            ops,
            vec![
                Op::Era,
                Op::Gosub,
                Op::Assign, // i = 0
                Op::Lt,     // i < 3
                Op::GotoF,
                Op::Print,
                Op::Add,    // i + 1
                Op::Assign, // copy back
                Op::Goto,
                Op::EndProg,
            ]
        );
        // The guard re-evaluates from the comparison, not the init.
        let goto = compiler.quads.get(8).unwrap();
        assert_eq!(constant_at(&compiler, goto.result.unwrap()), 3);
        // The increment temporary is a global cell.
        let add = compiler.quads.get(6).unwrap();
        assert!(add.result.unwrap() < CONSTANT_BASE);
    }

    #[test]
    fn test_function_resources_snapshot() {
        let compiler = compile(
            "int function inc(int n) { return n + 1; }\n\
             main() { print(inc(1)); }",
        );
        let function = compiler.functions.get("inc").unwrap();
        // One int param plus one int temporary for n + 1.
        assert_eq!(
            function.resources,
            Resources {
                ints: 2,
                ..Resources::default()
            }
        );
        assert!(function.return_present);
        // The temporal page was cleared after the function; main's
        // footprint counts only its own cells.
        let main = compiler.functions.get("main").unwrap();
        assert_eq!(main.resources.ints, 1);
    }

    #[test]
    fn test_array_indexing_quads() {
        let compiler = compile("main() { var int: a[3]; a[1] = 10; }");
        let ops: Vec<Op> = compiler.quads.iter().map(|q| q.op).collect();
        assert_eq!(
            ops,
            vec![Op::Era, Op::Gosub, Op::Ver, Op::Add, Op::Ptr, Op::Assign, Op::EndProg]
        );
        let ver = compiler.quads.get(2).unwrap();
        assert_eq!(constant_at(&compiler, ver.right.unwrap()), 0);
        assert_eq!(constant_at(&compiler, ver.result.unwrap()), 3);
        // The assignment writes through the ptr temporary.
        let assign = compiler.quads.get(5).unwrap();
        let ptr = compiler.quads.get(4).unwrap();
        assert_eq!(assign.result, ptr.result);
    }

    #[test]
    fn test_two_dimensional_indexing() {
        let compiler = compile("main() { var int: m[2][3]; m[1][2] = 5; }");
        let ops: Vec<Op> = compiler.quads.iter().map(|q| q.op).collect();
        assert_eq!(
            ops,
            vec![
                Op::Era,
                Op::Gosub,
                Op::Ver, // first index
                Op::Mul, // scale by stride 3
                Op::Ver, // second index
                Op::Add, // combine offsets
                Op::Add, // add base address
                Op::Ptr,
                Op::Assign,
                Op::EndProg,
            ]
        );
    }

    #[test]
    fn test_object_assignment_expands() {
        let compiler = compile(
            "Class P { int: x, int: y };\n\
             main() { var P: p1, p2; p1.x = 1; p1.y = 2; p2 = p1; }",
        );
        let assigns: Vec<Quad> = compiler
            .quads
            .iter()
            .filter(|q| q.op == Op::Assign)
            .cloned()
            .collect();
        // Two attribute writes plus two copies for p2 = p1.
        assert_eq!(assigns.len(), 4);
        let copy_targets: Vec<usize> = assigns[2..].iter().map(|q| q.result.unwrap()).collect();
        assert_eq!(copy_targets.len(), 2);
        assert_ne!(copy_targets[0], copy_targets[1]);
    }

    #[test]
    fn test_errors() {
        let e = compile_err("main() { a = 1; }");
        assert_eq!(e.kind, ErrorKind::UndeclaredIdentifier);
        assert_eq!(e.line, Some(1));

        let e = compile_err("main() { var int: a; var int: a; }");
        assert_eq!(e.kind, ErrorKind::RedeclarationError);

        let e = compile_err("main() { var int: a; a = \"x\"; }");
        assert_eq!(e.kind, ErrorKind::TypeMismatch);

        let e = compile_err("main() { var bool: b; b = 1 + true; }");
        assert_eq!(e.kind, ErrorKind::TypeMismatch);

        let e = compile_err("main() { if (1) { print(1); } }");
        assert_eq!(e.kind, ErrorKind::TypeMismatch);

        let e = compile_err("int function f() { print(1); }\nmain() { }");
        assert_eq!(e.kind, ErrorKind::ReturnStatementMissing);

        let e = compile_err("int function f() { return 1.5; }\nmain() { }");
        assert_eq!(e.kind, ErrorKind::ReturnTypeMismatch);

        let e = compile_err("main() { return 1; }");
        assert_eq!(e.kind, ErrorKind::UnsupportedOperation);

        let e = compile_err("main() { print(f()); }");
        assert_eq!(e.kind, ErrorKind::UndeclaredIdentifier);

        let e = compile_err("int function f(int n) { return n; }\nmain() { print(f()); }");
        assert_eq!(e.kind, ErrorKind::MissingRequiredArgument);

        let e = compile_err(
            "void function f() { print(1); }\nmain() { print(f()); }",
        );
        assert_eq!(e.kind, ErrorKind::UnsupportedOperation);

        let e = compile_err("main() { var int: a[2]; a[0][1] = 1; }");
        assert_eq!(e.kind, ErrorKind::ArrayIndexOutOfBounds);

        let e = compile_err("main() { var int: a; a[0] = 1; }");
        assert_eq!(e.kind, ErrorKind::UnsupportedOperation);

        let e = compile_err(
            "Class P { int: x };\nClass Q { int: x };\nmain() { var P: p; var Q: q; p = q; }",
        );
        assert_eq!(e.kind, ErrorKind::TypeMismatch);

        let e = compile_err("main() { var Missing: m; }");
        assert_eq!(e.kind, ErrorKind::UndeclaredIdentifier);
    }

    #[test]
    fn test_int_widens_into_float_slot() {
        let compiler = compile("main() { var float: f; f = 1; }");
        let assigns: Vec<&Quad> = compiler
            .quads
            .iter()
            .filter(|q| q.op == Op::Assign)
            .collect();
        assert_eq!(assigns.len(), 1);
    }

    #[test]
    fn test_temporal_cleared_between_functions() {
        let compiler = compile(
            "int function f(int a) { return a; }\n\
             int function g(int a, int b) { return a + b; }\n\
             main() { print(g(f(1), 2)); }",
        );
        assert_eq!(compiler.functions.get("f").unwrap().resources.ints, 1);
        // g: two params plus one temporary.
        assert_eq!(compiler.functions.get("g").unwrap().resources.ints, 3);
    }

    #[test]
    fn test_nested_call_order() {
        let compiler = compile(
            "int function f(int a) { return a; }\n\
             main() { print(f(f(1))); }",
        );
        // The inner call completes (ERA PARAM GOSUB =) before the
        // outer ERA; a single pending activation suffices.
        let ops: Vec<Op> = compiler
            .quads
            .iter()
            .map(|q| q.op)
            .filter(|op| matches!(op, Op::Era | Op::Param | Op::Gosub))
            .collect();
        assert_eq!(
            ops,
            vec![Op::Era, Op::Param, Op::Gosub, Op::Era, Op::Param, Op::Gosub]
        );
    }
}
