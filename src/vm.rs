// The Adeo virtual machine.
//
// Executes one quadruple per step over three memory images: global
// (shared, mutable), constants (populated from the object file, never
// written), and the current function activation. `ERA` allocates a
// pending activation with the callee's recorded footprint, `PARAM`
// fills it, and `GOSUB` installs it, pushing the previous activation
// and the return address onto the call stack. `ENDFUNC`/`ENDPROG`
// unwind one frame; when the stack empties, the machine halts.
//
// Operand decoding applies exactly one level of pointer indirection:
// an address whose page says `ptr` is replaced by the address stored
// in the cell, except for the result field of `PTR` itself, which is
// where those cells get written.
//
// All errors are fatal. There is no recovery and no partial state.

use std::io::{BufRead, Write};

use crate::codec::ObjectProgram;
use crate::error::{ErrorKind, ProgramError, ProgramResult};
use crate::functions::VmFunctionDirectory;
use crate::memory::{type_from_address, MemoryManager, Type, Value, CONSTANT_BASE, LOCAL_BASE};
use crate::quadruples::{Op, Quad, Quadruples};
use crate::trace;

// One suspended activation: where to resume, and the memory to
// resume with.
struct Frame {
    return_address: usize,
    memory: MemoryManager,
}

// What a single step does to the instruction pointer.
enum ControlFlow {
    Advance,
    Branch(usize),
    Halt,
}

pub struct VirtualMachine {
    global: MemoryManager,
    constants: MemoryManager,
    function_memory: MemoryManager,
    pending_memory: Option<MemoryManager>,
    functions: VmFunctionDirectory,
    quads: Quadruples,
    call_stack: Vec<Frame>,
    pc: usize,
    return_value: Option<Value>,
}

fn uninitialized(address: usize) -> ProgramError {
    ProgramError::runtime(
        ErrorKind::VariableNotInitialized,
        format!("The variable at address '{}' was not initialized", address),
    )
}

fn unsupported(description: impl Into<String>) -> ProgramError {
    ProgramError::runtime(ErrorKind::UnsupportedOperation, description)
}

// A quad field that must be present for its operator.
fn operand(field: Option<usize>) -> ProgramResult<usize> {
    field.ok_or_else(|| unsupported("missing operand in quadruple"))
}

// Decode the common backslash escapes in printed text; anything
// unrecognized passes through untouched.
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

impl VirtualMachine {
    pub fn new(program: ObjectProgram) -> VirtualMachine {
        VirtualMachine {
            global: program.global,
            constants: program.constants,
            function_memory: MemoryManager::new(LOCAL_BASE),
            pending_memory: None,
            functions: program.functions,
            quads: program.quads,
            call_stack: Vec::new(),
            pc: 0,
            return_value: None,
        }
    }

    // Which memory image owns an address, from the address alone.
    fn memory(&self, address: usize) -> &MemoryManager {
        if address >= LOCAL_BASE {
            &self.function_memory
        } else if address >= CONSTANT_BASE {
            &self.constants
        } else {
            &self.global
        }
    }

    fn memory_mut(&mut self, address: usize) -> &mut MemoryManager {
        if address >= LOCAL_BASE {
            &mut self.function_memory
        } else if address >= CONSTANT_BASE {
            &mut self.constants
        } else {
            &mut self.global
        }
    }

    // Apply the single permitted level of pointer indirection.
    fn resolve(&self, address: usize) -> ProgramResult<usize> {
        if type_from_address(address) != Type::Ptr {
            return Ok(address);
        }
        match self.memory(address).get(address) {
            Some(value) => value.as_address().ok_or_else(|| uninitialized(address)),
            None => Err(uninitialized(address)),
        }
    }

    fn read(&self, address: usize) -> ProgramResult<Value> {
        let target = self.resolve(address)?;
        self.memory(target)
            .get(target)
            .cloned()
            .ok_or_else(|| uninitialized(target))
    }

    fn write(&mut self, address: usize, value: Value) -> ProgramResult<()> {
        let target = self.resolve(address)?;
        self.memory_mut(target)
            .set(target, value)
            .map_err(|e| unsupported(e.to_string()))
    }

    // The function name a call quad points at, via global memory.
    fn function_name(&self, address: usize) -> ProgramResult<String> {
        match self.global.get(address) {
            Some(Value::Str(name)) => Ok(name.clone()),
            _ => Err(unsupported(format!(
                "the address '{}' does not hold a function name",
                address
            ))),
        }
    }

    // Run until the program halts; the value of the last assignment
    // is the program's result.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        input: &mut R,
        output: &mut W,
    ) -> ProgramResult<Option<Value>> {
        self.pc = 0;
        loop {
            let quad = match self.quads.get(self.pc) {
                Some(quad) => quad.clone(),
                None => return Ok(self.return_value.take()),
            };
            trace!("{:>4} {}", self.pc, quad);
            // The counter advances before execution; GOSUB saves it as
            // the return address.
            self.pc += 1;
            match self.dispatch(&quad, input, output)? {
                ControlFlow::Advance => {}
                ControlFlow::Branch(target) => self.pc = target,
                ControlFlow::Halt => return Ok(self.return_value.take()),
            }
        }
    }

    fn dispatch<R: BufRead, W: Write>(
        &mut self,
        quad: &Quad,
        input: &mut R,
        output: &mut W,
    ) -> ProgramResult<ControlFlow> {
        match quad.op {
            Op::Assign => {
                let value = self.read(operand(quad.left)?)?;
                self.write(operand(quad.result)?, value.clone())?;
                self.return_value = Some(value);
                Ok(ControlFlow::Advance)
            }

            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::Eq
            | Op::Ne
            | Op::And
            | Op::Or => self.binary(quad),

            Op::Print => {
                let value = self.read(operand(quad.result)?)?;
                write!(output, "{}", unescape(&value.to_string()))
                    .map_err(|e| unsupported(e.to_string()))?;
                Ok(ControlFlow::Advance)
            }

            Op::Read => {
                let mut line = String::new();
                let bytes = input
                    .read_line(&mut line)
                    .map_err(|e| unsupported(e.to_string()))?;
                if bytes == 0 {
                    return Err(ProgramError::runtime(
                        ErrorKind::InputTypeMismatch,
                        "There is no input left to read",
                    ));
                }
                let line = line.trim_end_matches('\n').trim_end_matches('\r');
                let target = self.resolve(operand(quad.result)?)?;
                self.memory_mut(target)
                    .set(target, Value::Str(line.to_string()))
                    .map_err(|_| {
                        ProgramError::runtime(
                            ErrorKind::InputTypeMismatch,
                            "The input cannot be stored in the variable because it is not of the same type",
                        )
                    })?;
                Ok(ControlFlow::Advance)
            }

            Op::Goto => {
                let target = self.jump_target(quad)?;
                Ok(ControlFlow::Branch(target))
            }

            Op::GotoF => {
                let condition = self.read(operand(quad.left)?)?;
                match condition {
                    Value::Bool(false) => {
                        let target = self.jump_target(quad)?;
                        Ok(ControlFlow::Branch(target))
                    }
                    Value::Bool(true) => Ok(ControlFlow::Advance),
                    other => Err(unsupported(format!(
                        "a conditional jump needs a bool, got '{}'",
                        other
                    ))),
                }
            }

            Op::Ver => {
                let index = self.read(operand(quad.left)?)?;
                let lower = self.read(operand(quad.right)?)?;
                let upper = self.read(operand(quad.result)?)?;
                match (&index, &lower, &upper) {
                    (Value::Int(i), Value::Int(lo), Value::Int(up)) => {
                        if i < lo || i >= up {
                            Err(ProgramError::runtime(
                                ErrorKind::ArrayIndexOutOfBounds,
                                format!("The index '{}' is outside of the valid range", i),
                            ))
                        } else {
                            Ok(ControlFlow::Advance)
                        }
                    }
                    _ => Err(unsupported("bounds check on non-int operands")),
                }
            }

            Op::Ptr => {
                let value = self.read(operand(quad.left)?)?;
                let target = value
                    .as_address()
                    .ok_or_else(|| unsupported("a pointer target must be an address"))?;
                // The result field is the ptr cell itself here, never
                // dereferenced.
                let slot = operand(quad.result)?;
                self.memory_mut(slot)
                    .add_ptr(slot, target)
                    .map_err(|e| unsupported(e.to_string()))?;
                Ok(ControlFlow::Advance)
            }

            Op::Era => {
                let name = self.function_name(operand(quad.result)?)?;
                let resources = self.functions.get(&name)?.resources;
                self.pending_memory = Some(MemoryManager::with_resources(LOCAL_BASE, resources));
                Ok(ControlFlow::Advance)
            }

            Op::Param => {
                let value = self.read(operand(quad.left)?)?;
                let target = operand(quad.result)?;
                let pending = self
                    .pending_memory
                    .as_mut()
                    .ok_or_else(|| unsupported("PARAM with no pending activation"))?;
                pending
                    .set(target, value)
                    .map_err(|e| unsupported(e.to_string()))?;
                Ok(ControlFlow::Advance)
            }

            Op::Gosub => {
                let name = self.function_name(operand(quad.result)?)?;
                let function = self.functions.get(&name)?.clone();
                let pending = self
                    .pending_memory
                    .take()
                    .ok_or_else(|| unsupported("GOSUB with no pending activation"))?;
                let previous = std::mem::replace(&mut self.function_memory, pending);
                self.call_stack.push(Frame {
                    return_address: self.pc,
                    memory: previous,
                });
                Ok(ControlFlow::Branch(function.initial_quad_address))
            }

            Op::EndFunc | Op::EndProg => {
                self.function_memory.clear();
                let frame = self
                    .call_stack
                    .pop()
                    .ok_or_else(|| unsupported("return outside any activation"))?;
                self.function_memory = frame.memory;
                if self.call_stack.is_empty() {
                    Ok(ControlFlow::Halt)
                } else {
                    Ok(ControlFlow::Branch(frame.return_address))
                }
            }
        }
    }

    // Jump targets are addresses of int constants holding the target
    // instruction index.
    fn jump_target(&self, quad: &Quad) -> ProgramResult<usize> {
        let value = self.read(operand(quad.result)?)?;
        value
            .as_address()
            .ok_or_else(|| unsupported("a jump target must be an instruction index"))
    }

    fn binary(&mut self, quad: &Quad) -> ProgramResult<ControlFlow> {
        let left = self.read(operand(quad.left)?)?;
        let right = self.read(operand(quad.right)?)?;
        if quad.op == Op::Div && right.is_zero() {
            return Err(ProgramError::runtime(
                ErrorKind::ArithmeticException,
                "Cannot divide a number by zero",
            ));
        }
        let result = match quad.op {
            Op::Add => left.add(&right),
            Op::Sub => left.sub(&right),
            Op::Mul => left.mul(&right),
            Op::Div => left.div(&right),
            Op::Lt => left.lt(&right),
            Op::Le => left.le(&right),
            Op::Gt => left.gt(&right),
            Op::Ge => left.ge(&right),
            Op::Eq => left.eq(&right),
            Op::Ne => left.ne(&right),
            Op::And => left.and(&right),
            Op::Or => left.or(&right),
            _ => return Err(unsupported("not a binary operator")),
        }
        .map_err(|e| unsupported(e.to_string()))?;
        self.write(operand(quad.result)?, result)?;
        Ok(ControlFlow::Advance)
    }
}
