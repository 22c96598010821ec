// The object-file codec.
//
// The compiler writes, and the VM parses back, a line-oriented text
// format with exact section headers:
//
//   --Global Memory--      addr-value lines, value may be None
//   --Constants--          addr-value lines
//   --Functions--          name,return_type,(i,f,s,b,p),initial_ip
//   --Quadruples--         (op,left,right,result)
//
// Strings are double-quoted so the memory-line dash split stays
// unambiguous; the type of every cell is recovered from its address
// alone. A failed compilation produces a file whose first line is the
// marker ADEO COMPILATION ERROR; the VM refuses to execute it.

use regex::Regex;
use thiserror::Error;

use crate::compiler::Compiler;
use crate::error::{source_window, ProgramError};
use crate::functions::VmFunctionDirectory;
use crate::memory::{
    type_from_address, MemoryManager, Resources, Type, Value, CONSTANT_BASE, GLOBAL_BASE,
};
use crate::quadruples::{Quad, Quadruples};

pub const ERROR_MARKER: &str = "ADEO COMPILATION ERROR";

const GLOBAL_HEADER: &str = "--Global Memory--";
const CONSTANTS_HEADER: &str = "--Constants--";
const FUNCTIONS_HEADER: &str = "--Functions--";
const CLASSES_HEADER: &str = "--Classes--";
const QUADRUPLES_HEADER: &str = "--Quadruples--";

#[derive(Clone, Debug, PartialEq, Error)]
pub enum ObjectError {
    #[error("the object file records a failed compilation")]
    CompilationError,
    #[error("malformed object file: {0}")]
    Malformed(String),
}

// Everything the VM needs, parsed back out of an object file.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectProgram {
    pub global: MemoryManager,
    pub constants: MemoryManager,
    pub functions: VmFunctionDirectory,
    pub quads: Quadruples,
}

/*
 * Writing
 */

fn value_field(value: Option<&Value>) -> String {
    match value {
        None => "None".to_string(),
        Some(Value::Str(s)) => format!("\"{}\"", s),
        Some(v) => v.to_string(),
    }
}

fn memory_section(out: &mut String, header: &str, memory: &MemoryManager) {
    out.push_str(header);
    out.push('\n');
    for (address, value) in memory.cells() {
        out.push_str(&format!("{}-{}\n", address, value_field(value)));
    }
}

// Serialize a compiled program image.
pub fn write_object(compiler: &Compiler) -> String {
    let mut out = String::new();
    memory_section(&mut out, GLOBAL_HEADER, &compiler.global_memory.borrow());
    memory_section(&mut out, CONSTANTS_HEADER, &compiler.constant_memory.borrow());

    out.push_str(FUNCTIONS_HEADER);
    out.push('\n');
    for function in compiler.functions.iter() {
        let return_type = match &function.return_type {
            Some(ty) => ty.to_string(),
            None => "void".to_string(),
        };
        out.push_str(&format!(
            "{},{},{},{}\n",
            function.name, return_type, function.resources, function.initial_quad_address
        ));
    }

    out.push_str(QUADRUPLES_HEADER);
    out.push('\n');
    for quad in compiler.quads.iter() {
        out.push_str(&quad.to_string());
        out.push('\n');
    }
    out
}

// Serialize a failed compilation: the marker line, the diagnostic, and
// a window of the offending source.
pub fn write_error(source: &str, error: &ProgramError) -> String {
    let mut out = format!("{}\n{}\n", ERROR_MARKER, error);
    if let Some(line) = error.line {
        out.push_str(&source_window(source, line));
    }
    out
}

/*
 * Parsing
 */

fn parse_value(ty: &Type, text: &str) -> Result<Option<Value>, ObjectError> {
    if text == "None" {
        return Ok(None);
    }
    let malformed = || ObjectError::Malformed(format!("bad value '{}' for type '{}'", text, ty));
    let value = match ty {
        Type::Int => Value::Int(text.parse().map_err(|_| malformed())?),
        Type::Float => Value::Float(text.parse().map_err(|_| malformed())?),
        Type::Str => {
            let inner = text
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .ok_or_else(malformed)?;
            Value::Str(inner.to_string())
        }
        Type::Bool => match text {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => return Err(malformed()),
        },
        Type::Ptr => Value::Ptr(text.parse().map_err(|_| malformed())?),
        Type::Object(_) => return Err(malformed()),
    };
    Ok(Some(value))
}

fn load_memory_line(memory: &mut MemoryManager, line: &str) -> Result<(), ObjectError> {
    lazy_static! {
        static ref MEMORY_LINE: Regex = Regex::new(r"^(\d+)-(.*)$").unwrap();
    }
    let captures = MEMORY_LINE
        .captures(line)
        .ok_or_else(|| ObjectError::Malformed(format!("bad memory line '{}'", line)))?;
    let address: usize = captures[1]
        .parse()
        .map_err(|_| ObjectError::Malformed(format!("bad address in '{}'", line)))?;
    let ty = type_from_address(address);
    let value = parse_value(&ty, &captures[2])?;
    let assigned = memory
        .append(&ty, value)
        .map_err(|e| ObjectError::Malformed(e.to_string()))?;
    if assigned != address {
        return Err(ObjectError::Malformed(format!(
            "memory line '{}' reconstructed at address {}",
            line, assigned
        )));
    }
    Ok(())
}

fn load_function_line(functions: &mut VmFunctionDirectory, line: &str) -> Result<(), ObjectError> {
    // Commas inside the resource quintuple are not separators.
    lazy_static! {
        static ref FUNCTION_TOKEN: Regex = Regex::new(r"\([^)]*\)|[^,]+").unwrap();
    }
    let tokens: Vec<&str> = FUNCTION_TOKEN.find_iter(line).map(|m| m.as_str()).collect();
    if tokens.len() < 4 {
        return Err(ObjectError::Malformed(format!("bad function line '{}'", line)));
    }
    let resources: Resources = tokens[2]
        .parse()
        .map_err(|e: String| ObjectError::Malformed(e))?;
    let initial: usize = tokens[3]
        .parse()
        .map_err(|_| ObjectError::Malformed(format!("bad instruction pointer in '{}'", line)))?;
    functions.add(tokens[0], initial, resources);
    Ok(())
}

// Parse an object file back into the structures the VM executes.
pub fn parse_object(text: &str) -> Result<ObjectProgram, ObjectError> {
    if text.lines().next().map(str::trim) == Some(ERROR_MARKER) {
        return Err(ObjectError::CompilationError);
    }

    let mut global = MemoryManager::new(GLOBAL_BASE);
    let mut constants = MemoryManager::new(CONSTANT_BASE);
    let mut functions = VmFunctionDirectory::new();
    let mut quads = Quadruples::new();

    let mut section: Option<&str> = None;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            GLOBAL_HEADER | CONSTANTS_HEADER | FUNCTIONS_HEADER | CLASSES_HEADER
            | QUADRUPLES_HEADER => {
                section = Some(line);
                continue;
            }
            _ => {}
        }
        match section {
            Some(GLOBAL_HEADER) => load_memory_line(&mut global, line)?,
            Some(CONSTANTS_HEADER) => load_memory_line(&mut constants, line)?,
            Some(FUNCTIONS_HEADER) => load_function_line(&mut functions, line)?,
            Some(CLASSES_HEADER) => {} // carries no runtime content
            Some(QUADRUPLES_HEADER) => {
                let quad: Quad = line
                    .parse()
                    .map_err(|e: String| ObjectError::Malformed(e))?;
                quads.emit(quad.op, quad.left, quad.right, quad.result);
            }
            _ => {
                return Err(ObjectError::Malformed(format!(
                    "content outside any section: '{}'",
                    line
                )))
            }
        }
    }

    Ok(ObjectProgram {
        global,
        constants,
        functions,
        quads,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::error::{ErrorKind, ProgramError};
    use pretty_assertions::assert_eq;

    const PROGRAM: &str = "\
        int function inc(int n) { return n + 1; }\n\
        main() {\n\
            var int: a;\n\
            a = inc(4);\n\
            print(\"a=\", a, \"\\n\");\n\
        }\n";

    #[test]
    fn test_round_trip_preserves_program() {
        let compiler = Compiler::compile(PROGRAM).unwrap();
        let text = write_object(&compiler);
        let program = parse_object(&text).unwrap();

        // Constant pool: same address-to-value mapping.
        for (address, value) in compiler.constant_memory.borrow().cells() {
            assert_eq!(program.constants.get(address), value);
        }
        // Global memory: same shape (values mostly sentinels).
        assert_eq!(
            program.global.resources(),
            compiler.global_memory.borrow().resources()
        );

        // Function directory: entry points and footprints survive.
        for function in compiler.functions.iter() {
            let loaded = program.functions.get(&function.name).unwrap();
            assert_eq!(loaded.initial_quad_address, function.initial_quad_address);
            assert_eq!(loaded.resources, function.resources);
        }

        // Quadruples: bit-for-bit.
        assert_eq!(program.quads.len(), compiler.quads.len());
        for (i, quad) in compiler.quads.iter().enumerate() {
            assert_eq!(program.quads.get(i), Some(quad));
        }
    }

    #[test]
    fn test_sections_in_order() {
        let compiler = Compiler::compile("main() { print(1); }").unwrap();
        let text = write_object(&compiler);
        let global = text.find("--Global Memory--").unwrap();
        let constants = text.find("--Constants--").unwrap();
        let functions = text.find("--Functions--").unwrap();
        let quads = text.find("--Quadruples--").unwrap();
        assert!(global < constants && constants < functions && functions < quads);
        // Every function line carries name first, then the quintuple.
        assert!(text.contains("main,void,("));
    }

    #[test]
    fn test_string_constants_round_trip() {
        let compiler = Compiler::compile("main() { print(\"a-b, (c)\\n\"); }").unwrap();
        let text = write_object(&compiler);
        let program = parse_object(&text).unwrap();
        let found = program
            .constants
            .cells()
            .any(|(_, v)| v == Some(&Value::Str("a-b, (c)\\n".to_string())));
        assert!(found, "string constant lost in round trip:\n{}", text);
    }

    #[test]
    fn test_error_file() {
        let source = "main() {\n  x = 1;\n}\n";
        let error = ProgramError::at(
            ErrorKind::UndeclaredIdentifier,
            2,
            "The variable 'x' has not been declared",
        );
        let text = write_error(source, &error);
        assert!(text.starts_with("ADEO COMPILATION ERROR\n"));
        assert!(text.contains("UNDECLARED_IDENTIFIER at line 2"));
        assert!(text.contains("-->"));
        assert_eq!(parse_object(&text), Err(ObjectError::CompilationError));
    }

    #[test]
    fn test_tolerates_classes_header() {
        let compiler = Compiler::compile("main() { }").unwrap();
        let mut text = write_object(&compiler);
        text.push_str("--Classes--\n");
        assert!(parse_object(&text).is_ok());
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            parse_object("--Quadruples--\n(NOP,None,None,None)\n"),
            Err(ObjectError::Malformed(_))
        ));
        assert!(matches!(
            parse_object("stray line\n"),
            Err(ObjectError::Malformed(_))
        ));
    }
}
