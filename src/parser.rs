// Front door of the compiler: source text to AST.
//
// Grammar errors are folded into the SYNTAX_ERROR kind with the line
// of the offending token, so the driver reports them exactly like the
// semantic errors raised during code generation.

use lalrpop_util::ParseError;

use crate::ast::Program;
use crate::error::{line_of, ErrorKind, ProgramError, ProgramResult};
use crate::grammar;

pub fn parse(source: &str) -> ProgramResult<Program> {
    grammar::ProgramParser::new()
        .parse(source)
        .map_err(|e| syntax_error(source, e))
}

fn syntax_error<T: std::fmt::Display>(
    source: &str,
    error: ParseError<usize, T, &str>,
) -> ProgramError {
    let (offset, what) = match error {
        ParseError::UnrecognizedToken { token, .. } | ParseError::ExtraToken { token } => {
            (token.0, format!("Invalid syntax in value '{}'", token.1))
        }
        ParseError::InvalidToken { location } => (location, "Invalid token".to_string()),
        // Unexpected end of file, or a user-raised error; point at the
        // end of the source.
        other => (source.len(), other.to_string()),
    };
    ProgramError::at(ErrorKind::SyntaxError, line_of(source, offset), what)
}
