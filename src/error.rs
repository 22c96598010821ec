// Program errors.
//
// Both phases report through the same type. A compile-time error carries
// the source line that produced it; a run-time error carries no line,
// because quadruples are not line-stamped.

use std::fmt;

use strum::{Display, EnumString};

pub type ProgramResult<T> = std::result::Result<T, ProgramError>;

// The closed set of error kinds. The serialized form is the tag that
// appears in object files and on stderr.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    SyntaxError,
    TypeMismatch,
    UndeclaredIdentifier,
    RedeclarationError,
    MissingRequiredArgument,
    ReturnTypeMismatch,
    ReturnStatementMissing,
    UnsupportedOperation,
    ArrayIndexOutOfBounds,
    ArithmeticException,
    InputTypeMismatch,
    VariableNotInitialized,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProgramError {
    pub kind: ErrorKind,
    pub line: Option<usize>,
    pub description: String,
}

impl std::error::Error for ProgramError {}

impl ProgramError {
    // A compile-time error, stamped with a source line.
    pub fn at(kind: ErrorKind, line: usize, description: impl Into<String>) -> ProgramError {
        ProgramError {
            kind,
            line: Some(line),
            description: description.into(),
        }
    }

    // A run-time error.
    pub fn runtime(kind: ErrorKind, description: impl Into<String>) -> ProgramError {
        ProgramError {
            kind,
            line: None,
            description: description.into(),
        }
    }
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} at line {}: {}.", self.kind, line, self.description),
            None => write!(f, "{}: {}", self.kind, self.description),
        }
    }
}

// 1-based line number of a byte offset into the source.
pub fn line_of(source: &str, offset: usize) -> usize {
    let end = offset.min(source.len());
    source[..end].bytes().filter(|b| *b == b'\n').count() + 1
}

// Render a five-line window around the offending line, two lines of
// context above and below, the offending line marked with an arrow.
pub fn source_window(source: &str, line: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if line == 0 || line > lines.len() {
        return String::new();
    }
    let first = line.saturating_sub(2).max(1);
    let last = (line + 2).min(lines.len());
    let mut out = String::new();
    for n in first..=last {
        let marker = if n == line { "-->" } else { "   " };
        out.push_str(&format!("{} {:>4} | {}\n", marker, n, lines[n - 1]));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(ErrorKind::SyntaxError.to_string(), "SYNTAX_ERROR");
        assert_eq!(ErrorKind::TypeMismatch.to_string(), "TYPE_MISMATCH");
        assert_eq!(
            ErrorKind::ArrayIndexOutOfBounds.to_string(),
            "ARRAY_INDEX_OUT_OF_BOUNDS"
        );
        assert_eq!(
            "VARIABLE_NOT_INITIALIZED".parse::<ErrorKind>(),
            Ok(ErrorKind::VariableNotInitialized)
        );
    }

    #[test]
    fn test_display() {
        let e = ProgramError::at(ErrorKind::TypeMismatch, 3, "Operand does not match data type");
        assert_eq!(
            e.to_string(),
            "TYPE_MISMATCH at line 3: Operand does not match data type."
        );

        let e = ProgramError::runtime(ErrorKind::ArithmeticException, "Cannot divide a number by zero");
        assert_eq!(
            e.to_string(),
            "ARITHMETIC_EXCEPTION: Cannot divide a number by zero"
        );
    }

    #[test]
    fn test_line_of() {
        let src = "a\nbb\nccc\n";
        assert_eq!(line_of(src, 0), 1);
        assert_eq!(line_of(src, 2), 2);
        assert_eq!(line_of(src, 5), 3);
    }

    #[test]
    fn test_source_window() {
        let src = "one\ntwo\nthree\nfour\nfive\nsix";
        let w = source_window(src, 3);
        let lines: Vec<&str> = w.lines().collect();
        assert_eq!(lines.len(), 5);
        assert!(lines[0].ends_with("1 | one"));
        assert!(lines[2].starts_with("-->"));
        assert!(lines[2].ends_with("3 | three"));
        assert!(lines[4].ends_with("5 | five"));

        // Window clamps at the edges of the file.
        assert_eq!(source_window(src, 1).lines().count(), 3);
        assert_eq!(source_window(src, 6).lines().count(), 3);
        assert_eq!(source_window(src, 99), "");
    }
}
