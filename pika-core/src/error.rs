//! Error kinds and single-line diagnostic formatting.

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::value::{SourcePos, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Lexical or syntactic failure at read time.
    Reader,
    /// Semantically malformed special form.
    Malformed,
    /// Symbol lookup failure (including the unassigned sentinel).
    Unbound,
    /// Wrong kind of value for an operation.
    Type,
    /// Wrong number of arguments.
    Arity,
    /// Overflow, NaN, infinity, or an undefined numeric operation.
    Arithmetic,
    /// File or stream failure.
    Io,
    /// A feature that is flagged off.
    NotImplemented,
    /// Invariant violation inside the engine.
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Reader => "read error",
            ErrorKind::Malformed => "malformed form",
            ErrorKind::Unbound => "unbound",
            ErrorKind::Type => "type error",
            ErrorKind::Arity => "wrong argument count",
            ErrorKind::Arithmetic => "arithmetic error",
            ErrorKind::Io => "i/o error",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// Engine error: a kind, a message, an optional reader position, and an
/// optional rendering of the form that was being evaluated.
#[derive(Clone, Debug)]
pub struct LispError {
    pub kind: ErrorKind,
    pub message: String,
    pub pos: Option<SourcePos>,
    pub context: Option<String>,
}

pub type LispResult = Result<Value, LispError>;

impl LispError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> LispError {
        LispError {
            kind,
            message: message.into(),
            pos: None,
            context: None,
        }
    }

    pub fn reader(message: impl Into<String>, pos: Option<SourcePos>) -> LispError {
        LispError {
            kind: ErrorKind::Reader,
            message: message.into(),
            pos,
            context: None,
        }
    }

    pub fn malformed(what: &str, message: impl Into<String>) -> LispError {
        LispError::new(ErrorKind::Malformed, format!("{}: {}", what, message.into()))
    }

    pub fn unbound(name: &str) -> LispError {
        LispError::new(ErrorKind::Unbound, format!("'{}' is not bound", name))
    }

    pub fn unassigned(name: &str) -> LispError {
        LispError::new(
            ErrorKind::Unbound,
            format!("'{}' is bound but has no assigned value", name),
        )
    }

    pub fn type_error(expected: &str, got: &Value) -> LispError {
        LispError::new(
            ErrorKind::Type,
            format!("expected {}, got {}", expected, got.type_name()),
        )
    }

    pub fn arity(name: &str, got: usize) -> LispError {
        LispError::new(
            ErrorKind::Arity,
            format!("{}: called with {} argument(s)", name, got),
        )
    }

    pub fn arithmetic(message: impl Into<String>) -> LispError {
        LispError::new(ErrorKind::Arithmetic, message)
    }

    pub fn io(message: impl Into<String>) -> LispError {
        LispError::new(ErrorKind::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> LispError {
        LispError::new(ErrorKind::Internal, message)
    }

    /// Attach the offending form (first annotation wins — the innermost
    /// form is the interesting one).
    pub fn in_form(mut self, form: &Value) -> LispError {
        if self.context.is_none() {
            self.context = Some(crate::print::print_value(form, true));
        }
        if self.pos.is_none() {
            self.pos = form.pos();
        }
        self
    }
}

impl Display for LispError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(pos) = &self.pos {
            write!(f, "{}: ", pos)?;
        }
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(context) = &self.context {
            write!(f, "; error occurred in {}", context)?;
        }
        Ok(())
    }
}

impl Error for LispError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_single_line() {
        let err = LispError::unbound("frob");
        let text = err.to_string();
        assert_eq!(text, "unbound: 'frob' is not bound");
        assert!(!text.contains('\n'));
    }

    #[test]
    fn reader_errors_carry_position() {
        let pos = SourcePos {
            file: Some("demo.lisp".into()),
            start_line: 2,
            start_col: 5,
            end_line: 2,
            end_col: 5,
        };
        let err = LispError::reader("unexpected ')'", Some(pos));
        assert_eq!(err.to_string(), "demo.lisp:2:5: read error: unexpected ')'");
    }

    #[test]
    fn form_annotation_is_applied_once() {
        let form = Value::list(vec![Value::Long(1), Value::Long(2)]);
        let other = Value::Long(9);
        let err = LispError::arity("car", 3).in_form(&form).in_form(&other);
        assert!(err.to_string().ends_with("error occurred in (1 2)"));
    }
}
