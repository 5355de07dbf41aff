use thiserror::Error;

use crate::symbol::ValueLayout;

/// Classifies a parse failure so callers can react without matching on text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnmatchedBracket,
    MissingOperand,
    InvalidAssignTarget,
    ArityMismatch,
    UndefinedSymbol,
    UnknownToken,
    Format,
}

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error ({kind:?}): {message}")]
    Parse {
        kind: ParseErrorKind,
        message: String,
    },
    #[error("executable memory allocation failed")]
    AllocFailed,
    #[error("code generation failed: {0}")]
    CodeGen(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("inputs length mismatch: expected {expected}, got {got}")]
    InputsLen { expected: usize, got: usize },
    #[error("argument {index} does not match declared layout {expected:?}")]
    ArgLayout { index: usize, expected: ValueLayout },
    #[error("executable code is empty")]
    Empty,
}

impl ExprError {
    pub(crate) fn parse(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        ExprError::Parse {
            kind,
            message: message.into(),
        }
    }

    /// The parse error kind, if this is a parse error.
    pub fn parse_kind(&self) -> Option<ParseErrorKind> {
        match self {
            ExprError::Parse { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
