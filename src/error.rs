//! Error types for the quench backend
//!
//! Every failure the backend can report falls into one of three classes:
//! resource exhaustion, internal consistency violations, and unknown
//! lookups. Aborted optimizations are not errors; passes absorb them and
//! log at `debug`.

use std::fmt;
use thiserror::Error;

use crate::ast::{FunctionId, Type};

/// Source location of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct SourceLocation {
    /// Line number (1-indexed)
    pub line: u32,
    /// Column number (1-indexed)
    pub column: u32,
    /// Byte offset in source
    pub offset: usize,
}

impl SourceLocation {
    /// Create a new source location
    pub fn new(line: u32, column: u32, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Broad classification used by the compiler driver when it reports a
/// failed function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// A fixed-size id space ran out
    ResourceExhaustion,
    /// An earlier pass or the driver itself is defective
    InternalConsistency,
    /// A table was queried for an id it never recorded
    NotFound,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::ResourceExhaustion => write!(f, "resource exhaustion"),
            ErrorClass::InternalConsistency => write!(f, "internal consistency"),
            ErrorClass::NotFound => write!(f, "not found"),
        }
    }
}

/// Backend error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Program point id space exhausted for one function
    #[error("ProgramPointOverflow: function {function} needs more than {limit} program points")]
    ProgramPointOverflow { function: FunctionId, limit: u32 },

    /// Frame push/pop pairing broken
    #[error("FrameMismatch: {0}")]
    FrameMismatch(String),

    /// Two predecessors of one label disagree on the evaluation stack
    #[error("JoinTypeMismatch at {label}: expected {expected:?}, found {found:?}")]
    JoinTypeMismatch {
        label: String,
        expected: Vec<Type>,
        found: Vec<Type>,
    },

    /// An instruction needed more operands than the stack held
    #[error("StackUnderflow: {0}")]
    StackUnderflow(String),

    /// A one-shot transform ran twice on the same function
    #[error("TransformReapplied: {transform} already applied to function {function}")]
    TransformReapplied {
        transform: &'static str,
        function: FunctionId,
    },

    /// A compile unit received weight or initializers after finalization
    #[error("UnitFinalized: compile unit {0} is already finalized")]
    UnitFinalized(String),

    /// Any other broken invariant
    #[error("InternalError: {0}")]
    InternalError(String),

    /// No call signature recorded for the function
    #[error("NotFound: no call signature recorded for function {0}")]
    SignatureNotFound(FunctionId),

    /// The function's signature has no such parameter
    #[error("NotFound: function {function} has no parameter {index}")]
    ParameterNotFound { function: FunctionId, index: usize },
}

impl Error {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::InternalError(message.into())
    }

    /// Create a frame mismatch error
    pub fn frame_mismatch(message: impl Into<String>) -> Self {
        Error::FrameMismatch(message.into())
    }

    /// Create a stack underflow error
    pub fn stack_underflow(message: impl Into<String>) -> Self {
        Error::StackUnderflow(message.into())
    }

    /// Classify the error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ProgramPointOverflow { .. } => ErrorClass::ResourceExhaustion,
            Error::SignatureNotFound(_) | Error::ParameterNotFound { .. } => ErrorClass::NotFound,
            Error::FrameMismatch(_)
            | Error::JoinTypeMismatch { .. }
            | Error::StackUnderflow(_)
            | Error::TransformReapplied { .. }
            | Error::UnitFinalized(_)
            | Error::InternalError(_) => ErrorClass::InternalConsistency,
        }
    }
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let overflow = Error::ProgramPointOverflow {
            function: FunctionId(3),
            limit: 10,
        };
        assert_eq!(overflow.class(), ErrorClass::ResourceExhaustion);
        assert_eq!(
            Error::SignatureNotFound(FunctionId(1)).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            Error::frame_mismatch("pop without push").class(),
            ErrorClass::InternalConsistency
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::TransformReapplied {
            transform: "apply-to-call",
            function: FunctionId(7),
        };
        assert_eq!(
            err.to_string(),
            "TransformReapplied: apply-to-call already applied to function fn#7"
        );
        assert_eq!(
            SourceLocation::new(4, 2, 30).to_string(),
            "4:2"
        );
    }
}
