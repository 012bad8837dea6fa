//! Weaver error types.
//!
//! Every failure mode of the pass is fatal: the weaver never drops or
//! weakens a check to make progress. Each variant names the offending
//! node or entity so the error can be traced back to the input.

use gv_ir::NodeId;

#[derive(Debug)]
pub enum WeaverError {
    /// An IR operation and a verifier statement disagree during index
    /// alignment (wrong kind, or one side ran out)
    StructuralMismatch { method: String, detail: String },
    /// A verifier expression uses a construct the check algebra does not
    /// model, or a field name violates the `struct$field` convention
    InvalidExpression { node: NodeId, detail: String },
    /// A specification is malformed for the requested use: a value where
    /// only permissions are valid, or a permission walk reached a
    /// location with no associated specification
    InvalidSpecification { detail: String },
    /// A substitution could not resolve a formal parameter to an actual
    /// argument
    UnknownVariable { method: String, name: String },
    /// A residual check carries a position combination no collection rule
    /// accepts
    UnhandledPosition { node: NodeId, detail: String },
}

impl std::fmt::Display for WeaverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeaverError::StructuralMismatch { method, detail } => {
                write!(f, "structural mismatch in method '{}': {}", method, detail)
            }
            WeaverError::InvalidExpression { node, detail } => {
                write!(f, "invalid expression at {}: {}", node, detail)
            }
            WeaverError::InvalidSpecification { detail } => {
                write!(f, "invalid specification: {}", detail)
            }
            WeaverError::UnknownVariable { method, name } => {
                write!(
                    f,
                    "unknown variable or parameter '{}' in method '{}'",
                    name, method
                )
            }
            WeaverError::UnhandledPosition { node, detail } => {
                write!(f, "unhandled check position at {}: {}", node, detail)
            }
        }
    }
}

impl std::error::Error for WeaverError {}

impl WeaverError {
    /// Shorthand for alignment failures.
    pub(crate) fn mismatch(method: &str, detail: impl Into<String>) -> Self {
        WeaverError::StructuralMismatch {
            method: method.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_spec(detail: impl Into<String>) -> Self {
        WeaverError::InvalidSpecification {
            detail: detail.into(),
        }
    }
}

/// Convenience alias used throughout the weaver.
pub type Result<T> = std::result::Result<T, WeaverError>;
