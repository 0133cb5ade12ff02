use thiserror::Error;

/// Raised while building a [`Filter`](crate::Filter), before any upstream
/// call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("unsupported filter field '{0}'")]
    UnknownField(String),

    #[error("field '{0}' is managed by the enumeration engine and cannot be filtered on")]
    EngineManagedField(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("malformed range for '{field}': {reason}")]
    MalformedRange { field: String, reason: String },

    #[error("'{predicate}' is not supported on '{field}'")]
    UnsupportedPredicate { field: String, predicate: String },
}

impl CompileError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn range(field: &str, reason: impl Into<String>) -> Self {
        Self::MalformedRange {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}
