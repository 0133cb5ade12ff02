use roster_core::CompileError;
use thiserror::Error;

/// Failure talking to the upstream directory.
///
/// `Clone` so one shared in-flight result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream rate limit exceeded")]
    RateLimited,

    #[error("upstream returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("could not decode upstream response: {0}")]
    Decode(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Aborted(#[from] Aborted),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend: {0}")]
    Backend(String),

    #[error("cache serialization: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A shared computation ended without producing a value (its task panicked
/// or the runtime shut down underneath it).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("computation aborted: {0}")]
pub struct Aborted(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnumerateError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
