//! # roster-core: The "Model" of ROSTER
//!
//! Defines what the directory looks like from our side of the wire: the
//! [`User`] record the upstream returns, the structured [`Filter`] callers
//! search with, and the compiler that turns a filter into the upstream's
//! Lucene-style query string.
//!
//! Nothing in this crate performs I/O. The enumeration engine, caching and
//! throttling live in `roster-io`.

pub mod error;
pub mod filter;
pub mod partition;
pub mod query;
pub mod user;

pub use error::CompileError;
pub use filter::{Filter, FilterField, OrGroup, Predicate, Value};
pub use partition::{Bucket, ALPHABET, MAX_PREFIX_LEN, REFINE_ALPHABET};
pub use query::{compile, normalize_sort};
pub use user::{
    AppMetadata, Gender, Identity, Role, User, UserMetadata, UserPage, UserUpdate,
};

/// Hard cap on the number of results the upstream will page through for a
/// single query. Pages past this window are never returned.
pub const RESULT_WINDOW: u64 = 1000;

/// Largest page size the upstream accepts.
pub const MAX_PAGE_SIZE: u32 = 100;
