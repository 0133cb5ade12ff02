//! # roster-io: The "Engine" of ROSTER
//!
//! Everything that talks to the upstream directory or the cache store:
//!
//! - [`throttle`]: the single choke point every upstream call passes through.
//! - [`cursor`] / [`enumerate`]: exhaustive enumeration past the upstream's
//!   result window by sharding on email prefixes.
//! - [`cache`]: TTL response cache and in-flight call deduplication.
//! - [`users`]: the user service composing them.

pub mod cache;
pub mod cursor;
pub mod directory;
pub mod enumerate;
pub mod error;
pub mod throttle;
pub mod users;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{CacheStore, InflightRegistry, MemoryStore, ResponseCache};
pub use directory::{Directory, RoleInfo, SearchRequest};
pub use enumerate::{EnumeratedPage, EnumerateOptions, Enumeration, Enumerator, StartDepth};
pub use error::{Aborted, CacheError, DirectoryError, EnumerateError};
pub use throttle::{Throttle, ThrottleLimits, Throttled};
pub use users::{CacheMode, SearchOptions, Users, UsersConfig};
