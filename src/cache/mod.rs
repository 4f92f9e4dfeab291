//! Versioned response cache.
//!
//! Responses are partitioned by [`CacheVersion`]; exactly one version is
//! current and the others are deleted wholesale when a new version activates.

mod storage;
mod traits;

pub use storage::{CacheStore, SqliteCacheStore};
pub use traits::{CacheEntry, CacheVersion, RequestKey, ServeSource, Served};
