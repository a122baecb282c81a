//! Persistent response cache.
//!
//! This module provides the storage side of the engine:
//! - Normalized request keys (exact and query-stripped)
//! - Named namespaces holding response snapshots, on SQLite or in memory
//! - A size bound that trims the oldest-listed entries

pub mod eviction;
mod key;
mod storage;
mod traits;

pub use key::RequestKey;
pub use storage::{CacheStorage, MemoryStorage, Namespace, SqliteStorage};
pub use traits::{CacheEntry, CacheSource, Served};
