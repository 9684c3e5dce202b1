//! Named response caches for offline support.
//!
//! This module provides:
//! - A storage trait for named, durable request→response stores, with a SQLite backend
//! - Freshness evaluation from the timestamp embedded in each stored response
//! - Bounded growth (oldest-first eviction), a periodic age ceiling, and
//!   generation cleanup through `CacheLayer`

pub mod freshness;
mod layer;
mod storage;
mod traits;

pub use freshness::Freshness;
pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedEntry, StoreStats};
