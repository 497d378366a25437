//! Named request/response caches and the strategies that read them.
//!
//! This module provides:
//! - A storage trait for named cache stores keyed by method + URL
//! - A SQLite backend (file or in-memory)
//! - Cache-first and stale-while-revalidate strategies over any backend

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::SqliteStorage;
pub use traits::{CacheResult, CacheSource, CacheStorage, Request, Response};
