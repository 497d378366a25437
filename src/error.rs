//! Error types for the cache worker.

use thiserror::Error;

/// Errors raised by cache storage, the network and the worker lifecycle.
#[derive(Error, Debug)]
pub enum Error {
  /// The network could not produce a response at all.
  #[error("Network request for {url} failed: {reason}")]
  Network { url: String, reason: String },

  /// The network answered, but not with a 2xx status.
  #[error("{url} responded with status {status}")]
  BadStatus { url: String, status: u16 },

  /// Install aborted; the worker will not activate.
  #[error("Install of {cache} failed: {source}")]
  Install {
    cache: String,
    #[source]
    source: Box<Error>,
  },

  /// Neither cache nor network could answer, and the offline page is gone too.
  #[error("Offline page {0} is not in the static cache")]
  OfflinePageMissing(String),

  /// A lifecycle hook was called out of order.
  #[error("Worker is {actual}, expected {expected}")]
  InvalidState {
    actual: &'static str,
    expected: &'static str,
  },

  /// The registration table holds a value that cannot be read back.
  #[error("Corrupt registration entry {key}: {value:?}")]
  CorruptRegistration { key: String, value: String },

  /// A version is registered but its installed configuration is not stored.
  #[error("No installed configuration for version {0}")]
  UnknownVersion(u32),

  #[error("Cache storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("Invalid URL: {0}")]
  Url(#[from] url::ParseError),

  #[error("HTTP client error: {0}")]
  Client(#[from] reqwest::Error),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Lock poisoned: {0}")]
  LockPoisoned(String),
}

/// A specialized `Result` type for cache worker operations.
pub type Result<T> = std::result::Result<T, Error>;
