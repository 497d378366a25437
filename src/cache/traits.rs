//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use super::layer::Revalidation;
use crate::error::Result;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Full page navigation (address bar, link click)
  Navigate,
  /// Anything else: stylesheets, scripts, images, XHR
  Subresource,
}

/// Request descriptor the worker classifies and caches by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  /// Upper-case HTTP method
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  /// A plain subresource GET.
  pub fn get(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Subresource,
    }
  }

  /// A page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      method: "GET".to_string(),
      url,
      mode: RequestMode::Navigate,
    }
  }

  pub fn with_method(mut self, method: &str) -> Self {
    self.method = method.to_ascii_uppercase();
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// The URL with any fragment removed; fragments never reach the server.
  pub fn cache_url(&self) -> Url {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url
  }

  /// Stable storage key for this request (method + URL).
  pub fn cache_key(&self) -> String {
    let input = format!("{} {}", self.method, self.cache_url());

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Snapshot of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Whether the status is in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// First header value matching `name`, case-insensitively.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A response read back from a cache store.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named caches. Each cache maps a request
/// descriptor to the last response stored for it.
pub trait CacheStorage: Send + Sync {
  /// Create the named cache if it does not exist yet.
  fn open(&self, cache: &str) -> Result<()>;

  /// Whether the named cache exists.
  fn has(&self, cache: &str) -> Result<bool>;

  /// Names of all existing caches, sorted.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Delete a cache and all of its entries. Returns false if it did not exist.
  fn delete_cache(&self, cache: &str) -> Result<bool>;

  /// Look up the stored response for a request.
  fn match_request(&self, cache: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store (or overwrite) the response for a request, creating the cache if needed.
  fn put(&self, cache: &str, request: &Request, response: &Response) -> Result<()>;

  /// Atomically make `entries` the entire contents of the cache.
  fn replace_all(&self, cache: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Requests with a stored response, ordered by URL.
  fn keys(&self, cache: &str) -> Result<Vec<Request>>;

  /// Number of entries in the cache (0 if it does not exist).
  fn len(&self, cache: &str) -> Result<usize>;
}

/// Result from a fetch, including the response and where it came from.
#[derive(Debug)]
pub struct CacheResult {
  /// The response handed back to the page
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Background network update still running, if any
  pub revalidation: Option<Revalidation>,
}

impl CacheResult {
  /// Create a new result from a network response.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
      revalidation: None,
    }
  }

  /// Create a new result from a cache hit.
  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.cached_at),
      revalidation: None,
    }
  }

  /// Create a new result serving the offline page.
  pub fn offline(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Offline,
      cached_at: Some(cached.cached_at),
      revalidation: None,
    }
  }

  pub fn with_revalidation(mut self, revalidation: Revalidation) -> Self {
    self.revalidation = Some(revalidation);
    self
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh response from network
  Network,
  /// Stored response from one of the caches
  Cache,
  /// Network and cache both failed, serving the offline page
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
    }
  }
}
