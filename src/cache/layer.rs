//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{CacheResult, CacheStorage, Request, Response};
use crate::error::{Error, Result};
use crate::net::Network;

/// Cache layer that applies a caching strategy to a single request.
///
/// It knows nothing about worker versions or offline pages; callers pick the
/// caches to consult and decide what to do when the network is gone.
pub struct CacheLayer<S, N> {
  storage: Arc<S>,
  network: Arc<N>,
}

impl<S, N> CacheLayer<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// Create a new cache layer over the given storage and network.
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self { storage, network }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Go straight to the network, no cache involved.
  pub async fn network_only(&self, request: &Request) -> Result<CacheResult> {
    let response = self.network.fetch(request).await?;
    Ok(CacheResult::from_network(response))
  }

  /// Fetch from the network, treating any non-2xx answer as a failure.
  pub async fn fetch_ok(&self, request: &Request) -> Result<Response> {
    let response = self.network.fetch(request).await?;
    if !response.is_ok() {
      return Err(Error::BadStatus {
        url: request.url.to_string(),
        status: response.status,
      });
    }
    Ok(response)
  }

  /// Cache-first strategy.
  ///
  /// 1. Check each cache in order - on hit, return it without touching the network
  /// 2. On miss, fetch from network (no write-back)
  pub async fn cache_first(&self, caches: &[&str], request: &Request) -> Result<CacheResult> {
    for cache in caches {
      if let Some(cached) = self.storage.match_request(cache, request)? {
        debug!(cache, url = %request.url, "Cache hit");
        return Ok(CacheResult::from_cache(cached));
      }
    }

    debug!(url = %request.url, "Cache miss, fetching from network");
    self.network_only(request).await
  }

  /// Stale-while-revalidate strategy.
  ///
  /// 1. Cached entry present - return it immediately and refresh it in the background
  /// 2. No entry - wait for the network and store a successful response
  /// 3. Network failure on a miss is returned to the caller; a failed cache
  ///    write is logged and the network response still returned
  pub async fn stale_while_revalidate(&self, cache: &str, request: &Request) -> Result<CacheResult> {
    if let Some(cached) = self.storage.match_request(cache, request)? {
      debug!(cache, url = %request.url, "Serving cached view, revalidating");
      let revalidation = self.revalidate(cache, request);
      return Ok(CacheResult::from_cache(cached).with_revalidation(revalidation));
    }

    let response = self.network.fetch(request).await?;
    if let Err(e) = store_if_ok(self.storage.as_ref(), cache, request, &response) {
      warn!(cache, url = %request.url, error = %e, "Failed to store view");
    }
    Ok(CacheResult::from_network(response))
  }

  /// Spawn a network fetch whose result overwrites the cache entry.
  fn revalidate(&self, cache: &str, request: &Request) -> Revalidation {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);
    let cache = cache.to_string();
    let request = request.clone();

    let handle = tokio::spawn(async move {
      match network.fetch(&request).await {
        Ok(response) => {
          if let Err(e) = store_if_ok(storage.as_ref(), &cache, &request, &response) {
            warn!(cache = %cache, url = %request.url, error = %e, "Failed to store revalidated view");
          }
        }
        Err(e) => {
          // Keep serving the stale entry
          debug!(url = %request.url, error = %e, "Revalidation failed");
        }
      }
    });

    Revalidation { handle }
  }
}

/// Write a network response into the cache if it was successful.
fn store_if_ok<S: CacheStorage>(
  storage: &S,
  cache: &str,
  request: &Request,
  response: &Response,
) -> Result<()> {
  if response.is_ok() {
    storage.put(cache, request, response)?;
    debug!(cache, url = %request.url, "Stored network response");
  } else {
    debug!(cache, url = %request.url, status = response.status, "Not caching unsuccessful response");
  }
  Ok(())
}

/// Handle on a background revalidation.
///
/// Dropping it does not cancel the update; awaiting it lets the platform keep
/// the worker alive until the cache write has landed.
#[derive(Debug)]
pub struct Revalidation {
  handle: JoinHandle<()>,
}

impl Revalidation {
  /// Wait for the background fetch (and cache write) to finish.
  pub async fn wait(self) {
    if let Err(e) = self.handle.await {
      warn!(error = %e, "Revalidation task panicked");
    }
  }
}
