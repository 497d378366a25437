//! The offline cache worker.
//!
//! One worker instance corresponds to one deployed version. It owns two
//! caches: a versioned static cache filled at install time, and an
//! unversioned views cache filled as pages are navigated to.
//!
//! Request routing:
//! - non-GET or cross-origin: straight to the network
//! - navigation to a path ending in `/`: stale-while-revalidate on the views cache
//! - everything else in scope: cache-first over static then views
//!
//! When the network is unreachable and nothing is cached, navigations get the
//! offline page from the static cache.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, Request};
use crate::error::{Error, Result};
use crate::event::{Message, MessageKind};
use crate::net::Network;

/// Which requests the cache-first path handles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheFirstScope {
  /// Only same-origin GETs for an enumerated asset; everything else goes to the network
  Assets,
  /// Every same-origin GET that is not a section index navigation
  #[default]
  All,
}

/// Everything a worker needs to know about its deployment.
///
/// Stored with the registration at install time, so a version keeps the
/// settings it was installed with even after the config file changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Site origin; asset paths resolve against it
  pub origin: Url,
  /// Version tag embedded in the static cache name
  pub version: u32,
  pub static_prefix: String,
  pub views_cache: String,
  /// Asset paths precached at install
  pub assets: Vec<String>,
  /// Fallback page; always one of `assets`
  pub offline_page: String,
  pub scope: CacheFirstScope,
}

impl WorkerConfig {
  /// e.g. `static-v3`
  pub fn static_cache_name(&self) -> String {
    format!("{}-v{}", self.static_prefix, self.version)
  }

  /// Caches that survive activation.
  pub fn whitelist(&self) -> [String; 2] {
    [self.static_cache_name(), self.views_cache.clone()]
  }

  pub fn asset_urls(&self) -> Result<Vec<Url>> {
    self
      .assets
      .iter()
      .map(|path| Ok(self.origin.join(path)?))
      .collect()
  }

  pub fn offline_url(&self) -> Result<Url> {
    Ok(self.origin.join(&self.offline_page)?)
  }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  Activated,
  /// Install failed; this worker will never run
  Redundant,
}

impl WorkerState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
      Self::Redundant => "redundant",
    }
  }
}

pub struct OfflineWorker<S, N> {
  config: WorkerConfig,
  cache: CacheLayer<S, N>,
  state: WorkerState,
  skip_waiting: bool,
}

impl<S, N> OfflineWorker<S, N>
where
  S: CacheStorage + 'static,
  N: Network + 'static,
{
  /// A freshly parsed worker, not yet installed.
  pub fn new(config: WorkerConfig, storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      config,
      cache: CacheLayer::new(storage, network),
      state: WorkerState::Parsed,
      skip_waiting: false,
    }
  }

  /// Resume a worker whose lifecycle already advanced in an earlier run.
  pub fn with_state(mut self, state: WorkerState) -> Self {
    self.state = state;
    self
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  /// Whether a page asked this worker to stop waiting.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting
  }

  fn expect_state(&self, expected: WorkerState) -> Result<()> {
    if self.state != expected {
      return Err(Error::InvalidState {
        actual: self.state.as_str(),
        expected: expected.as_str(),
      });
    }
    Ok(())
  }

  /// Populate the static cache with every enumerated asset.
  ///
  /// Either all assets land in the cache or none do; on failure the worker
  /// becomes redundant.
  pub async fn on_install(&mut self) -> Result<()> {
    self.expect_state(WorkerState::Parsed)?;
    self.state = WorkerState::Installing;

    let cache = self.config.static_cache_name();
    info!(cache = %cache, assets = self.config.assets.len(), "Installing");

    match self.precache(&cache).await {
      Ok(()) => {
        self.state = WorkerState::Installed;
        info!(cache = %cache, "Installed");
        Ok(())
      }
      Err(e) => {
        self.state = WorkerState::Redundant;
        warn!(cache = %cache, error = %e, "Install failed");
        Err(Error::Install {
          cache,
          source: Box::new(e),
        })
      }
    }
  }

  async fn precache(&self, cache: &str) -> Result<()> {
    let requests: Vec<Request> = self
      .config
      .asset_urls()?
      .into_iter()
      .map(Request::get)
      .collect();

    let responses = try_join_all(requests.iter().map(|r| self.cache.fetch_ok(r))).await?;
    let entries: Vec<_> = requests.into_iter().zip(responses).collect();

    self.cache.storage().replace_all(cache, &entries)
  }

  /// Delete every cache outside the whitelist. Returns the deleted names.
  pub async fn on_activate(&mut self) -> Result<Vec<String>> {
    self.expect_state(WorkerState::Installed)?;
    self.state = WorkerState::Activating;

    match self.sweep() {
      Ok(deleted) => {
        self.state = WorkerState::Activated;
        info!(version = self.config.version, deleted = ?deleted, "Activated");
        Ok(deleted)
      }
      Err(e) => {
        // Still installed; activation can be retried
        self.state = WorkerState::Installed;
        Err(e)
      }
    }
  }

  fn sweep(&self) -> Result<Vec<String>> {
    let storage = self.cache.storage();
    let whitelist = self.config.whitelist();
    let mut deleted = Vec::new();

    storage.open(&self.config.views_cache)?;
    for name in storage.cache_names()? {
      if !whitelist.contains(&name) {
        storage.delete_cache(&name)?;
        debug!(cache = %name, "Deleted old cache");
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Answer an intercepted request.
  pub async fn on_fetch(&self, request: &Request) -> Result<CacheResult> {
    self.expect_state(WorkerState::Activated)?;

    if !request.is_get() || request.url.origin() != self.config.origin.origin() {
      debug!(method = %request.method, url = %request.url, "Passing through");
      return self.cache.network_only(request).await;
    }

    if request.is_navigation() && request.url.path().ends_with('/') {
      return match self
        .cache
        .stale_while_revalidate(&self.config.views_cache, request)
        .await
      {
        Err(Error::Network { reason, .. }) => {
          debug!(url = %request.url, reason = %reason, "View unavailable, serving offline page");
          self.offline_page().await
        }
        other => other,
      };
    }

    if self.config.scope == CacheFirstScope::Assets && !self.is_asset(request)? {
      return self.cache.network_only(request).await;
    }

    let static_cache = self.config.static_cache_name();
    let caches = [static_cache.as_str(), self.config.views_cache.as_str()];
    match self.cache.cache_first(&caches, request).await {
      Err(Error::Network { reason, .. }) if request.is_navigation() => {
        debug!(url = %request.url, reason = %reason, "Page unavailable, serving offline page");
        self.offline_page().await
      }
      other => other,
    }
  }

  fn is_asset(&self, request: &Request) -> Result<bool> {
    let url = request.cache_url();
    Ok(self.config.asset_urls()?.contains(&url))
  }

  async fn offline_page(&self) -> Result<CacheResult> {
    let request = Request::get(self.config.offline_url()?);
    match self
      .cache
      .storage()
      .match_request(&self.config.static_cache_name(), &request)?
    {
      Some(cached) => Ok(CacheResult::offline(cached)),
      None => Err(Error::OfflinePageMissing(self.config.offline_page.clone())),
    }
  }

  /// Handle a control message. Returns whether the action was recognised.
  pub fn on_message(&mut self, message: &Message) -> bool {
    match message.kind() {
      MessageKind::SkipWaiting => {
        info!(version = self.config.version, "Skip waiting requested");
        self.skip_waiting = true;
        true
      }
      MessageKind::Unknown => {
        debug!(action = %message.action, "Ignoring unknown message");
        false
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, Response, SqliteStorage};
  use crate::net::testing::FakeNetwork;

  const ORIGIN: &str = "https://blog.test";

  fn config(version: u32) -> WorkerConfig {
    WorkerConfig {
      origin: Url::parse(ORIGIN).unwrap(),
      version,
      static_prefix: "static".to_string(),
      views_cache: "views".to_string(),
      assets: vec![
        "/offline.html".to_string(),
        "/styles.css".to_string(),
        "/js/comments.js".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      scope: CacheFirstScope::All,
    }
  }

  fn network() -> Arc<FakeNetwork> {
    let network = FakeNetwork::new(ORIGIN);
    network.route("/offline.html", 200, "you are offline");
    network.route("/styles.css", 200, "body {}");
    network.route("/js/comments.js", 200, "load()");
    network.route("/", 200, "home v1");
    network.route("/posts/", 200, "posts v1");
    Arc::new(network)
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  async fn active_worker(
    config: WorkerConfig,
    storage: &Arc<SqliteStorage>,
    network: &Arc<FakeNetwork>,
  ) -> OfflineWorker<SqliteStorage, FakeNetwork> {
    let mut worker = OfflineWorker::new(config, Arc::clone(storage), Arc::clone(network));
    worker.on_install().await.unwrap();
    worker.on_activate().await.unwrap();
    worker
  }

  #[tokio::test]
  async fn test_install_caches_exactly_the_assets() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let mut worker = OfflineWorker::new(config(1), Arc::clone(&storage), Arc::clone(&network));

    worker.on_install().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Installed);

    let mut cached: Vec<String> = storage
      .keys("static-v1")
      .unwrap()
      .into_iter()
      .map(|r| r.url.path().to_string())
      .collect();
    cached.sort();
    assert_eq!(cached, vec!["/js/comments.js", "/offline.html", "/styles.css"]);

    let css = storage
      .match_request("static-v1", &Request::get(url("/styles.css")))
      .unwrap()
      .unwrap();
    assert_eq!(css.response.body, b"body {}");
  }

  #[tokio::test]
  async fn test_install_fails_on_missing_asset() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let mut cfg = config(1);
    cfg.assets.push("/missing.png".to_string());
    let mut worker = OfflineWorker::new(cfg, Arc::clone(&storage), Arc::clone(&network));

    let err = worker.on_install().await.unwrap_err();
    assert!(matches!(err, Error::Install { .. }));
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert!(!storage.has("static-v1").unwrap());

    // A redundant worker cannot activate
    assert!(matches!(
      worker.on_activate().await,
      Err(Error::InvalidState { .. })
    ));
  }

  #[tokio::test]
  async fn test_install_fails_when_offline() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    network.set_offline(true);
    let mut worker = OfflineWorker::new(config(1), Arc::clone(&storage), Arc::clone(&network));

    assert!(worker.on_install().await.is_err());
    assert_eq!(storage.len("static-v1").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activate_purges_unlisted_caches() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    storage.open("static-v0").unwrap();
    storage.open("something-else").unwrap();
    storage.open("views").unwrap();

    let mut worker = OfflineWorker::new(config(1), Arc::clone(&storage), Arc::clone(&network));
    worker.on_install().await.unwrap();
    let deleted = worker.on_activate().await.unwrap();

    assert_eq!(deleted, vec!["something-else", "static-v0"]);
    assert_eq!(storage.cache_names().unwrap(), vec!["static-v1", "views"]);
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_version_bump_removes_previous_static_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    active_worker(config(1), &storage, &network).await;
    assert!(storage.has("static-v1").unwrap());

    active_worker(config(2), &storage, &network).await;
    assert!(!storage.has("static-v1").unwrap());
    assert!(storage.has("views").unwrap());
    assert_eq!(storage.len("static-v2").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_fetch_requires_activation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let worker = OfflineWorker::new(config(1), storage, network());

    let result = worker.on_fetch(&Request::get(url("/styles.css"))).await;
    assert!(matches!(result, Err(Error::InvalidState { .. })));
  }

  #[tokio::test]
  async fn test_static_hit_makes_no_network_call() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    let before = network.calls();

    let result = worker.on_fetch(&Request::get(url("/styles.css"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.response.body, b"body {}");
    assert_eq!(network.calls(), before);
  }

  #[tokio::test]
  async fn test_cache_first_miss_goes_to_network() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    network.route("/img/logo.png", 200, "png");
    let worker = active_worker(config(1), &storage, &network).await;

    let result = worker
      .on_fetch(&Request::get(url("/img/logo.png")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.body, b"png");
    assert_eq!(storage.len("views").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_subresource_network_failure_propagates() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    network.set_offline(true);

    let result = worker.on_fetch(&Request::get(url("/img/logo.png"))).await;
    assert!(matches!(result, Err(Error::Network { .. })));
  }

  #[tokio::test]
  async fn test_navigation_to_page_falls_back_offline() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    network.set_offline(true);

    let result = worker
      .on_fetch(&Request::navigate(url("/posts/hello.html")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.body, b"you are offline");
  }

  #[tokio::test]
  async fn test_view_cached_and_network_down_serves_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    storage
      .put("views", &Request::navigate(url("/posts/")), &Response::new(200, "cached posts"))
      .unwrap();
    network.set_offline(true);

    let result = worker
      .on_fetch(&Request::navigate(url("/posts/")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.response.body, b"cached posts");

    // The failed revalidation must not disturb the cached entry
    result.revalidation.unwrap().wait().await;
    let cached = storage
      .match_request("views", &Request::navigate(url("/posts/")))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"cached posts");
  }

  #[tokio::test]
  async fn test_view_missing_and_network_down_serves_offline_page() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    network.set_offline(true);

    let result = worker.on_fetch(&Request::navigate(url("/"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.body, b"you are offline");
  }

  #[tokio::test]
  async fn test_view_miss_stores_network_response() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;

    let result = worker.on_fetch(&Request::navigate(url("/"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert!(result.revalidation.is_none());

    let cached = storage
      .match_request("views", &Request::navigate(url("/")))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"home v1");
  }

  #[tokio::test]
  async fn test_view_revalidation_overwrites_entry() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;

    worker.on_fetch(&Request::navigate(url("/"))).await.unwrap();
    network.route("/", 200, "home v2");

    let result = worker.on_fetch(&Request::navigate(url("/"))).await.unwrap();
    // Stale copy first
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.response.body, b"home v1");

    result.revalidation.unwrap().wait().await;
    let cached = storage
      .match_request("views", &Request::navigate(url("/")))
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body, b"home v2");
  }

  #[tokio::test]
  async fn test_missing_offline_page_is_reported() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    storage.delete_cache("static-v1").unwrap();
    network.set_offline(true);

    let result = worker.on_fetch(&Request::navigate(url("/"))).await;
    assert!(matches!(result, Err(Error::OfflinePageMissing(_))));
  }

  #[tokio::test]
  async fn test_non_get_bypasses_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;

    let request = Request::get(url("/styles.css")).with_method("POST");
    let result = worker.on_fetch(&request).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    // once at install, once for the POST
    assert_eq!(network.calls_for("/styles.css"), 2);
  }

  #[tokio::test]
  async fn test_cross_origin_bypasses_cache() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let worker = active_worker(config(1), &storage, &network).await;
    let before = network.calls();

    let request = Request::get(Url::parse("https://cdn.test/styles.css").unwrap());
    let result = worker.on_fetch(&request).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.status, 404);
    assert_eq!(network.calls(), before + 1);
  }

  #[tokio::test]
  async fn test_assets_scope_passes_other_requests_through() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = network();
    let mut cfg = config(1);
    cfg.scope = CacheFirstScope::Assets;
    let worker = active_worker(cfg, &storage, &network).await;

    // Even with an entry in the views cache, a non-asset goes to the network
    storage
      .put("views", &Request::get(url("/feed.xml")), &Response::new(200, "cached feed"))
      .unwrap();
    network.route("/feed.xml", 200, "fresh feed");

    let result = worker.on_fetch(&Request::get(url("/feed.xml"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.response.body, b"fresh feed");

    let result = worker
      .on_fetch(&Request::get(url("/styles.css#x")))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let mut worker = OfflineWorker::new(config(1), storage, network());

    assert!(!worker.on_message(&Message {
      action: "reload".to_string()
    }));
    assert!(!worker.skip_waiting_requested());

    assert!(worker.on_message(&Message::skip_waiting()));
    assert!(worker.skip_waiting_requested());
  }
}
