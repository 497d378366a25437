//! Worker registration: which version is active, which one is waiting.
//!
//! This plays the part the browser plays for a service worker. It persists
//! the active and waiting versions next to the caches, so separate runs of
//! the CLI see one continuous lifecycle. Each installed version also keeps
//! the `WorkerConfig` it was installed with; the configured one only applies
//! to the next install.
//!
//! Lifecycle events (install, activate, message) are serialized on the
//! registration lock. Fetches only read the active version and then run
//! concurrently with each other.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheResult, Request, SqliteStorage};
use crate::error::{Error, Result};
use crate::event::{Event, EventOutcome, Message};
use crate::net::Network;
use crate::worker::{OfflineWorker, WorkerConfig, WorkerState};

const ACTIVE_KEY: &str = "active_version";
const WAITING_KEY: &str = "waiting_version";

fn config_key(version: u32) -> String {
  format!("worker_config_v{}", version)
}

/// A worker version taking over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
  pub version: u32,
  /// Caches swept during activation
  pub deleted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// The configured version is already serving
  AlreadyActive(u32),
  /// Installed; waits until activated or told to skip waiting
  Waiting(u32),
  /// Installed with nothing else active, so it took over at once
  Activated(Activation),
}

#[derive(Debug, Clone, Copy, Default)]
struct Versions {
  active: Option<u32>,
  waiting: Option<u32>,
}

pub struct Registration<N> {
  config: WorkerConfig,
  storage: Arc<SqliteStorage>,
  network: Arc<N>,
  versions: Mutex<Versions>,
}

impl<N: Network + 'static> Registration<N> {
  /// Load the registration persisted in `storage`.
  pub fn load(config: WorkerConfig, storage: Arc<SqliteStorage>, network: Arc<N>) -> Result<Self> {
    let versions = Versions {
      active: read_version(&storage, ACTIVE_KEY)?,
      waiting: read_version(&storage, WAITING_KEY)?,
    };
    debug!(active = ?versions.active, waiting = ?versions.waiting, "Loaded registration");

    Ok(Self {
      config,
      storage,
      network,
      versions: Mutex::new(versions),
    })
  }

  pub async fn active(&self) -> Option<u32> {
    self.versions.lock().await.active
  }

  pub async fn waiting(&self) -> Option<u32> {
    self.versions.lock().await.waiting
  }

  /// Caches the active worker keeps; empty when nothing is active.
  pub async fn live_caches(&self) -> Result<Vec<String>> {
    match self.active().await {
      Some(version) => Ok(self.installed_config(version)?.whitelist().to_vec()),
      None => Ok(Vec::new()),
    }
  }

  pub fn storage(&self) -> &SqliteStorage {
    &self.storage
  }

  /// Configuration `version` was installed with.
  fn installed_config(&self, version: u32) -> Result<WorkerConfig> {
    match self.storage.get_meta(&config_key(version))? {
      Some(json) => Ok(serde_json::from_str(&json)?),
      None => Err(Error::UnknownVersion(version)),
    }
  }

  fn forget_config(&self, version: u32) -> Result<()> {
    debug!(version, "Dropping installed configuration");
    self.storage.set_meta(&config_key(version), None)
  }

  fn worker(&self, config: WorkerConfig, state: WorkerState) -> OfflineWorker<SqliteStorage, N> {
    OfflineWorker::new(config, Arc::clone(&self.storage), Arc::clone(&self.network))
      .with_state(state)
  }

  fn installed_worker(
    &self,
    version: u32,
    state: WorkerState,
  ) -> Result<OfflineWorker<SqliteStorage, N>> {
    Ok(self.worker(self.installed_config(version)?, state))
  }

  fn persist(&self, versions: &Versions) -> Result<()> {
    write_version(&self.storage, ACTIVE_KEY, versions.active)?;
    write_version(&self.storage, WAITING_KEY, versions.waiting)
  }

  /// Install the configured version.
  ///
  /// On failure the previously active version keeps serving.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let mut versions = self.versions.lock().await;
    let version = self.config.version;
    if versions.active == Some(version) {
      info!(version, "Version already active");
      return Ok(InstallOutcome::AlreadyActive(version));
    }

    let mut worker = self.worker(self.config.clone(), WorkerState::Parsed);
    if let Err(e) = worker.on_install().await {
      warn!(
        version,
        state = worker.state().as_str(),
        active = ?versions.active,
        "Keeping previous worker"
      );
      return Err(e);
    }

    let json = serde_json::to_string(&self.config)?;
    self.storage.set_meta(&config_key(version), Some(&json))?;
    if let Some(replaced) = versions.waiting.filter(|&v| v != version) {
      self.forget_config(replaced)?;
    }
    versions.waiting = Some(version);
    self.persist(&versions)?;

    if versions.active.is_none() {
      let activation = self.activate_waiting(&mut versions).await?;
      return Ok(InstallOutcome::Activated(activation));
    }

    info!(version, active = ?versions.active, "Installed, waiting to activate");
    Ok(InstallOutcome::Waiting(version))
  }

  /// Activate the waiting version, if there is one.
  pub async fn activate(&self) -> Result<Option<Activation>> {
    let mut versions = self.versions.lock().await;
    if versions.waiting.is_none() {
      debug!("No waiting worker to activate");
      return Ok(None);
    }
    self.activate_waiting(&mut versions).await.map(Some)
  }

  async fn activate_waiting(&self, versions: &mut Versions) -> Result<Activation> {
    let version = versions.waiting.ok_or(Error::InvalidState {
      actual: "absent",
      expected: WorkerState::Installed.as_str(),
    })?;

    let mut worker = self.installed_worker(version, WorkerState::Installed)?;
    let deleted = worker.on_activate().await?;

    let previous = versions.active.replace(version);
    versions.waiting = None;
    self.persist(versions)?;
    if let Some(previous) = previous.filter(|&v| v != version) {
      self.forget_config(previous)?;
    }

    Ok(Activation { version, deleted })
  }

  /// Deliver a message: to the waiting worker if there is one, else the active one.
  ///
  /// Returns whether the action was recognised, and the activation it caused.
  pub async fn message(&self, message: &Message) -> Result<(bool, Option<Activation>)> {
    let mut versions = self.versions.lock().await;

    if let Some(version) = versions.waiting {
      let mut worker = self.installed_worker(version, WorkerState::Installed)?;
      let handled = worker.on_message(message);
      if worker.skip_waiting_requested() {
        let activation = self.activate_waiting(&mut versions).await?;
        return Ok((handled, Some(activation)));
      }
      return Ok((handled, None));
    }

    match versions.active {
      Some(version) => {
        let mut worker = self.installed_worker(version, WorkerState::Activated)?;
        Ok((worker.on_message(message), None))
      }
      None => {
        debug!(action = %message.action, "No worker to receive message");
        Ok((false, None))
      }
    }
  }

  /// Route a request through the active worker, or straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult> {
    match self.active().await {
      Some(version) => {
        self
          .installed_worker(version, WorkerState::Activated)?
          .on_fetch(request)
          .await
      }
      None => {
        debug!(url = %request.url, "No active worker, fetching from network");
        CacheLayer::new(Arc::clone(&self.storage), Arc::clone(&self.network))
          .network_only(request)
          .await
      }
    }
  }

  pub async fn dispatch(&self, event: Event) -> Result<EventOutcome> {
    match event {
      Event::Install => Ok(EventOutcome::Installed(self.install().await?)),
      Event::Activate => Ok(EventOutcome::Activated(self.activate().await?)),
      Event::Fetch(request) => Ok(EventOutcome::Fetched(self.fetch(&request).await?)),
      Event::Message(message) => {
        let (handled, activation) = self.message(&message).await?;
        Ok(EventOutcome::Message {
          handled,
          activation,
        })
      }
    }
  }
}

fn read_version(storage: &SqliteStorage, key: &str) -> Result<Option<u32>> {
  match storage.get_meta(key)? {
    Some(value) => match value.parse() {
      Ok(version) => Ok(Some(version)),
      Err(_) => Err(Error::CorruptRegistration {
        key: key.to_string(),
        value,
      }),
    },
    None => Ok(None),
  }
}

fn write_version(storage: &SqliteStorage, key: &str, version: Option<u32>) -> Result<()> {
  storage.set_meta(key, version.map(|v| v.to_string()).as_deref())
}
