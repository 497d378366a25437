use serde::Deserialize;

use crate::cache::{CacheResult, Request};
use crate::error::Result;
use crate::registration::{Activation, InstallOutcome};

/// Lifecycle events the platform delivers to the worker
#[derive(Debug)]
pub enum Event {
  /// A new worker version should populate its static cache
  Install,
  /// The waiting worker should take over
  Activate,
  /// A page request to intercept
  Fetch(Request),
  /// Control message posted by a page
  Message(Message),
}

/// What handling an event produced
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallOutcome),
  /// `None` when no worker was waiting
  Activated(Option<Activation>),
  Fetched(CacheResult),
  Message {
    /// Whether the action was recognised
    handled: bool,
    /// Set when the message made a waiting worker take over
    activation: Option<Activation>,
  },
}

/// Control message, e.g. `{"action": "skip-waiting"}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
  pub action: String,
}

/// Recognised message actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
  SkipWaiting,
  Unknown,
}

impl Message {
  #[cfg(test)]
  pub fn skip_waiting() -> Self {
    Self {
      action: "skip-waiting".to_string(),
    }
  }

  /// Parse a JSON message body.
  pub fn parse(json: &str) -> Result<Self> {
    Ok(serde_json::from_str(json)?)
  }

  pub fn kind(&self) -> MessageKind {
    match self.action.as_str() {
      "skip-waiting" => MessageKind::SkipWaiting,
      _ => MessageKind::Unknown,
    }
  }
}
