//! Error taxonomy shared by every component.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Failure reported by a single storage backend.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("stored value is corrupt: {0}")]
  Corrupt(String),
  #[error("lock poisoned: {0}")]
  Poisoned(String),
  #[error("backend unavailable: {0}")]
  Unavailable(String),
  #[error("no queued mutation with id {0}")]
  UnknownMutation(i64),
}

impl StoreError {
  /// Whether the backend itself is failing, as opposed to the data or the
  /// request being wrong. Only outages justify moving to a fallback.
  pub fn is_outage(&self) -> bool {
    matches!(
      self,
      StoreError::Sqlite(_) | StoreError::Poisoned(_) | StoreError::Unavailable(_)
    )
  }
}

/// Failure reported by the remote API boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteError {
  /// HTTP status when the server answered, `None` for transport failures
  pub status: Option<u16>,
  pub message: String,
}

impl fmt::Display for RemoteError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.status {
      Some(status) => write!(f, "remote returned {}: {}", status, self.message),
      None => write!(f, "remote unreachable: {}", self.message),
    }
  }
}

impl RemoteError {
  pub fn transport(message: impl Into<String>) -> Self {
    Self {
      status: None,
      message: message.into(),
    }
  }

  pub fn status(status: u16, message: impl Into<String>) -> Self {
    Self {
      status: Some(status),
      message: message.into(),
    }
  }
}

#[derive(Error, Debug)]
pub enum SyncError {
  /// Every storage backend failed for this operation.
  #[error("storage unavailable during {op}: {reason}")]
  StorageUnavailable { op: &'static str, reason: String },

  /// Offline read with nothing cached under the key.
  #[error("no offline data available for '{key}'")]
  NoCachedData { key: String },

  #[error("network failure: {0}")]
  NetworkFailure(#[from] RemoteError),

  /// The locally decoded credential has expired and nothing cached can stand in for it.
  #[error("credential expired; sign in again while online")]
  CredentialExpired,

  #[error("not authenticated")]
  Unauthenticated,

  #[error("payload cannot be serialized: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
