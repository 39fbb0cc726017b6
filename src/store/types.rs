//! Records persisted by the durable store.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A value in the cache partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  pub written_at: DateTime<Utc>,
  /// Maximum age in seconds; `None` never expires
  pub ttl_seconds: Option<u64>,
  /// Optimistic local write not yet confirmed by the server
  #[serde(default)]
  pub pending: bool,
}

impl CacheEntry {
  /// Create a confirmed entry written now.
  pub fn new(key: impl Into<String>, value: Value, ttl_seconds: Option<u64>) -> Self {
    Self {
      key: key.into(),
      value,
      written_at: Utc::now(),
      ttl_seconds,
      pending: false,
    }
  }

  /// Mark this entry as an unconfirmed local write.
  pub fn pending(mut self) -> Self {
    self.pending = true;
    self
  }

  /// An entry is expired once its age strictly exceeds the TTL.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    let Some(ttl) = self.ttl_seconds else {
      return false;
    };
    let age_ms = (now - self.written_at).num_milliseconds();
    age_ms > 0 && (age_ms as u128) > u128::from(ttl) * 1000
  }
}

/// Method and headers to use when replaying a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
  pub method: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
}

impl RequestMeta {
  pub fn new(method: impl Into<String>) -> Self {
    Self {
      method: method.into().to_ascii_uppercase(),
      headers: BTreeMap::new(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

impl Default for RequestMeta {
  fn default() -> Self {
    Self::new("PUT")
  }
}

/// A mutation about to be appended to the queue partition.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
  pub target_resource: String,
  pub payload: Value,
  pub request: RequestMeta,
  pub associated_cache_key: String,
}

/// A mutation waiting in the queue partition.
///
/// Queue order is the order of `id`, which is also the replay order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
  pub id: i64,
  pub target_resource: String,
  pub payload: Value,
  pub request: RequestMeta,
  pub associated_cache_key: String,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedMutation {
  pub(crate) fn from_new(id: i64, mutation: &NewMutation, enqueued_at: DateTime<Utc>) -> Self {
    Self {
      id,
      target_resource: mutation.target_resource.clone(),
      payload: mutation.payload.clone(),
      request: mutation.request.clone(),
      associated_cache_key: mutation.associated_cache_key.clone(),
      enqueued_at,
    }
  }

  /// Stable key identifying this mutation across replays.
  ///
  /// Remote handlers can use it to collapse duplicate deliveries.
  pub fn idempotency_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.id.to_be_bytes());
    hasher.update(self.request.method.as_bytes());
    hasher.update(b"\n");
    hasher.update(self.target_resource.as_bytes());
    hasher.update(b"\n");
    hasher.update(self.payload.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(
      self
        .enqueued_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
  }
}
