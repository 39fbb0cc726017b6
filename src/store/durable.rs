//! Durable store: an ordered chain of backends behind one interface.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, error, warn};

use super::backend::{MemoryBackend, StoreBackend};
use super::sqlite::SqliteBackend;
use super::types::{CacheEntry, NewMutation, QueuedMutation};
use crate::error::{Result, StoreError, SyncError};

/// Storage for the cache and queue partitions.
///
/// Operations run against the active backend. When it is down the store
/// copies what it can still read into the next backend and keeps using that
/// one. Corrupt data and unknown queue ids are reported to the caller and
/// never trigger a move.
pub struct DurableStore {
  backends: Vec<Box<dyn StoreBackend>>,
  active: AtomicUsize,
  failover: Mutex<()>,
}

impl DurableStore {
  /// Build a store from backends in preference order.
  pub fn new(backends: Vec<Box<dyn StoreBackend>>) -> Self {
    Self {
      backends,
      active: AtomicUsize::new(0),
      failover: Mutex::new(()),
    }
  }

  /// SQLite at `path` with an in-memory fallback.
  ///
  /// If the database cannot be opened the store starts on the fallback.
  pub fn open(path: &Path) -> Self {
    let mut backends: Vec<Box<dyn StoreBackend>> = Vec::with_capacity(2);
    match SqliteBackend::open(path) {
      Ok(sqlite) => backends.push(Box::new(sqlite)),
      Err(e) => warn!(
        path = %path.display(),
        error = %e,
        "durable store unavailable, using in-memory fallback"
      ),
    }
    backends.push(Box::new(MemoryBackend::new()));
    Self::new(backends)
  }

  /// Memory-only store.
  pub fn in_memory() -> Self {
    Self::new(vec![Box::new(MemoryBackend::new())])
  }

  /// Name of the backend currently serving calls.
  pub fn active_backend(&self) -> &'static str {
    self
      .backends
      .get(self.active.load(Ordering::Acquire))
      .map(|b| b.name())
      .unwrap_or("none")
  }

  fn run<T>(
    &self,
    op: &'static str,
    f: impl Fn(&dyn StoreBackend) -> std::result::Result<T, StoreError>,
  ) -> Result<T> {
    let start = self.active.load(Ordering::Acquire);
    let mut last_error = String::from("no storage backend configured");

    for (idx, backend) in self.backends.iter().enumerate().skip(start) {
      if idx > start {
        self.fail_over(start, idx);
      }
      match f(backend.as_ref()) {
        Ok(value) => return Ok(value),
        Err(e) if !e.is_outage() => {
          error!(backend = backend.name(), op, error = %e, "storage operation rejected");
          return Err(SyncError::StorageUnavailable {
            op,
            reason: e.to_string(),
          });
        }
        Err(e) => {
          warn!(backend = backend.name(), op, error = %e, "storage backend failed");
          last_error = e.to_string();
        }
      }
    }

    Err(SyncError::StorageUnavailable {
      op,
      reason: last_error,
    })
  }

  /// Make `to` the active backend, first copying whatever `from` can still
  /// read so cached values and queued mutations stay visible.
  fn fail_over(&self, from: usize, to: usize) {
    let Ok(_guard) = self.failover.lock() else {
      return;
    };
    if self.active.load(Ordering::Acquire) >= to {
      return;
    }

    let (source, target) = (self.backends[from].as_ref(), self.backends[to].as_ref());
    match copy_contents(source, target) {
      Ok((entries, mutations)) => warn!(
        from = source.name(),
        to = target.name(),
        entries,
        mutations,
        "storage degraded to fallback backend"
      ),
      Err(e) => warn!(
        from = source.name(),
        to = target.name(),
        error = %e,
        "storage degraded to fallback backend, previous contents unreadable"
      ),
    }
    self.active.fetch_max(to, Ordering::AcqRel);
  }

  /// Serialize `value` and store it under `key`.
  pub fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<u64>) -> Result<()> {
    let value = serde_json::to_value(value)?;
    self.put_entry(CacheEntry::new(key, value, ttl))
  }

  /// Store a pre-built entry, replacing any previous value.
  pub fn put_entry(&self, entry: CacheEntry) -> Result<()> {
    self.run("put", |b| b.put(&entry))
  }

  /// Read an entry, evicting it if its TTL has elapsed.
  pub fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let Some(entry) = self.run("get", |b| b.get(key))? else {
      return Ok(None);
    };

    if entry.is_expired_at(Utc::now()) {
      debug!(key, "cache entry expired");
      if let Err(e) = self.delete(key) {
        warn!(key, error = %e, "failed to evict expired entry");
      }
      return Ok(None);
    }

    Ok(Some(entry))
  }

  /// Read and deserialize the value under `key`.
  pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    match self.get(key)? {
      Some(entry) => Ok(Some(serde_json::from_value(entry.value)?)),
      None => Ok(None),
    }
  }

  pub fn delete(&self, key: &str) -> Result<()> {
    self.run("delete", |b| b.delete(key))
  }

  /// Keys in the cache partition, including ones whose TTL has lapsed.
  pub fn keys(&self) -> Result<Vec<String>> {
    self.run("keys", |b| b.keys())
  }

  pub fn enqueue(&self, mutation: &NewMutation) -> Result<QueuedMutation> {
    let enqueued_at = Utc::now();
    let queued = self.run("enqueue", |b| b.enqueue(mutation, enqueued_at))?;
    debug!(
      id = queued.id,
      resource = %queued.target_resource,
      "mutation queued"
    );
    Ok(queued)
  }

  /// Pending mutations in replay order.
  pub fn list_queue(&self) -> Result<Vec<QueuedMutation>> {
    self.run("list_queue", |b| b.list_queue())
  }

  pub fn queue_len(&self) -> Result<usize> {
    Ok(self.list_queue()?.len())
  }

  pub fn dequeue(&self, id: i64) -> Result<()> {
    self.run("dequeue", |b| b.dequeue(id))
  }

  pub fn clear_all(&self) -> Result<()> {
    self.run("clear_all", |b| b.clear())
  }
}

/// Copy both partitions from `source` into `target`, keeping queue ids.
fn copy_contents(
  source: &dyn StoreBackend,
  target: &dyn StoreBackend,
) -> std::result::Result<(usize, usize), StoreError> {
  let keys = source.keys()?;
  let mut entries = 0;
  for key in &keys {
    if let Some(entry) = source.get(key)? {
      target.put(&entry)?;
      entries += 1;
    }
  }

  let queue = source.list_queue()?;
  for mutation in &queue {
    target.restore(mutation)?;
  }
  Ok((entries, queue.len()))
}
