//! Storage backend trait and the in-memory fallback substrate.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::types::{CacheEntry, NewMutation, QueuedMutation};
use crate::error::StoreError;

/// A key-value substrate with a cache partition and an ordered queue partition.
///
/// Every method is atomic with respect to other calls on the same backend.
pub trait StoreBackend: Send + Sync {
  /// Short name used in logs (e.g. "sqlite").
  fn name(&self) -> &'static str;

  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

  /// Insert or replace the entry under `entry.key`.
  fn put(&self, entry: &CacheEntry) -> Result<(), StoreError>;

  fn delete(&self, key: &str) -> Result<(), StoreError>;

  /// All keys in the cache partition.
  fn keys(&self) -> Result<Vec<String>, StoreError>;

  /// Append a mutation and return it with its assigned id.
  fn enqueue(
    &self,
    mutation: &NewMutation,
    enqueued_at: DateTime<Utc>,
  ) -> Result<QueuedMutation, StoreError>;

  /// Queued mutations in ascending id order.
  fn list_queue(&self) -> Result<Vec<QueuedMutation>, StoreError>;

  /// Remove a mutation. Fails with `UnknownMutation` if `id` is not queued.
  fn dequeue(&self, id: i64) -> Result<(), StoreError>;

  /// Insert a mutation under its existing id, used when moving a queue
  /// between backends. Later `enqueue` calls get larger ids.
  fn restore(&self, mutation: &QueuedMutation) -> Result<(), StoreError>;

  /// Drop both partitions.
  fn clear(&self) -> Result<(), StoreError>;
}

#[derive(Default)]
struct MemoryState {
  cache: HashMap<String, CacheEntry>,
  queue: BTreeMap<i64, QueuedMutation>,
  next_id: i64,
}

/// Process-local substrate used when the on-disk store is unavailable.
///
/// Nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
  state: Mutex<MemoryState>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
    self
      .state
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl StoreBackend for MemoryBackend {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    Ok(self.lock()?.cache.get(key).cloned())
  }

  fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
    self.lock()?.cache.insert(entry.key.clone(), entry.clone());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self.lock()?.cache.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let mut keys: Vec<String> = self.lock()?.cache.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }

  fn enqueue(
    &self,
    mutation: &NewMutation,
    enqueued_at: DateTime<Utc>,
  ) -> Result<QueuedMutation, StoreError> {
    let mut state = self.lock()?;
    state.next_id += 1;
    let queued = QueuedMutation::from_new(state.next_id, mutation, enqueued_at);
    state.queue.insert(queued.id, queued.clone());
    Ok(queued)
  }

  fn list_queue(&self) -> Result<Vec<QueuedMutation>, StoreError> {
    Ok(self.lock()?.queue.values().cloned().collect())
  }

  fn dequeue(&self, id: i64) -> Result<(), StoreError> {
    match self.lock()?.queue.remove(&id) {
      Some(_) => Ok(()),
      None => Err(StoreError::UnknownMutation(id)),
    }
  }

  fn restore(&self, mutation: &QueuedMutation) -> Result<(), StoreError> {
    let mut state = self.lock()?;
    state.next_id = state.next_id.max(mutation.id);
    state.queue.insert(mutation.id, mutation.clone());
    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    let mut state = self.lock()?;
    state.cache.clear();
    state.queue.clear();
    Ok(())
  }
}
