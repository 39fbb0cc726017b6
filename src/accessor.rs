//! Cache-aside accessor: network-first reads with cache fallback, and
//! writes that are accepted locally when the server cannot take them.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::remote::{RemoteApi, RemoteRequest};
use crate::store::{CacheEntry, DurableStore, NewMutation, RequestMeta};

/// Default TTL for values refreshed from the network (24h).
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Online, but the request failed or a local write to the key is still
  /// queued; serving cached data
  CacheFallback,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

/// Result of a read, including data and metadata about the source.
#[derive(Debug, Clone, Serialize)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// The data is an optimistic local write still waiting in the queue
  pub pending: bool,
}

impl<T> CacheResult<T> {
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
      pending: false,
    }
  }

  pub fn is_from_cache(&self) -> bool {
    self.source != CacheSource::Network
  }

  fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
      pending: self.pending,
    }
  }
}

impl CacheResult<Value> {
  fn from_entry(entry: CacheEntry, source: CacheSource) -> Self {
    Self {
      data: entry.value,
      source,
      cached_at: Some(entry.written_at),
      pending: entry.pending,
    }
  }
}

/// Outcome of a write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteOutcome {
  /// Server response when confirmed, otherwise the locally accepted payload
  pub data: Value,
  /// Accepted locally and waiting in the queue
  pub queued: bool,
  pub mutation_id: Option<i64>,
}

/// Read/write policies over the durable store and the remote API.
pub struct CacheAccessor<R> {
  store: Arc<DurableStore>,
  monitor: ConnectivityMonitor,
  remote: Arc<R>,
  ttl_secs: Option<u64>,
}

impl<R: RemoteApi> CacheAccessor<R> {
  pub fn new(store: Arc<DurableStore>, monitor: ConnectivityMonitor, remote: Arc<R>) -> Self {
    Self {
      store,
      monitor,
      remote,
      ttl_secs: Some(DEFAULT_TTL_SECS),
    }
  }

  /// Set the TTL for network results; `None` keeps them until overwritten.
  pub fn with_ttl(mut self, ttl_secs: Option<u64>) -> Self {
    self.ttl_secs = ttl_secs;
    self
  }

  /// Network-first read with cache fallback.
  ///
  /// 1. Offline: serve the cache, or fail with [`SyncError::NoCachedData`]
  /// 2. Online: fetch, cache the result and return it. If a write to
  ///    `cache_key` is still queued, the optimistic entry is kept and returned
  /// 3. Fetch failed: serve the cache, or propagate the network failure
  pub async fn fetch_with_cache(&self, resource: &str, cache_key: &str) -> Result<CacheResult<Value>> {
    if !self.monitor.is_online() {
      return match self.store.get(cache_key)? {
        Some(entry) => Ok(CacheResult::from_entry(entry, CacheSource::Offline)),
        None => Err(SyncError::NoCachedData {
          key: cache_key.to_string(),
        }),
      };
    }

    match self.remote.send(&RemoteRequest::get(resource)).await {
      Ok(data) if self.has_queued_writes(cache_key) => {
        debug!(key = cache_key, "local write still queued, keeping optimistic entry");
        match self.store.get(cache_key) {
          Ok(Some(entry)) if entry.pending => {
            Ok(CacheResult::from_entry(entry, CacheSource::CacheFallback))
          }
          _ => Ok(CacheResult::from_network(data)),
        }
      }
      Ok(data) => {
        if let Err(e) = self.store.put(cache_key, &data, self.ttl_secs) {
          warn!(key = cache_key, error = %e, "failed to cache network result");
        }
        Ok(CacheResult::from_network(data))
      }
      Err(err) => {
        warn!(resource, error = %err, "fetch failed, falling back to cache");
        match self.store.get(cache_key) {
          Ok(Some(entry)) => Ok(CacheResult::from_entry(entry, CacheSource::CacheFallback)),
          Ok(None) => Err(err.into()),
          Err(e) => {
            warn!(key = cache_key, error = %e, "cache unavailable for fallback");
            Err(err.into())
          }
        }
      }
    }
  }

  /// [`fetch_with_cache`](Self::fetch_with_cache), deserialized into `T`.
  pub async fn fetch_as<T: DeserializeOwned>(
    &self,
    resource: &str,
    cache_key: &str,
  ) -> Result<CacheResult<T>> {
    let result = self.fetch_with_cache(resource, cache_key).await?;
    let data = serde_json::from_value(result.data.clone())?;
    Ok(result.map(|_| data))
  }

  /// Write with `PUT`, queueing it when the server cannot take it.
  pub async fn update_with_queue<T: Serialize + ?Sized>(
    &self,
    resource: &str,
    cache_key: &str,
    payload: &T,
  ) -> Result<WriteOutcome> {
    self
      .update_with_method(RequestMeta::default(), resource, cache_key, payload)
      .await
  }

  /// Write using an explicit method and headers.
  ///
  /// Writes never fail because of the network: when offline, when the request
  /// fails, or when earlier writes to the same key are still queued, the write
  /// is queued and the cache is updated optimistically.
  pub async fn update_with_method<T: Serialize + ?Sized>(
    &self,
    request: RequestMeta,
    resource: &str,
    cache_key: &str,
    payload: &T,
  ) -> Result<WriteOutcome> {
    let payload = serde_json::to_value(payload)?;

    if self.monitor.is_online() && !self.has_queued_writes(cache_key) {
      let remote_request = RemoteRequest::write(resource, &request, payload.clone());
      match self.remote.send(&remote_request).await {
        Ok(data) => {
          if let Err(e) = self.store.put(cache_key, &data, self.ttl_secs) {
            warn!(key = cache_key, error = %e, "failed to cache write response");
          }
          return Ok(WriteOutcome {
            data,
            queued: false,
            mutation_id: None,
          });
        }
        Err(err) => {
          info!(resource, error = %err, "write failed, queueing for replay");
        }
      }
    }

    self.queue_locally(request, resource, cache_key, payload)
  }

  fn has_queued_writes(&self, cache_key: &str) -> bool {
    match self.store.list_queue() {
      Ok(queue) => queue.iter().any(|m| m.associated_cache_key == cache_key),
      // Can't tell; queueing keeps the order safe.
      Err(_) => true,
    }
  }

  fn queue_locally(
    &self,
    request: RequestMeta,
    resource: &str,
    cache_key: &str,
    payload: Value,
  ) -> Result<WriteOutcome> {
    let queued = self.store.enqueue(&NewMutation {
      target_resource: resource.to_string(),
      payload: payload.clone(),
      request,
      associated_cache_key: cache_key.to_string(),
    })?;

    // Pending entries never expire; the replay replaces them.
    let optimistic = CacheEntry::new(cache_key, payload.clone(), None).pending();
    if let Err(e) = self.store.put_entry(optimistic) {
      warn!(key = cache_key, error = %e, "failed to write optimistic cache entry");
    }

    debug!(id = queued.id, key = cache_key, "write accepted locally");
    Ok(WriteOutcome {
      data: payload,
      queued: true,
      mutation_id: Some(queued.id),
    })
  }

  /// Drop the cached value under `cache_key`.
  pub fn invalidate(&self, cache_key: &str) -> Result<()> {
    self.store.delete(cache_key)
  }
}

impl<R> Clone for CacheAccessor<R> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      monitor: self.monitor.clone(),
      remote: Arc::clone(&self.remote),
      ttl_secs: self.ttl_secs,
    }
  }
}
