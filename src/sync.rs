//! Queue drain: replays pending mutations against the remote API.
//!
//! Replay is strictly sequential and FIFO. The first failure halts the drain
//! and leaves the failed mutation (and everything after it) queued, so a
//! later write to a resource is never applied before an earlier one.
//! Delivery is at-least-once: a mutation whose success was not recorded
//! locally is sent again on the next drain.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::error::{RemoteError, Result};
use crate::remote::{RemoteApi, RemoteRequest};
use crate::store::DurableStore;

/// Why a drain stopped before emptying the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DrainHalt {
  /// Connectivity was lost between replays
  Offline,
  /// The remote rejected or never answered this mutation
  Failed { id: i64, error: RemoteError },
}

/// Summary of one drain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrainReport {
  pub drained: usize,
  pub remaining: usize,
  pub halted: Option<DrainHalt>,
  /// Another drain was already running; nothing was done
  pub skipped: bool,
}

impl DrainReport {
  fn skipped() -> Self {
    Self {
      drained: 0,
      remaining: 0,
      halted: None,
      skipped: true,
    }
  }

  pub fn is_complete(&self) -> bool {
    !self.skipped && self.remaining == 0
  }
}

/// Sync statistics for observability
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncStats {
  pub total_drained: u64,
  pub total_failures: u64,
  pub draining: bool,
}

/// Clears the draining flag when the drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct SyncEngine<R> {
  store: Arc<DurableStore>,
  monitor: ConnectivityMonitor,
  remote: Arc<R>,
  ttl_secs: Option<u64>,
  draining: AtomicBool,
  total_drained: AtomicU64,
  total_failures: AtomicU64,
}

impl<R: RemoteApi> SyncEngine<R> {
  pub fn new(store: Arc<DurableStore>, monitor: ConnectivityMonitor, remote: Arc<R>) -> Self {
    Self {
      store,
      monitor,
      remote,
      ttl_secs: Some(crate::accessor::DEFAULT_TTL_SECS),
      draining: AtomicBool::new(false),
      total_drained: AtomicU64::new(0),
      total_failures: AtomicU64::new(0),
    }
  }

  /// TTL for cache entries refreshed from replay responses.
  pub fn with_ttl(mut self, ttl_secs: Option<u64>) -> Self {
    self.ttl_secs = ttl_secs;
    self
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::Acquire)
  }

  pub fn stats(&self) -> SyncStats {
    SyncStats {
      total_drained: self.total_drained.load(Ordering::Relaxed),
      total_failures: self.total_failures.load(Ordering::Relaxed),
      draining: self.is_draining(),
    }
  }

  /// Replay queued mutations in order until the queue is empty, a replay
  /// fails, or connectivity is lost.
  ///
  /// Returns a skipped report if a drain is already running.
  pub async fn drain_queue(&self) -> Result<DrainReport> {
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("drain already in progress");
      return Ok(DrainReport::skipped());
    }
    let _guard = DrainGuard(&self.draining);

    let mut queue = self.store.list_queue()?;
    if queue.is_empty() {
      return Ok(DrainReport {
        drained: 0,
        remaining: 0,
        halted: None,
        skipped: false,
      });
    }

    info!(pending = queue.len(), "draining mutation queue");
    let mut drained = 0;
    let mut halted = None;
    let mut last_replayed = None;

    while let Some(next) = queue.first().cloned() {
      if !self.monitor.is_online() {
        info!(pending = queue.len(), "connectivity lost, pausing drain");
        halted = Some(DrainHalt::Offline);
        break;
      }
      if last_replayed == Some(next.id) {
        // Dequeue reported success but the entry is still at the head.
        error!(id = next.id, "queue head did not advance, stopping drain");
        break;
      }

      match self.remote.send(&RemoteRequest::replay(&next)).await {
        Ok(response) => {
          self.store.dequeue(next.id)?;
          last_replayed = Some(next.id);
          drained += 1;
          self.total_drained.fetch_add(1, Ordering::Relaxed);
          debug!(id = next.id, resource = %next.target_resource, "mutation replayed");

          queue = self.store.list_queue()?;
          let superseded = queue
            .iter()
            .any(|m| m.associated_cache_key == next.associated_cache_key);
          if !superseded {
            if let Err(e) = self
              .store
              .put(&next.associated_cache_key, &response, self.ttl_secs)
            {
              warn!(key = %next.associated_cache_key, error = %e, "failed to cache replay response");
            }
          }
        }
        Err(err) => {
          warn!(id = next.id, error = %err, "replay failed, halting drain");
          self.total_failures.fetch_add(1, Ordering::Relaxed);
          halted = Some(DrainHalt::Failed {
            id: next.id,
            error: err,
          });
          break;
        }
      }
    }

    let report = DrainReport {
      drained,
      remaining: queue.len(),
      halted,
      skipped: false,
    };
    info!(
      drained = report.drained,
      remaining = report.remaining,
      "drain finished"
    );
    Ok(report)
  }
}

impl<R: RemoteApi + 'static> SyncEngine<R> {
  /// Drain whenever connectivity comes back, and once at start if there is
  /// a backlog and we are already online.
  pub fn spawn_on_reconnect(self: &Arc<Self>) -> JoinHandle<()> {
    let engine = Arc::clone(self);
    let mut changes = self.monitor.subscribe();

    tokio::spawn(async move {
      if engine.monitor.is_online() {
        engine.drain_logged().await;
      }

      loop {
        match changes.recv().await {
          Ok(change) if change.to == Connectivity::Online => {
            engine.drain_logged().await;
          }
          Ok(_) => {}
          Err(RecvError::Lagged(missed)) => {
            debug!(missed, "connectivity changes lagged");
            if engine.monitor.is_online() {
              engine.drain_logged().await;
            }
          }
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  async fn drain_logged(&self) {
    match self.store.queue_len() {
      Ok(0) => return,
      Ok(_) => {}
      Err(e) => {
        warn!(error = %e, "cannot read queue");
        return;
      }
    }
    if let Err(e) = self.drain_queue().await {
      error!(error = %e, "drain failed");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::accessor::CacheAccessor;
  use crate::error::{StoreError, SyncError};
  use crate::store::{
    CacheEntry, MemoryBackend, NewMutation, QueuedMutation, RequestMeta, StoreBackend,
  };
  use crate::testing::FakeRemote;
  use chrono::{DateTime, Utc};
  use serde_json::json;
  use std::time::Duration;

  struct Harness {
    remote: Arc<FakeRemote>,
    store: Arc<DurableStore>,
    accessor: CacheAccessor<FakeRemote>,
    engine: Arc<SyncEngine<FakeRemote>>,
  }

  fn harness_with(store: DurableStore) -> Harness {
    let remote = Arc::new(FakeRemote::online());
    let store = Arc::new(store);
    let accessor = CacheAccessor::new(Arc::clone(&store), remote.monitor(), Arc::clone(&remote));
    let engine = Arc::new(SyncEngine::new(
      Arc::clone(&store),
      remote.monitor(),
      Arc::clone(&remote),
    ));
    Harness {
      remote,
      store,
      accessor,
      engine,
    }
  }

  fn harness() -> Harness {
    harness_with(DurableStore::in_memory())
  }

  async fn write(h: &Harness, name: &str) {
    let outcome = h
      .accessor
      .update_with_queue("/api/profile", "profile", &json!({ "name": name }))
      .await
      .unwrap();
    assert!(outcome.queued);
  }

  #[tokio::test]
  async fn test_offline_write_then_reconnect_and_drain() {
    let h = harness();
    h.remote.go_offline();
    write(&h, "A").await;

    let read = h.accessor.fetch_with_cache("/api/profile", "profile").await.unwrap();
    assert_eq!(read.data, json!({"name": "A"}));
    assert!(read.pending);
    assert_eq!(h.store.queue_len().unwrap(), 1);

    h.remote.go_online().await;
    h.remote.respond("/api/profile", json!({"name": "A", "rev": 1}));
    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.drained, 1);
    assert!(report.is_complete());
    assert_eq!(h.store.queue_len().unwrap(), 0);

    let read = h.accessor.fetch_with_cache("/api/profile", "profile").await.unwrap();
    assert_eq!(read.data, json!({"name": "A", "rev": 1}));
    assert!(!read.pending);
  }

  #[tokio::test]
  async fn test_replay_is_fifo() {
    let h = harness();
    h.remote.go_offline();
    for name in ["A", "B", "C"] {
      write(&h, name).await;
    }
    h.remote.go_online().await;

    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.drained, 3);

    let names: Vec<_> = h
      .remote
      .requests()
      .into_iter()
      .map(|r| r.body.unwrap()["name"].clone())
      .collect();
    assert_eq!(names, vec![json!("A"), json!("B"), json!("C")]);
  }

  #[tokio::test]
  async fn test_first_failure_halts_and_keeps_everything() {
    let h = harness();
    h.remote.go_offline();
    write(&h, "A").await;
    write(&h, "B").await;
    assert_eq!(h.store.queue_len().unwrap(), 2);

    h.remote.go_online().await;
    h.remote.fail_requests(true);
    let report = h.engine.drain_queue().await.unwrap();

    assert_eq!(report.drained, 0);
    assert_eq!(report.remaining, 2);
    let first_id = h.store.list_queue().unwrap()[0].id;
    assert!(matches!(report.halted, Some(DrainHalt::Failed { id, .. }) if id == first_id));
    assert_eq!(h.remote.request_count(), 1);

    let queue = h.store.list_queue().unwrap();
    assert_eq!(queue[0].payload, json!({"name": "A"}));
    assert_eq!(queue[1].payload, json!({"name": "B"}));
  }

  #[tokio::test]
  async fn test_failure_mid_queue_keeps_tail() {
    let h = harness();
    h.remote.go_offline();
    for name in ["A", "B", "C"] {
      write(&h, name).await;
    }
    h.remote.go_online().await;
    h.remote.fail_after(Some(1));

    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.remaining, 2);

    let queue = h.store.list_queue().unwrap();
    assert_eq!(queue[0].payload, json!({"name": "B"}));
    // Later write still queued, so the optimistic value stays.
    let entry = h.store.get("profile").unwrap().unwrap();
    assert_eq!(entry.value, json!({"name": "C"}));
    assert!(entry.pending);
  }

  #[tokio::test]
  async fn test_drain_stops_when_offline() {
    let h = harness();
    h.remote.go_offline();
    write(&h, "A").await;

    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.halted, Some(DrainHalt::Offline));
    assert_eq!(report.remaining, 1);
    assert_eq!(h.remote.request_count(), 0);
  }

  #[tokio::test]
  async fn test_empty_queue_is_complete() {
    let h = harness();
    let report = h.engine.drain_queue().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.drained, 0);
  }

  #[tokio::test]
  async fn test_concurrent_drain_is_skipped() {
    let h = harness();
    h.engine.draining.store(true, Ordering::SeqCst);
    let report = h.engine.drain_queue().await.unwrap();
    assert!(report.skipped);
    assert!(!report.is_complete());

    h.engine.draining.store(false, Ordering::SeqCst);
    assert!(!h.engine.drain_queue().await.unwrap().skipped);
    assert!(!h.engine.is_draining());
  }

  #[tokio::test]
  async fn test_replays_carry_idempotency_key() {
    let h = harness();
    h.remote.go_offline();
    write(&h, "A").await;
    let expected = h.store.list_queue().unwrap()[0].idempotency_key();
    h.remote.go_online().await;

    h.engine.drain_queue().await.unwrap();
    let sent = &h.remote.requests()[0];
    assert_eq!(
      sent.headers.get(crate::remote::IDEMPOTENCY_HEADER),
      Some(&expected)
    );
  }

  /// Memory backend whose dequeue can be made to fail, simulating a crash
  /// between remote success and the local acknowledgement.
  struct LossyAckBackend {
    inner: MemoryBackend,
    lose_acks: Arc<AtomicBool>,
  }

  impl StoreBackend for LossyAckBackend {
    fn name(&self) -> &'static str {
      "lossy"
    }
    fn get(&self, key: &str) -> std::result::Result<Option<CacheEntry>, StoreError> {
      self.inner.get(key)
    }
    fn put(&self, entry: &CacheEntry) -> std::result::Result<(), StoreError> {
      self.inner.put(entry)
    }
    fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
      self.inner.delete(key)
    }
    fn keys(&self) -> std::result::Result<Vec<String>, StoreError> {
      self.inner.keys()
    }
    fn enqueue(
      &self,
      mutation: &NewMutation,
      at: DateTime<Utc>,
    ) -> std::result::Result<QueuedMutation, StoreError> {
      self.inner.enqueue(mutation, at)
    }
    fn list_queue(&self) -> std::result::Result<Vec<QueuedMutation>, StoreError> {
      self.inner.list_queue()
    }
    fn dequeue(&self, id: i64) -> std::result::Result<(), StoreError> {
      if self.lose_acks.load(Ordering::SeqCst) {
        return Err(StoreError::Unavailable("crashed".into()));
      }
      self.inner.dequeue(id)
    }
    fn restore(&self, mutation: &QueuedMutation) -> std::result::Result<(), StoreError> {
      self.inner.restore(mutation)
    }
    fn clear(&self) -> std::result::Result<(), StoreError> {
      self.inner.clear()
    }
  }

  #[tokio::test]
  async fn test_lost_ack_replays_again() {
    let lose_acks = Arc::new(AtomicBool::new(true));
    let h = harness_with(DurableStore::new(vec![Box::new(LossyAckBackend {
      inner: MemoryBackend::new(),
      lose_acks: Arc::clone(&lose_acks),
    })]));

    h.store
      .enqueue(&NewMutation {
        target_resource: "/api/profile".into(),
        payload: json!({"name": "A"}),
        request: RequestMeta::default(),
        associated_cache_key: "profile".into(),
      })
      .unwrap();

    let err = h.engine.drain_queue().await.unwrap_err();
    assert!(matches!(err, SyncError::StorageUnavailable { op: "dequeue", .. }));
    assert_eq!(h.store.queue_len().unwrap(), 1);
    assert!(!h.engine.is_draining());

    lose_acks.store(false, Ordering::SeqCst);
    let report = h.engine.drain_queue().await.unwrap();
    assert_eq!(report.drained, 1);

    let requests = h.remote.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);
  }

  #[tokio::test]
  async fn test_lost_ack_with_fallback_still_delivers_everything() {
    let h = harness_with(DurableStore::new(vec![
      Box::new(LossyAckBackend {
        inner: MemoryBackend::new(),
        lose_acks: Arc::new(AtomicBool::new(true)),
      }),
      Box::new(MemoryBackend::new()),
    ]));

    h.remote.go_offline();
    write(&h, "A").await;
    let outcome = h
      .accessor
      .update_with_queue("/api/other", "other", &json!({"name": "B"}))
      .await
      .unwrap();
    assert!(outcome.queued);

    h.remote.respond("/api/profile", json!({"name": "A", "saved": true}));
    h.remote.go_online().await;
    let report = h.engine.drain_queue().await.unwrap();

    assert_eq!(report.drained, 2);
    assert_eq!(report.remaining, 0);
    assert!(report.halted.is_none());
    assert_eq!(h.store.active_backend(), "memory");
    let sent: Vec<String> = h.remote.requests().into_iter().map(|r| r.resource).collect();
    assert_eq!(sent, vec!["/api/profile", "/api/other"]);

    h.remote.go_offline();
    let read = h.accessor.fetch_with_cache("/api/other", "other").await.unwrap();
    assert_eq!(read.data, json!({"name": "B"}));
    assert!(!read.pending);
  }

  #[tokio::test]
  async fn test_reconnect_triggers_drain() {
    let h = harness();
    h.remote.go_offline();
    write(&h, "A").await;

    let task = h.engine.spawn_on_reconnect();
    h.remote.go_online().await;

    tokio::time::timeout(Duration::from_secs(5), async {
      while h.store.queue_len().unwrap() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();

    assert_eq!(h.engine.stats().total_drained, 1);
    task.abort();
  }
}
