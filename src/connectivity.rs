//! Connectivity monitor.
//!
//! Reachability is decided in two layers: interface signals from the platform
//! (a down interface is trusted immediately, an up interface is not) and an
//! active liveness probe against the remote health endpoint. The probe also
//! runs on a fixed interval to catch interfaces that report "up" while the
//! uplink is dead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ConnectivityConfig;
use crate::remote::RemoteApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
  Online,
  Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
  pub status: Connectivity,
  /// When the status was last confirmed or changed
  pub last_checked: DateTime<Utc>,
}

/// A single observed transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityChange {
  pub from: Connectivity,
  pub to: Connectivity,
  pub at: DateTime<Utc>,
}

type ProbeFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type ProbeFn = dyn Fn(Duration) -> ProbeFuture + Send + Sync;

const CHANGE_CAPACITY: usize = 64;

struct MonitorInner {
  state: watch::Sender<ConnectivityState>,
  changes: broadcast::Sender<ConnectivityChange>,
  probe: Box<ProbeFn>,
  probe_timeout: Duration,
  poll_interval: Duration,
  /// Sequence handed to each observation, in start order
  next_seq: AtomicU64,
  /// Latest sequence applied to `state`
  applied_seq: AtomicU64,
  poller: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to the reachability state.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
  /// Create a monitor around an arbitrary probe.
  ///
  /// `hint` is the platform's synchronous guess at startup; without one the
  /// monitor starts optimistic (`Online`).
  pub fn new<F, Fut>(probe: F, config: &ConnectivityConfig, hint: Option<Connectivity>) -> Self
  where
    F: Fn(Duration) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
  {
    let initial = ConnectivityState {
      status: hint.unwrap_or(Connectivity::Online),
      last_checked: Utc::now(),
    };
    let (state, _) = watch::channel(initial);
    let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

    Self {
      inner: Arc::new(MonitorInner {
        state,
        changes,
        probe: Box::new(move |timeout| -> ProbeFuture { Box::pin(probe(timeout)) }),
        probe_timeout: config.probe_timeout(),
        poll_interval: config.probe_interval(),
        next_seq: AtomicU64::new(0),
        applied_seq: AtomicU64::new(0),
        poller: Mutex::new(None),
      }),
    }
  }

  /// Create a monitor that probes the remote API's health endpoint.
  pub fn for_remote<R>(remote: Arc<R>, config: &ConnectivityConfig, hint: Option<Connectivity>) -> Self
  where
    R: RemoteApi + 'static,
  {
    Self::new(
      move |timeout| {
        let remote = Arc::clone(&remote);
        async move { remote.health(timeout).await.is_ok() }
      },
      config,
      hint,
    )
  }

  pub fn state(&self) -> ConnectivityState {
    *self.inner.state.borrow()
  }

  pub fn current(&self) -> Connectivity {
    self.state().status
  }

  pub fn is_online(&self) -> bool {
    self.current() == Connectivity::Online
  }

  /// Receive every transition, in the order it happened.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityChange> {
    self.inner.changes.subscribe()
  }

  /// Watch the latest state.
  pub fn watch_state(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  /// Platform reports the network interface went down.
  pub fn interface_down(&self) {
    let seq = self.inner.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
    self.inner.apply(seq, Connectivity::Offline);
  }

  /// Platform reports the network interface came up; confirm with a probe.
  pub async fn interface_up(&self) -> Connectivity {
    debug!("interface up, probing");
    self.check_now().await
  }

  /// Run the liveness probe now and apply its result.
  pub async fn check_now(&self) -> Connectivity {
    self.inner.check().await
  }

  /// Start probing on the configured interval. Calling this twice is a no-op.
  pub fn spawn_polling(&self) {
    let Ok(mut poller) = self.inner.poller.lock() else {
      return;
    };
    if poller.is_some() {
      return;
    }

    let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
    let period = self.inner.poll_interval;
    *poller = Some(tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        inner.check().await;
      }
    }));
    debug!(interval = ?period, "connectivity polling started");
  }

  /// Stop the polling task.
  pub fn shutdown(&self) {
    if let Ok(mut poller) = self.inner.poller.lock() {
      if let Some(handle) = poller.take() {
        handle.abort();
        debug!("connectivity polling stopped");
      }
    }
  }
}

impl MonitorInner {
  async fn check(&self) -> Connectivity {
    let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
    let reachable = tokio::time::timeout(self.probe_timeout, (self.probe)(self.probe_timeout))
      .await
      .unwrap_or(false);

    let status = if reachable {
      Connectivity::Online
    } else {
      Connectivity::Offline
    };
    self.apply(seq, status)
  }

  /// Record an observation started at `seq`. Observations older than the
  /// last applied one are dropped. Returns the resulting status.
  fn apply(&self, seq: u64, status: Connectivity) -> Connectivity {
    let now = Utc::now();
    let mut result = status;

    self.state.send_if_modified(|state| {
      if seq < self.applied_seq.load(Ordering::Acquire) {
        result = state.status;
        return false;
      }
      self.applied_seq.store(seq, Ordering::Release);
      state.last_checked = now;

      if state.status == status {
        return false;
      }

      let change = ConnectivityChange {
        from: state.status,
        to: status,
        at: now,
      };
      state.status = status;
      info!(from = ?change.from, to = ?change.to, "connectivity changed");
      // Sent under the watch lock so subscribers see changes in order.
      let _ = self.changes.send(change);
      true
    });

    result
  }
}
