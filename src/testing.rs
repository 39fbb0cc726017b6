//! Scripted remote API used by unit tests.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ConnectivityConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::RemoteError;
use crate::remote::{RemoteApi, RemoteRequest};

pub(crate) struct FakeRemote {
  reachable: Arc<AtomicBool>,
  fail: AtomicBool,
  /// Fail every request once this many have been received
  fail_after: Mutex<Option<usize>>,
  responses: Mutex<HashMap<String, Value>>,
  requests: Mutex<Vec<RemoteRequest>>,
  monitor: ConnectivityMonitor,
}

impl FakeRemote {
  pub(crate) fn online() -> Self {
    let reachable = Arc::new(AtomicBool::new(true));
    let probe_flag = Arc::clone(&reachable);
    let monitor = ConnectivityMonitor::new(
      move |_| {
        let flag = Arc::clone(&probe_flag);
        async move { flag.load(Ordering::SeqCst) }
      },
      &ConnectivityConfig::default(),
      Some(crate::connectivity::Connectivity::Online),
    );

    Self {
      reachable,
      fail: AtomicBool::new(false),
      fail_after: Mutex::new(None),
      responses: Mutex::new(HashMap::new()),
      requests: Mutex::new(Vec::new()),
      monitor,
    }
  }

  pub(crate) fn monitor(&self) -> ConnectivityMonitor {
    self.monitor.clone()
  }

  pub(crate) fn go_offline(&self) {
    self.reachable.store(false, Ordering::SeqCst);
    self.monitor.interface_down();
  }

  pub(crate) async fn go_online(&self) {
    self.reachable.store(true, Ordering::SeqCst);
    self.monitor.interface_up().await;
  }

  pub(crate) fn respond(&self, resource: &str, value: Value) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(resource.to_string(), value);
  }

  pub(crate) fn fail_requests(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  pub(crate) fn fail_after(&self, count: Option<usize>) {
    *self.fail_after.lock().unwrap() = count;
  }

  pub(crate) fn request_count(&self) -> usize {
    self.requests.lock().unwrap().len()
  }

  pub(crate) fn requests(&self) -> Vec<RemoteRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl RemoteApi for FakeRemote {
  async fn send(&self, request: &RemoteRequest) -> Result<Value, RemoteError> {
    let seen = {
      let mut requests = self.requests.lock().unwrap();
      requests.push(request.clone());
      requests.len()
    };

    if !self.reachable.load(Ordering::SeqCst) {
      return Err(RemoteError::transport("connection refused"));
    }
    if self.fail.load(Ordering::SeqCst) {
      return Err(RemoteError::status(500, "scripted failure"));
    }
    if let Some(limit) = *self.fail_after.lock().unwrap() {
      if seen > limit {
        return Err(RemoteError::status(503, "scripted failure"));
      }
    }

    if let Some(value) = self.responses.lock().unwrap().get(&request.resource) {
      return Ok(value.clone());
    }
    match &request.body {
      Some(body) => Ok(body.clone()),
      None => Err(RemoteError::status(404, "not found")),
    }
  }

  async fn health(&self, _timeout: Duration) -> Result<(), RemoteError> {
    if self.reachable.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(RemoteError::transport("connection refused"))
    }
  }
}
