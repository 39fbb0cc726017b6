//! Remote API boundary.
//!
//! The core talks to the server through [`RemoteApi`]; [`HttpRemote`] is the
//! reqwest implementation used by the client and the CLI.

use reqwest::Method;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::auth::CredentialSource;
use crate::error::RemoteError;
use crate::store::{QueuedMutation, RequestMeta};

/// Header carrying [`QueuedMutation::idempotency_key`] on replays.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// A request against the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
  /// Resource path, resolved against the API base URL
  pub resource: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
}

impl RemoteRequest {
  pub fn get(resource: impl Into<String>) -> Self {
    Self {
      resource: resource.into(),
      method: "GET".into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  /// A write carrying `body`, using the method and headers in `meta`.
  pub fn write(resource: impl Into<String>, meta: &RequestMeta, body: Value) -> Self {
    Self {
      resource: resource.into(),
      method: meta.method.clone(),
      headers: meta.headers.clone(),
      body: Some(body),
    }
  }

  /// Rebuild the original request of a queued mutation.
  pub fn replay(mutation: &QueuedMutation) -> Self {
    let mut request = Self::write(
      mutation.target_resource.clone(),
      &mutation.request,
      mutation.payload.clone(),
    );
    request
      .headers
      .insert(IDEMPOTENCY_HEADER.to_string(), mutation.idempotency_key());
    request
  }
}

/// Transport used by the accessor, the sync engine and the liveness probe.
pub trait RemoteApi: Send + Sync {
  /// Perform a request and return the decoded JSON response (`null` when empty).
  fn send(
    &self,
    request: &RemoteRequest,
  ) -> impl Future<Output = Result<Value, RemoteError>> + Send;

  /// Hit the liveness endpoint without credentials, giving up after `timeout`.
  fn health(&self, timeout: Duration) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// HTTP client for the remote API.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  health_path: String,
  credential: Option<Arc<dyn CredentialSource>>,
}

impl HttpRemote {
  pub fn new(
    base_url: &str,
    health_path: &str,
    request_timeout: Duration,
  ) -> Result<Self, RemoteError> {
    let mut base_url = Url::parse(base_url)
      .map_err(|e| RemoteError::transport(format!("invalid base URL '{}': {}", base_url, e)))?;
    // Relative resources resolve under the base path only with a trailing slash.
    if !base_url.path().ends_with('/') {
      let path = format!("{}/", base_url.path());
      base_url.set_path(&path);
    }

    let client = reqwest::Client::builder()
      .timeout(request_timeout)
      .build()
      .map_err(|e| RemoteError::transport(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base_url,
      health_path: health_path.to_string(),
      credential: None,
    })
  }

  /// Send the credential from `source` as a bearer token on API requests.
  pub fn with_credential(mut self, source: Arc<dyn CredentialSource>) -> Self {
    self.credential = Some(source);
    self
  }

  fn url_for(&self, resource: &str) -> Result<Url, RemoteError> {
    self
      .base_url
      .join(resource)
      .map_err(|e| RemoteError::transport(format!("invalid resource '{}': {}", resource, e)))
  }
}

impl RemoteApi for HttpRemote {
  async fn send(&self, request: &RemoteRequest) -> Result<Value, RemoteError> {
    let url = self.url_for(&request.resource)?;
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|_| RemoteError::transport(format!("invalid method '{}'", request.method)))?;

    debug!(method = %method, url = %url, "remote request");

    let mut builder = self.client.request(method, url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(token) = self.credential.as_ref().and_then(|c| c.token()) {
      builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| RemoteError::transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(RemoteError::status(status.as_u16(), text));
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| RemoteError::transport(e.to_string()))?;
    if bytes.is_empty() {
      return Ok(Value::Null);
    }

    serde_json::from_slice(&bytes)
      .map_err(|e| RemoteError::status(status.as_u16(), format!("invalid JSON response: {}", e)))
  }

  async fn health(&self, timeout: Duration) -> Result<(), RemoteError> {
    let url = self.url_for(&self.health_path)?;

    let response = tokio::time::timeout(timeout, self.client.get(url).send())
      .await
      .map_err(|_| RemoteError::transport("liveness probe timed out"))?
      .map_err(|e| RemoteError::transport(e.to_string()))?;

    if response.status().is_success() {
      Ok(())
    } else {
      Err(RemoteError::status(
        response.status().as_u16(),
        "liveness probe failed",
      ))
    }
  }
}
