//! Offline-first client wiring the store, monitor, accessor, sync engine and
//! credential validator together.

use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::accessor::{CacheAccessor, CacheResult, WriteOutcome};
use crate::auth::{
  AuthStatus, CookieFileCredential, CredentialSource, EnvCredential, OfflineValidator,
};
use crate::config::{AuthConfig, Config};
use crate::connectivity::ConnectivityMonitor;
use crate::error::Result;
use crate::remote::{HttpRemote, RemoteApi, RemoteRequest};
use crate::store::DurableStore;
use crate::sync::{DrainReport, SyncEngine};

/// Pick the credential carrier configured in `auth`.
pub fn credential_source(auth: &AuthConfig) -> Arc<dyn CredentialSource> {
  match &auth.cookie_file {
    Some(path) => Arc::new(CookieFileCredential::new(path, auth.cookie_name.clone())),
    None => Arc::new(EnvCredential::new(auth.token_env.clone())),
  }
}

pub struct OfflineClient<R = HttpRemote> {
  store: Arc<DurableStore>,
  remote: Arc<R>,
  monitor: ConnectivityMonitor,
  accessor: CacheAccessor<R>,
  sync: Arc<SyncEngine<R>>,
  auth: OfflineValidator,
  reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineClient<HttpRemote> {
  /// Build an HTTP-backed client from configuration.
  pub fn from_config(config: &Config) -> Result<Self> {
    let credential = credential_source(&config.auth);
    let remote = HttpRemote::new(
      &config.remote.base_url,
      &config.remote.health_path,
      config.remote.request_timeout(),
    )?
    .with_credential(Arc::clone(&credential));

    let store = match config.cache.store_path() {
      Some(path) => DurableStore::open(&path),
      None => {
        warn!("no data directory available, cache will not survive restarts");
        DurableStore::in_memory()
      }
    };

    Ok(Self::with_parts(
      Arc::new(remote),
      Arc::new(store),
      credential,
      config,
    ))
  }
}

impl<R: RemoteApi + 'static> OfflineClient<R> {
  pub fn with_parts(
    remote: Arc<R>,
    store: Arc<DurableStore>,
    credential: Arc<dyn CredentialSource>,
    config: &Config,
  ) -> Self {
    let monitor = ConnectivityMonitor::for_remote(Arc::clone(&remote), &config.connectivity, None);
    let ttl = Some(config.cache.ttl_secs);

    let accessor = CacheAccessor::new(Arc::clone(&store), monitor.clone(), Arc::clone(&remote))
      .with_ttl(ttl);
    let sync = Arc::new(
      SyncEngine::new(Arc::clone(&store), monitor.clone(), Arc::clone(&remote)).with_ttl(ttl),
    );
    let auth = OfflineValidator::new(Arc::clone(&store), credential);

    Self {
      store,
      remote,
      monitor,
      accessor,
      sync,
      auth,
      reconnect: Mutex::new(None),
    }
  }

  /// Start connectivity polling and drain-on-reconnect.
  pub fn start(&self) {
    self.monitor.spawn_polling();
    if let Ok(mut reconnect) = self.reconnect.lock() {
      if reconnect.is_none() {
        *reconnect = Some(self.sync.spawn_on_reconnect());
      }
    }
    info!("offline client started");
  }

  /// Stop background tasks. Queued mutations stay in the store.
  pub fn shutdown(&self) {
    self.monitor.shutdown();
    if let Ok(mut reconnect) = self.reconnect.lock() {
      if let Some(handle) = reconnect.take() {
        handle.abort();
      }
    }
    info!("offline client stopped");
  }

  pub fn store(&self) -> &Arc<DurableStore> {
    &self.store
  }

  pub fn monitor(&self) -> &ConnectivityMonitor {
    &self.monitor
  }

  pub fn accessor(&self) -> &CacheAccessor<R> {
    &self.accessor
  }

  pub fn sync(&self) -> &Arc<SyncEngine<R>> {
    &self.sync
  }

  pub fn auth(&self) -> &OfflineValidator {
    &self.auth
  }

  pub async fn fetch_with_cache(&self, resource: &str, cache_key: &str) -> Result<CacheResult<Value>> {
    self.accessor.fetch_with_cache(resource, cache_key).await
  }

  pub async fn update_with_queue<T: Serialize + ?Sized>(
    &self,
    resource: &str,
    cache_key: &str,
    payload: &T,
  ) -> Result<WriteOutcome> {
    self
      .accessor
      .update_with_queue(resource, cache_key, payload)
      .await
  }

  pub async fn drain_queue(&self) -> Result<DrainReport> {
    self.sync.drain_queue().await
  }

  pub fn is_authenticated(&self) -> AuthStatus {
    self.auth.is_authenticated()
  }

  /// Fetch the current user while online and cache it for offline checks.
  ///
  /// Offline, or if the fetch fails, the status is computed from the cache.
  pub async fn refresh_identity(&self, resource: &str) -> Result<AuthStatus> {
    if self.monitor.is_online() {
      match self.remote.send(&RemoteRequest::get(resource)).await {
        Ok(user) if !user.is_null() => {
          let token = self.auth.credential().token();
          self.auth.remember(&user, token.as_deref())?;
        }
        Ok(_) => warn!(resource, "user endpoint returned no identity"),
        Err(e) => warn!(resource, error = %e, "identity refresh failed"),
      }
    }
    Ok(self.auth.is_authenticated())
  }

  /// Record a successful online sign-in.
  pub fn sign_in<T: Serialize + ?Sized>(&self, user: &T, token: Option<&str>) -> Result<()> {
    self.auth.remember(user, token)
  }

  pub fn sign_out(&self) -> Result<()> {
    self.auth.sign_out()
  }
}
