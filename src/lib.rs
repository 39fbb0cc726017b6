//! # offsync
//!
//! Local-first synchronization for clients with an unreliable network link.
//!
//! - [`store`]: durable cache + mutation queue (SQLite, falling back to memory)
//! - [`connectivity`]: reachability from interface signals and a liveness probe
//! - [`accessor`]: network-first reads with cache fallback, queued writes
//! - [`sync`]: FIFO, at-least-once replay of queued writes on reconnect
//! - [`auth`]: offline credential validation (token → cached identity → deny)
//!
//! [`OfflineClient`] wires all of them from a [`Config`].
//!
//! ```rust,no_run
//! use offsync::{Config, OfflineClient};
//! use serde_json::json;
//!
//! # async fn run() -> offsync::Result<()> {
//! let client = OfflineClient::from_config(&Config::for_base_url("https://api.example.com/v1"))?;
//! client.start();
//!
//! let outcome = client
//!   .update_with_queue("profile", "profile", &json!({"name": "A"}))
//!   .await?;
//! if outcome.queued {
//!   println!("saved locally, will sync when back online");
//! }
//!
//! let profile = client.fetch_with_cache("profile", "profile").await?;
//! println!("{} (pending: {})", profile.data, profile.pending);
//!
//! client.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod auth;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

pub use accessor::{CacheAccessor, CacheResult, CacheSource, WriteOutcome};
pub use auth::{AuthMethod, AuthStatus, CredentialSource, OfflineValidator};
pub use client::OfflineClient;
pub use config::Config;
pub use connectivity::{Connectivity, ConnectivityChange, ConnectivityMonitor, ConnectivityState};
pub use error::{RemoteError, Result, StoreError, SyncError};
pub use remote::{HttpRemote, RemoteApi, RemoteRequest};
pub use store::{CacheEntry, DurableStore, QueuedMutation};
pub use sync::{DrainHalt, DrainReport, SyncEngine};
