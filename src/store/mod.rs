//! Durable storage for cached values and pending mutations.
//!
//! Two logical partitions live in every backend:
//! - the cache partition: JSON value + write time + optional TTL
//! - the queue partition: append-only mutations replayed in id order
//!
//! [`DurableStore`] fronts an ordered list of backends (SQLite first, memory
//! second) and degrades to the next one when a backend fails.

mod backend;
mod durable;
mod sqlite;
mod types;

pub use backend::{MemoryBackend, StoreBackend};
pub use durable::DurableStore;
pub use sqlite::SqliteBackend;
pub use types::{CacheEntry, NewMutation, QueuedMutation, RequestMeta};
