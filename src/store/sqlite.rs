//! SQLite-backed primary substrate.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::backend::StoreBackend;
use super::types::{CacheEntry, NewMutation, QueuedMutation, RequestMeta};
use crate::error::StoreError;

/// Schema for the cache and queue partitions.
const STORE_SCHEMA: &str = r#"
-- Cache partition (stores serialized JSON)
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    written_at TEXT NOT NULL,
    ttl_seconds INTEGER,
    pending INTEGER NOT NULL DEFAULT 0
);

-- Queue partition (replay order = id order)
CREATE TABLE IF NOT EXISTS queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target_resource TEXT NOT NULL,
    payload BLOB NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_cache_key ON queue(cache_key);
"#;

/// SQLite-based durable storage.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open the store at `path`, creating parent directories and tables.
  pub fn open(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Unavailable(format!(
          "failed to create store directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened sqlite store");
    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self, StoreError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .map(|dir| dir.join("offsync").join("store.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Poisoned(e.to_string()))
  }
}

impl StoreBackend for SqliteBackend {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
    let conn = self.lock()?;
    let row = conn
      .query_row(
        "SELECT value, written_at, ttl_seconds, pending FROM cache WHERE key = ?",
        params![key],
        |row| {
          Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<i64>>(2)?,
            row.get::<_, bool>(3)?,
          ))
        },
      )
      .optional()?;

    let Some((data, written_at, ttl, pending)) = row else {
      return Ok(None);
    };

    Ok(Some(CacheEntry {
      key: key.to_string(),
      value: decode_json(&data)?,
      written_at: parse_timestamp(&written_at)?,
      ttl_seconds: ttl.map(|t| t.max(0) as u64),
      pending,
    }))
  }

  fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
    let conn = self.lock()?;
    let data = encode_json(&entry.value)?;
    let ttl = entry
      .ttl_seconds
      .map(|t| i64::try_from(t).unwrap_or(i64::MAX));

    conn.execute(
      "INSERT OR REPLACE INTO cache (key, value, written_at, ttl_seconds, pending)
       VALUES (?, ?, ?, ?, ?)",
      params![
        entry.key,
        data,
        format_timestamp(entry.written_at),
        ttl,
        entry.pending
      ],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<(), StoreError> {
    self
      .lock()?
      .execute("DELETE FROM cache WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM cache ORDER BY key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }

  fn enqueue(
    &self,
    mutation: &NewMutation,
    enqueued_at: DateTime<Utc>,
  ) -> Result<QueuedMutation, StoreError> {
    let conn = self.lock()?;
    let payload = encode_json(&mutation.payload)?;
    let headers = serde_json::to_string(&mutation.request.headers)
      .map_err(|e| StoreError::Corrupt(format!("failed to encode headers: {}", e)))?;

    conn.execute(
      "INSERT INTO queue (target_resource, payload, method, headers, cache_key, enqueued_at)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        mutation.target_resource,
        payload,
        mutation.request.method,
        headers,
        mutation.associated_cache_key,
        format_timestamp(enqueued_at)
      ],
    )?;

    Ok(QueuedMutation::from_new(
      conn.last_insert_rowid(),
      mutation,
      enqueued_at,
    ))
  }

  fn list_queue(&self) -> Result<Vec<QueuedMutation>, StoreError> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT id, target_resource, payload, method, headers, cache_key, enqueued_at
       FROM queue ORDER BY id",
    )?;

    let rows = stmt
      .query_map([], RawMutation::from_row)?
      .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(RawMutation::decode).collect()
  }

  fn dequeue(&self, id: i64) -> Result<(), StoreError> {
    let deleted = self
      .lock()?
      .execute("DELETE FROM queue WHERE id = ?", params![id])?;
    if deleted == 0 {
      return Err(StoreError::UnknownMutation(id));
    }
    Ok(())
  }

  fn restore(&self, mutation: &QueuedMutation) -> Result<(), StoreError> {
    let conn = self.lock()?;
    let payload = encode_json(&mutation.payload)?;
    let headers = serde_json::to_string(&mutation.request.headers)
      .map_err(|e| StoreError::Corrupt(format!("failed to encode headers: {}", e)))?;

    conn.execute(
      "INSERT OR REPLACE INTO queue
         (id, target_resource, payload, method, headers, cache_key, enqueued_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        mutation.id,
        mutation.target_resource,
        payload,
        mutation.request.method,
        headers,
        mutation.associated_cache_key,
        format_timestamp(mutation.enqueued_at)
      ],
    )?;
    Ok(())
  }

  fn clear(&self) -> Result<(), StoreError> {
    self
      .lock()?
      .execute_batch("DELETE FROM cache; DELETE FROM queue;")?;
    Ok(())
  }
}

/// Queue row before JSON columns are decoded.
struct RawMutation {
  id: i64,
  target_resource: String,
  payload: Vec<u8>,
  method: String,
  headers: String,
  cache_key: String,
  enqueued_at: String,
}

impl RawMutation {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      target_resource: row.get(1)?,
      payload: row.get(2)?,
      method: row.get(3)?,
      headers: row.get(4)?,
      cache_key: row.get(5)?,
      enqueued_at: row.get(6)?,
    })
  }

  fn decode(self) -> Result<QueuedMutation, StoreError> {
    let headers = serde_json::from_str(&self.headers)
      .map_err(|e| StoreError::Corrupt(format!("queue entry {} headers: {}", self.id, e)))?;

    Ok(QueuedMutation {
      id: self.id,
      target_resource: self.target_resource,
      payload: decode_json(&self.payload)?,
      request: RequestMeta {
        method: self.method,
        headers,
      },
      associated_cache_key: self.cache_key,
      enqueued_at: parse_timestamp(&self.enqueued_at)?,
    })
  }
}

fn encode_json(value: &serde_json::Value) -> Result<Vec<u8>, StoreError> {
  serde_json::to_vec(value).map_err(|e| StoreError::Corrupt(format!("failed to encode: {}", e)))
}

fn decode_json(data: &[u8]) -> Result<serde_json::Value, StoreError> {
  serde_json::from_slice(data).map_err(|e| StoreError::Corrupt(format!("failed to decode: {}", e)))
}

fn format_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, StoreError> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn mutation(name: &str) -> NewMutation {
    NewMutation {
      target_resource: "/api/profile".into(),
      payload: json!({ "name": name }),
      request: RequestMeta::new("put").with_header("X-Client", "offsync"),
      associated_cache_key: "profile".into(),
    }
  }

  #[test]
  fn test_cache_entry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let backend = SqliteBackend::open(&path).unwrap();
      let entry = CacheEntry::new("profile", json!({"name": "A"}), Some(30)).pending();
      backend.put(&entry).unwrap();
    }

    let backend = SqliteBackend::open(&path).unwrap();
    let entry = backend.get("profile").unwrap().unwrap();
    assert_eq!(entry.value, json!({"name": "A"}));
    assert_eq!(entry.ttl_seconds, Some(30));
    assert!(entry.pending);
  }

  #[test]
  fn test_queue_roundtrip_preserves_order_and_metadata() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend.enqueue(&mutation("A"), Utc::now()).unwrap();
    backend.enqueue(&mutation("B"), Utc::now()).unwrap();

    let queue = backend.list_queue().unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].payload, json!({"name": "A"}));
    assert_eq!(queue[1].payload, json!({"name": "B"}));
    assert_eq!(queue[0].request.method, "PUT");
    assert_eq!(
      queue[0].request.headers.get("X-Client").map(String::as_str),
      Some("offsync")
    );
  }

  #[test]
  fn test_dequeue_removes_only_that_entry() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let first = backend.enqueue(&mutation("A"), Utc::now()).unwrap();
    backend.enqueue(&mutation("B"), Utc::now()).unwrap();

    backend.dequeue(first.id).unwrap();
    let queue = backend.list_queue().unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].payload, json!({"name": "B"}));
  }

  #[test]
  fn test_clear_empties_both_partitions() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    backend
      .put(&CacheEntry::new("k", json!(true), None))
      .unwrap();
    backend.enqueue(&mutation("A"), Utc::now()).unwrap();

    backend.clear().unwrap();
    assert!(backend.keys().unwrap().is_empty());
    assert!(backend.list_queue().unwrap().is_empty());
  }

  #[test]
  fn test_dequeue_of_unknown_id_fails() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    assert!(matches!(
      backend.dequeue(99),
      Err(StoreError::UnknownMutation(99))
    ));
  }

  #[test]
  fn test_restored_mutation_keeps_id_and_key() {
    let source = SqliteBackend::open_in_memory().unwrap();
    source.enqueue(&mutation("A"), Utc::now()).unwrap();
    let original = source.enqueue(&mutation("B"), Utc::now()).unwrap();

    let backend = SqliteBackend::open_in_memory().unwrap();
    backend.restore(&original).unwrap();
    let restored = &backend.list_queue().unwrap()[0];
    assert_eq!(restored.id, original.id);
    assert_eq!(restored.idempotency_key(), original.idempotency_key());

    let next = backend.enqueue(&mutation("C"), Utc::now()).unwrap();
    assert!(next.id > original.id);
  }
}
