use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, warn};

use lattice_core::error::{LatticeError, Result};

/// Durable, externally-writable key-value state per run.
///
/// Gates are resolved out of band through this store: an external actor writes
/// `{topic_locked: true, selected_topic}` and the gate observes it on its next
/// poll. Entries expire after a fixed TTL (refreshed on every set).
///
/// Backed by SQLite; if the database cannot be opened at startup the store
/// transparently falls back to an in-process map with the same TTL semantics.
/// Callers cannot tell which backing is active.
pub struct SessionStore {
    backing: Backing,
    ttl: Duration,
}

enum Backing {
    Durable(Mutex<Connection>),
    Memory(Mutex<HashMap<String, (Value, DateTime<Utc>)>>),
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session_state (
    job_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    expires_at TEXT NOT NULL
);";

impl SessionStore {
    /// Open the durable store, falling back to in-memory on failure.
    pub fn open(path: &Path, ttl_secs: u64) -> Self {
        let ttl = Duration::seconds(ttl_secs as i64);

        match Self::open_durable(path) {
            Ok(conn) => {
                debug!(path = %path.display(), "Session store opened (durable)");
                Self {
                    backing: Backing::Durable(Mutex::new(conn)),
                    ttl,
                }
            }
            Err(e) => {
                warn!(error = %e, "Session store unavailable, using in-memory fallback");
                Self {
                    backing: Backing::Memory(Mutex::new(HashMap::new())),
                    ttl,
                }
            }
        }
    }

    /// In-memory store (for testing, or when no path is configured).
    pub fn in_memory(ttl_secs: u64) -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    fn open_durable(path: &Path) -> Result<Connection> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LatticeError::Store(format!("Failed to create store directory: {}", e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| LatticeError::Store(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LatticeError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| LatticeError::Store(e.to_string()))?;
        Ok(conn)
    }

    /// Get the current state for a job. Missing or expired entries read as an
    /// empty object.
    pub fn get(&self, job_id: &str) -> Value {
        match &self.backing {
            Backing::Durable(conn) => {
                let conn = match conn.lock() {
                    Ok(c) => c,
                    Err(_) => return Value::Object(Default::default()),
                };
                let row: Option<(String, String)> = conn
                    .query_row(
                        "SELECT state, expires_at FROM session_state WHERE job_id = ?1",
                        params![job_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .unwrap_or(None);

                match row {
                    Some((state_str, expires_str)) => {
                        let expired = DateTime::parse_from_rfc3339(&expires_str)
                            .map(|dt| dt.with_timezone(&Utc) < Utc::now())
                            .unwrap_or(true);
                        if expired {
                            let _ = conn.execute(
                                "DELETE FROM session_state WHERE job_id = ?1",
                                params![job_id],
                            );
                            return Value::Object(Default::default());
                        }
                        serde_json::from_str(&state_str)
                            .unwrap_or_else(|_| Value::Object(Default::default()))
                    }
                    None => Value::Object(Default::default()),
                }
            }
            Backing::Memory(map) => {
                let mut map = match map.lock() {
                    Ok(m) => m,
                    Err(_) => return Value::Object(Default::default()),
                };
                match map.get(job_id) {
                    Some((_, expires)) if *expires < Utc::now() => {
                        map.remove(job_id);
                        Value::Object(Default::default())
                    }
                    Some((state, _)) => state.clone(),
                    None => Value::Object(Default::default()),
                }
            }
        }
    }

    /// Set the full state for a job, refreshing its TTL.
    pub fn set(&self, job_id: &str, state: &Value) -> Result<()> {
        let expires = Utc::now() + self.ttl;

        match &self.backing {
            Backing::Durable(conn) => {
                let conn = conn.lock().map_err(|e| LatticeError::Store(e.to_string()))?;
                let state_str = serde_json::to_string(state)?;
                conn.execute(
                    "INSERT INTO session_state (job_id, state, expires_at)
                     VALUES (?1, ?2, ?3)
                     ON CONFLICT(job_id) DO UPDATE SET state = ?2, expires_at = ?3",
                    params![job_id, state_str, expires.to_rfc3339()],
                )
                .map_err(|e| LatticeError::Store(e.to_string()))?;
            }
            Backing::Memory(map) => {
                let mut map = map.lock().map_err(|e| LatticeError::Store(e.to_string()))?;
                map.insert(job_id.to_string(), (state.clone(), expires));
            }
        }
        Ok(())
    }

    /// Merge a partial object into the existing state, returning the result.
    pub fn merge_update(&self, job_id: &str, partial: &Value) -> Result<Value> {
        let mut current = self.get(job_id);

        if let (Some(current_obj), Some(partial_obj)) = (current.as_object_mut(), partial.as_object())
        {
            for (key, value) in partial_obj {
                current_obj.insert(key.clone(), value.clone());
            }
        }

        self.set(job_id, &current)?;
        Ok(current)
    }

    /// Delete the state for a job.
    pub fn delete(&self, job_id: &str) -> Result<()> {
        match &self.backing {
            Backing::Durable(conn) => {
                let conn = conn.lock().map_err(|e| LatticeError::Store(e.to_string()))?;
                conn.execute(
                    "DELETE FROM session_state WHERE job_id = ?1",
                    params![job_id],
                )
                .map_err(|e| LatticeError::Store(e.to_string()))?;
            }
            Backing::Memory(map) => {
                let mut map = map.lock().map_err(|e| LatticeError::Store(e.to_string()))?;
                map.remove(job_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_missing_returns_empty_object() {
        let store = SessionStore::in_memory(60);
        assert_eq!(store.get("42"), json!({}));
    }

    #[test]
    fn set_then_get_roundtrip() {
        let store = SessionStore::in_memory(60);
        store
            .set("42", &json!({"topic_locked": false, "topic_suggestions": []}))
            .unwrap();
        assert_eq!(store.get("42")["topic_locked"], false);
    }

    #[test]
    fn merge_update_overlays_keys() {
        let store = SessionStore::in_memory(60);
        store
            .set("42", &json!({"topic_locked": false, "task": "qec"}))
            .unwrap();

        let merged = store
            .merge_update(
                "42",
                &json!({"topic_locked": true, "selected_topic": "Surface Codes at Scale"}),
            )
            .unwrap();

        assert_eq!(merged["topic_locked"], true);
        assert_eq!(merged["selected_topic"], "Surface Codes at Scale");
        // Untouched keys survive the merge.
        assert_eq!(merged["task"], "qec");
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let store = SessionStore::in_memory(0);
        store.set("42", &json!({"topic_locked": true})).unwrap();
        // TTL of zero: the entry is already expired.
        assert_eq!(store.get("42"), json!({}));
    }

    #[test]
    fn delete_removes_entry() {
        let store = SessionStore::in_memory(60);
        store.set("42", &json!({"x": 1})).unwrap();
        store.delete("42").unwrap();
        assert_eq!(store.get("42"), json!({}));
    }

    #[test]
    fn durable_backing_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let store = SessionStore::open(&path, 60);
        store.set("42", &json!({"topic_locked": true})).unwrap();
        drop(store);

        // Survives reopen.
        let store = SessionStore::open(&path, 60);
        assert_eq!(store.get("42")["topic_locked"], true);
    }

    #[test]
    fn unopenable_path_falls_back_to_memory() {
        // A directory path cannot be opened as a database file.
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path(), 60);

        // The store still works; callers cannot tell the backing changed.
        store.set("42", &json!({"ok": true})).unwrap();
        assert_eq!(store.get("42")["ok"], true);
    }
}
