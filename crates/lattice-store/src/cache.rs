use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use lattice_core::error::{LatticeError, Result};

/// One cached inference result, keyed by the hash of its own input.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub response: serde_json::Value,
    pub raw: String,
    pub step: String,
    pub execution_time_ms: u64,
    pub input_hash: String,
    pub output_hash: String,
}

/// Content-addressed response cache.
///
/// Entries are written once (`INSERT OR IGNORE`) and never mutated, which
/// guarantees at most one inference per distinct (step, model, input) triple
/// over the cache lifetime. Invalidation is manual only.
pub struct ResponseCache {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS cache_entries (
    input_hash TEXT PRIMARY KEY,
    response TEXT NOT NULL,
    raw TEXT NOT NULL,
    step TEXT NOT NULL,
    execution_time_ms INTEGER NOT NULL,
    output_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);";

impl ResponseCache {
    /// Open or create a cache database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LatticeError::Store(format!("Failed to create cache directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| LatticeError::Store(e.to_string()))?;

        // WAL for concurrent readers during pipeline fan-out
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        debug!(path = %path.display(), "Response cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory cache (for testing, or when persistence is disabled).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| LatticeError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| LatticeError::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Look up a prior result by input hash.
    pub fn get(&self, input_hash: &str) -> Result<Option<CacheEntry>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        let row = conn
            .query_row(
                "SELECT response, raw, step, execution_time_ms, output_hash
                 FROM cache_entries WHERE input_hash = ?1",
                params![input_hash],
                |row| {
                    let response_str: String = row.get(0)?;
                    let raw: String = row.get(1)?;
                    let step: String = row.get(2)?;
                    let execution_time_ms: i64 = row.get(3)?;
                    let output_hash: String = row.get(4)?;
                    Ok((response_str, raw, step, execution_time_ms, output_hash))
                },
            )
            .optional()
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        match row {
            Some((response_str, raw, step, execution_time_ms, output_hash)) => {
                let response = serde_json::from_str(&response_str)?;
                Ok(Some(CacheEntry {
                    response,
                    raw,
                    step,
                    execution_time_ms: execution_time_ms as u64,
                    input_hash: input_hash.to_string(),
                    output_hash,
                }))
            }
            None => Ok(None),
        }
    }

    /// Persist a result under its input hash. A concurrent writer that got
    /// there first wins; the entry is never overwritten.
    pub fn put(&self, entry: &CacheEntry) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        let response_str = serde_json::to_string(&entry.response)?;
        conn.execute(
            "INSERT OR IGNORE INTO cache_entries
             (input_hash, response, raw, step, execution_time_ms, output_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.input_hash,
                response_str,
                entry.raw,
                entry.step,
                entry.execution_time_ms as i64,
                entry.output_hash,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| LatticeError::Store(e.to_string()))?;

        Ok(())
    }

    /// Manually invalidate one entry.
    pub fn invalidate(&self, input_hash: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        let removed = conn
            .execute(
                "DELETE FROM cache_entries WHERE input_hash = ?1",
                params![input_hash],
            )
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        Ok(removed > 0)
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(|e| LatticeError::Store(e.to_string()))?;

        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(hash: &str, response: serde_json::Value) -> CacheEntry {
        CacheEntry {
            response,
            raw: "raw text".into(),
            step: "slr".into(),
            execution_time_ms: 1200,
            input_hash: hash.into(),
            output_hash: "out".into(),
        }
    }

    #[test]
    fn miss_then_hit_returns_identical_payload() {
        let cache = ResponseCache::in_memory().unwrap();
        assert!(cache.get("abc").unwrap().is_none());

        let stored = entry("abc", json!({"summary": "findings", "score": 9.5}));
        cache.put(&stored).unwrap();

        let hit = cache.get("abc").unwrap().unwrap();
        assert_eq!(hit, stored);
    }

    #[test]
    fn entries_are_never_overwritten() {
        let cache = ResponseCache::in_memory().unwrap();
        cache.put(&entry("abc", json!({"v": 1}))).unwrap();
        cache.put(&entry("abc", json!({"v": 2}))).unwrap();

        // First write wins.
        let hit = cache.get("abc").unwrap().unwrap();
        assert_eq!(hit.response, json!({"v": 1}));
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn manual_invalidation() {
        let cache = ResponseCache::in_memory().unwrap();
        cache.put(&entry("abc", json!({}))).unwrap();
        assert!(cache.invalidate("abc").unwrap());
        assert!(!cache.invalidate("abc").unwrap());
        assert!(cache.get("abc").unwrap().is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");

        {
            let cache = ResponseCache::open(&path).unwrap();
            cache.put(&entry("abc", json!({"kept": true}))).unwrap();
        }

        let cache = ResponseCache::open(&path).unwrap();
        assert!(cache.get("abc").unwrap().is_some());
    }
}
