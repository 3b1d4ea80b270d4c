//! AMP persistence: SQLite-backed `StateStore`.
//!
//! Compare-and-set is one conditional `UPDATE`, so it stays atomic across
//! connections and processes sharing the same database file.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use amp_core::{StateRecord, StateStore, StoreError, StoreResult};
use anyhow::{Context, Result};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

/// Durable store. Synchronous under the hood; calls are short and never hold
/// the connection across an await point.
pub struct SqliteStateStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStateStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("AMP_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.busy_timeout(std::time::Duration::from_secs(5)).ok();
        let me = Self::init(db)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::init(db)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS states (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                revision   INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )
        .context("creating states table")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))
    }

    /// Number of successful writes to `key` since it was created (1 after create).
    pub fn revision(&self, key: &str) -> StoreResult<Option<u64>> {
        let db = self.conn()?;
        db.query_row("SELECT revision FROM states WHERE key = ?1", [key], |r| r.get::<_, i64>(0))
            .optional()
            .map(|rev| rev.map(|r| r as u64))
            .map_err(backend)
    }

    /// All records whose key starts with `prefix`, sorted by key, with the
    /// prefix stripped from the returned ids.
    pub fn records(&self, prefix: &str) -> StoreResult<Vec<StateRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT key, value FROM states ORDER BY key").map_err(backend)?;
        let mut rows = stmt.query([]).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let key: String = row.get(0).map_err(backend)?;
            if let Some(id) = key.strip_prefix(prefix) {
                out.push(StateRecord { id: id.to_string(), value: row.get(1).map_err(backend)? });
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let started = Instant::now();
        let db = self.conn()?;
        let v = db
            .query_row("SELECT value FROM states WHERE key = ?1", [key], |r| r.get::<_, String>(0))
            .optional()
            .map_err(backend)?;
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(v)
    }

    async fn create(&self, key: &str, value: &str) -> StoreResult<()> {
        let db = self.conn()?;
        let n = db
            .execute(
                "INSERT INTO states(key, value, revision, updated_at) VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(key) DO NOTHING",
                (key, value, now_ts()),
            )
            .map_err(backend)?;
        if n == 0 {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    async fn compare_and_set(&self, key: &str, expected: &str, new: &str) -> StoreResult<()> {
        let started = Instant::now();
        let db = self.conn()?;
        let n = db
            .execute(
                "UPDATE states SET value = ?3, revision = revision + 1, updated_at = ?4
                 WHERE key = ?1 AND value = ?2",
                (key, expected, new, now_ts()),
            )
            .map_err(backend)?;
        histogram!("persist_cas_ms", started.elapsed().as_secs_f64() * 1000.0);
        if n == 1 {
            counter!("persist_put_total", 1u64);
            return Ok(());
        }
        // Nothing matched: classify for the caller.
        let actual = db
            .query_row("SELECT value FROM states WHERE key = ?1", [key], |r| r.get::<_, String>(0))
            .optional()
            .map_err(backend)?;
        debug!(key = %key, expected = %expected, actual = ?actual, "persist: compare-and-set missed");
        match actual {
            None => Err(StoreError::NotFound(key.to_string())),
            Some(actual) => Err(StoreError::Conflict { key: key.to_string(), expected: expected.to_string(), actual }),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM states WHERE key = ?1", [key]).map_err(backend)?;
        if n == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

fn backend(e: rusqlite::Error) -> StoreError { StoreError::Backend(e.to_string()) }

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".amp");
        let _ = std::fs::create_dir_all(&p);
        p.push("amp.db");
        return p.to_string_lossy().to_string();
    }
    "amp.db".to_string()
}

fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_bumps_revision_and_classifies_misses() {
        let s = SqliteStateStore::open_in_memory().unwrap();
        s.create("states/a", "Stopped").await.unwrap();
        assert_eq!(s.revision("states/a").unwrap(), Some(1));
        s.compare_and_set("states/a", "Stopped", "Starting").await.unwrap();
        assert_eq!(s.revision("states/a").unwrap(), Some(2));

        let err = s.compare_and_set("states/a", "Stopped", "Running").await.unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict { key: "states/a".into(), expected: "Stopped".into(), actual: "Starting".into() }
        );
        assert_eq!(s.revision("states/a").unwrap(), Some(2));
        assert_eq!(s.compare_and_set("states/b", "x", "y").await.unwrap_err(), StoreError::NotFound("states/b".into()));
    }

    #[tokio::test]
    async fn create_is_exclusive_and_delete_reports_absence() {
        let s = SqliteStateStore::open_in_memory().unwrap();
        s.create("k", "v").await.unwrap();
        assert_eq!(s.create("k", "w").await.unwrap_err(), StoreError::AlreadyExists("k".into()));
        assert_eq!(s.get("k").await.unwrap().as_deref(), Some("v"));
        s.delete("k").await.unwrap();
        assert_eq!(s.get("k").await.unwrap(), None);
        assert_eq!(s.delete("k").await.unwrap_err(), StoreError::NotFound("k".into()));
    }

    #[tokio::test]
    async fn records_filter_by_prefix() {
        let s = SqliteStateStore::open_in_memory().unwrap();
        s.create("states/web", "Running").await.unwrap();
        s.create("states/db", "Stopped").await.unwrap();
        s.create("other/x", "Running").await.unwrap();
        let recs = s.records("states/").unwrap();
        assert_eq!(
            recs,
            vec![
                StateRecord { id: "db".into(), value: "Stopped".into() },
                StateRecord { id: "web".into(), value: "Running".into() },
            ]
        );
    }
}
