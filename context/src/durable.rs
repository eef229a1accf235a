//! Tier 2: SQLite-backed store that survives restarts.
//!
//! One table holds every namespace. Expired rows are purged lazily when read.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use crate::CacheError;
use crate::sqlite_util::{open_in_memory_db, open_secure_db};

/// A live row read from the durable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableRow {
    pub value: String,
    pub fetched_at: SystemTime,
    pub ttl: Duration,
}

impl DurableRow {
    /// Time left before this row expires, measured from `now`.
    #[must_use]
    pub fn remaining_ttl(&self, now: SystemTime) -> Duration {
        let age = now.duration_since(self.fetched_at).unwrap_or_default();
        self.ttl.saturating_sub(age)
    }
}

pub struct DurableTier {
    db: Mutex<Connection>,
}

impl std::fmt::Debug for DurableTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableTier").finish_non_exhaustive()
    }
}

impl DurableTier {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS cache_entries (
            namespace TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            fetched_at INTEGER NOT NULL,
            ttl_secs INTEGER NOT NULL,
            PRIMARY KEY (namespace, key)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
        ON cache_entries(fetched_at, ttl_secs);
    ";

    /// Open or create the durable cache at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = open_secure_db(path.as_ref())?;
        Self::initialize(db)
    }

    /// Open an in-memory durable tier (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(open_in_memory_db()?)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create cache schema")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, namespace: &str, key: &str, now: SystemTime) -> Result<Option<DurableRow>, CacheError> {
        let db = self.conn();
        let row: Option<(String, i64, i64)> = db
            .query_row(
                "SELECT value, fetched_at, ttl_secs FROM cache_entries
                 WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((value, fetched_at, ttl_secs)) = row else {
            return Ok(None);
        };

        let now_secs = epoch_secs(now);
        if now_secs >= fetched_at.saturating_add(ttl_secs) {
            tracing::debug!(namespace, key, "Purging expired durable cache entry");
            db.execute(
                "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )?;
            return Ok(None);
        }

        Ok(Some(DurableRow {
            value,
            fetched_at: UNIX_EPOCH + Duration::from_secs(fetched_at.max(0) as u64),
            ttl: Duration::from_secs(ttl_secs.max(0) as u64),
        }))
    }

    pub fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        fetched_at: SystemTime,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        self.conn().execute(
            "INSERT INTO cache_entries (namespace, key, value, fetched_at, ttl_secs)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                fetched_at = excluded.fetched_at,
                ttl_secs = excluded.ttl_secs",
            params![namespace, key, value, epoch_secs(fetched_at), ttl_secs],
        )?;
        Ok(())
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool, CacheError> {
        let removed = self.conn().execute(
            "DELETE FROM cache_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(removed > 0)
    }

    pub fn clear(&self, namespace: &str) -> Result<usize, CacheError> {
        let removed = self
            .conn()
            .execute("DELETE FROM cache_entries WHERE namespace = ?1", params![namespace])?;
        Ok(removed)
    }

    /// Drop every expired row across all namespaces.
    pub fn purge_expired(&self, now: SystemTime) -> Result<usize, CacheError> {
        let removed = self.conn().execute(
            "DELETE FROM cache_entries WHERE fetched_at + ttl_secs <= ?1",
            params![epoch_secs(now)],
        )?;
        Ok(removed)
    }

    pub fn len(&self, namespace: &str) -> Result<usize, CacheError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM cache_entries WHERE namespace = ?1",
            params![namespace],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

fn epoch_secs(time: SystemTime) -> i64 {
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
