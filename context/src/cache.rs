//! Two-tier cache: memory LRU in front of the durable SQLite store.
//!
//! Reads check memory first, then the durable tier (promoting hits back into
//! memory). Writes go through to both tiers. Each cache instance owns one
//! namespace so resolution results and token counts never collide.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::CacheError;
use crate::durable::DurableTier;
use crate::memory::MemoryTier;

/// Where a cache hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Durable,
}

/// Key namespaces sharing the durable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Resolved reference content keyed by signature.
    Resolution,
    /// Token counts keyed by encoding and content hash.
    Tokens,
}

impl Namespace {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Namespace::Resolution => "resolution",
            Namespace::Tokens => "tokens",
        }
    }
}

/// A live entry read from either tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: String,
    pub inserted_at: SystemTime,
    pub ttl: Duration,
    pub tier: Tier,
}

pub struct HierarchicalCache {
    namespace: Namespace,
    memory: Mutex<MemoryTier>,
    durable: Option<Arc<DurableTier>>,
}

impl std::fmt::Debug for HierarchicalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalCache")
            .field("namespace", &self.namespace)
            .field("memory_entries", &self.memory_len())
            .field("durable", &self.durable.is_some())
            .finish()
    }
}

impl HierarchicalCache {
    /// `durable = None` runs memory-only.
    #[must_use]
    pub fn new(
        namespace: Namespace,
        memory_capacity: usize,
        durable: Option<Arc<DurableTier>>,
    ) -> Self {
        Self {
            namespace,
            memory: Mutex::new(MemoryTier::new(memory_capacity)),
            durable,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = SystemTime::now();

        if let Some(hit) = self.memory().get(key, now) {
            tracing::debug!(namespace = self.namespace.as_str(), key, "Memory cache hit");
            return Ok(Some(CacheEntry {
                key: key.to_string(),
                value: hit.value,
                inserted_at: hit.inserted_at,
                ttl: hit.ttl,
                tier: Tier::Memory,
            }));
        }

        let Some(durable) = &self.durable else {
            return Ok(None);
        };
        let Some(row) = durable.get(self.namespace.as_str(), key, now)? else {
            tracing::debug!(namespace = self.namespace.as_str(), key, "Cache miss");
            return Ok(None);
        };

        tracing::debug!(namespace = self.namespace.as_str(), key, "Durable cache hit");
        self.memory()
            .put(key.to_string(), row.value.clone(), row.fetched_at, row.ttl);
        Ok(Some(CacheEntry {
            key: key.to_string(),
            value: row.value,
            inserted_at: row.fetched_at,
            ttl: row.ttl,
            tier: Tier::Durable,
        }))
    }

    /// Write through to both tiers.
    pub fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let now = SystemTime::now();
        if let Some(durable) = &self.durable {
            durable.put(self.namespace.as_str(), key, &value, now, ttl)?;
        }
        self.memory().put(key.to_string(), value, now, ttl);
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key)? {
            Some(entry) => match serde_json::from_str(&entry.value) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // Undecodable entries are dropped and treated as a miss.
                    tracing::warn!(key, error = %e, "Discarding corrupt cache entry");
                    self.invalidate(key)?;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(value)?;
        self.put(key, encoded, ttl)
    }

    /// Purge one key from both tiers. Returns true if either tier held it.
    pub fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        let in_memory = self.memory().remove(key);
        let in_durable = match &self.durable {
            Some(durable) => durable.remove(self.namespace.as_str(), key)?,
            None => false,
        };
        Ok(in_memory || in_durable)
    }

    /// Purge every key in this namespace. Returns the number of durable rows
    /// removed, or memory entries when running memory-only.
    pub fn invalidate_all(&self) -> Result<usize, CacheError> {
        let from_memory = self.memory().clear();
        match &self.durable {
            Some(durable) => Ok(durable.clear(self.namespace.as_str())?.max(from_memory)),
            None => Ok(from_memory),
        }
    }

    #[must_use]
    pub fn memory_len(&self) -> usize {
        self.memory().len()
    }
}
