//! Tier 1: bounded in-memory LRU with per-entry TTL.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    inserted_at: SystemTime,
    ttl: Duration,
    /// Monotonic access tick; the smallest tick is evicted first.
    last_access: u64,
}

impl Slot {
    fn is_expired(&self, now: SystemTime) -> bool {
        now.duration_since(self.inserted_at)
            .is_ok_and(|age| age >= self.ttl)
    }
}

/// A hit from the memory tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemoryHit {
    pub value: String,
    pub inserted_at: SystemTime,
    pub ttl: Duration,
}

/// Size-bounded LRU map. Not synchronized; the owning cache wraps it in a mutex.
#[derive(Debug)]
pub(crate) struct MemoryTier {
    capacity: usize,
    slots: HashMap<String, Slot>,
    tick: u64,
}

impl MemoryTier {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a live entry, dropping it if its TTL has elapsed.
    pub(crate) fn get(&mut self, key: &str, now: SystemTime) -> Option<MemoryHit> {
        let expired = self.slots.get(key)?.is_expired(now);
        if expired {
            self.slots.remove(key);
            return None;
        }

        let tick = self.next_tick();
        let slot = self.slots.get_mut(key)?;
        slot.last_access = tick;
        Some(MemoryHit {
            value: slot.value.clone(),
            inserted_at: slot.inserted_at,
            ttl: slot.ttl,
        })
    }

    pub(crate) fn put(&mut self, key: String, value: String, inserted_at: SystemTime, ttl: Duration) {
        if !self.slots.contains_key(&key) && self.slots.len() >= self.capacity {
            self.evict_one(inserted_at);
        }
        let last_access = self.next_tick();
        self.slots.insert(
            key,
            Slot {
                value,
                inserted_at,
                ttl,
                last_access,
            },
        );
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.slots.len();
        self.slots.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Prefer dropping an expired entry; otherwise drop the least recently used.
    fn evict_one(&mut self, now: SystemTime) {
        let victim = self
            .slots
            .iter()
            .find(|(_, slot)| slot.is_expired(now))
            .or_else(|| self.slots.iter().min_by_key(|(_, slot)| slot.last_access))
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            tracing::debug!(key = %key, "Evicting memory cache entry");
            self.slots.remove(&key);
        }
    }
}
