//! Entry store: bounded, recency-ordered mapping from fingerprint to cached payload.
//!
//! The store is the single owner of every [`CacheEntry`]. All reads and writes go
//! through one short critical section; nothing inside it awaits or performs I/O.
//!
//! Eviction is strict least-recently-used: a lookup hit moves the entry to the front,
//! and an insert that would exceed capacity pops entries from the back until the new
//! entry fits. Expiry is lazy: an expired entry is dropped by the lookup that finds it,
//! or by [`EntryStore::purge_expired`] when a sweeper is running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Capacity;
use crate::key::{Fingerprint, FingerprintKey};
use crate::metrics::CacheMetrics;

/// Errors produced by [`EntryStore::insert`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("entry of size {size} exceeds cache capacity {capacity}")]
    EntryTooLarge { size: u64, capacity: u64 },
}

/// Result of a store lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(Bytes),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// What happened to an insert that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// Stored; `evicted` entries made room for it.
    Stored { evicted: usize },
    /// Dropped because an invalidation happened after the value was fetched.
    Superseded,
    /// Dropped because its effective ttl is zero.
    Expired,
}

/// A cached payload and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: FingerprintKey,
    payload: Bytes,
    stored_at: Instant,
    ttl: Duration,
    size: u64,
    last_access: Instant,
    hit_count: u64,
}

impl CacheEntry {
    pub fn key(&self) -> &FingerprintKey {
        &self.key
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn stored_at(&self) -> Instant {
        self.stored_at
    }

    /// Effective ttl, already clamped to the store's max ttl.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Size in the store's capacity units.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) >= self.ttl
    }
}

struct StoreInner {
    lru: LruCache<Fingerprint, CacheEntry>,
    used: u64,
    payload_bytes: u64,
    // Bumped by every invalidation.
    epoch: u64,
    // Endpoint prefix -> epoch of its latest invalidation. `""` covers everything.
    invalidated: HashMap<String, u64>,
}

impl StoreInner {
    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.lru.pop(fingerprint)?;
        self.release(&entry);
        Some(entry)
    }

    fn release(&mut self, entry: &CacheEntry) {
        self.used = self.used.saturating_sub(entry.size);
        self.payload_bytes = self.payload_bytes.saturating_sub(entry.payload.len() as u64);
    }

    fn mark_invalidated(&mut self, prefix: &str) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.invalidated.insert(prefix.to_owned(), epoch);
    }

    // True if anything covering `key` was invalidated after `epoch`.
    fn invalidated_since(&self, key: &FingerprintKey, epoch: u64) -> bool {
        self.invalidated
            .iter()
            .any(|(prefix, at)| *at > epoch && key.matches_prefix(prefix))
    }
}

/// Bounded LRU store of query results.
pub struct EntryStore {
    inner: Mutex<StoreInner>,
    capacity: Capacity,
    max_ttl: Duration,
    metrics: Arc<CacheMetrics>,
}

impl EntryStore {
    /// Creates an empty store. Every ttl passed to [`insert`](Self::insert) is clamped
    /// to `max_ttl`.
    pub fn new(capacity: Capacity, max_ttl: Duration, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                lru: LruCache::unbounded(),
                used: 0,
                payload_bytes: 0,
                epoch: 0,
                invalidated: HashMap::new(),
            }),
            capacity,
            max_ttl,
            metrics,
        }
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Size an entry for `key` and `payload` would occupy, in capacity units.
    ///
    /// In byte mode this is the payload plus the canonical key text kept alongside it.
    pub fn size_of(&self, key: &FingerprintKey, payload: &Bytes) -> u64 {
        match self.capacity {
            Capacity::Entries(_) => 1,
            Capacity::Bytes(_) => (payload.len() + key.canonical().len()) as u64,
        }
    }

    /// Returns the cached payload for `key` if present and unexpired, marking it as
    /// most recently used.
    pub fn lookup(&self, key: &FingerprintKey) -> Lookup {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match inner.lru.get_mut(&key.fingerprint()) {
            None => return Lookup::Miss,
            Some(entry) if !entry.is_expired(now) => {
                if cfg!(debug_assertions) && entry.key.canonical() != key.canonical() {
                    warn!(
                        key = %key,
                        stored = entry.key.canonical(),
                        requested = key.canonical(),
                        "fingerprint collision, treating as miss"
                    );
                    return Lookup::Miss;
                }
                entry.last_access = now;
                entry.hit_count += 1;
                return Lookup::Hit(entry.payload.clone());
            }
            Some(_) => {}
        }

        inner.remove(&key.fingerprint());
        drop(inner);
        self.metrics.record_expirations(1);
        debug!(key = %key, "cache entry expired");
        Lookup::Miss
    }

    /// Returns a copy of the entry without touching its recency or hit count.
    pub fn peek(&self, key: &FingerprintKey) -> Option<CacheEntry> {
        self.inner.lock().lru.peek(&key.fingerprint()).cloned()
    }

    /// Stores `payload` under `key` for `min(ttl, max_ttl)`, evicting least recently
    /// used entries as needed. Replaces any existing entry for the same key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EntryTooLarge`] when the entry alone exceeds capacity.
    /// The store is left unchanged in that case.
    pub fn insert(
        &self,
        key: FingerprintKey,
        payload: Bytes,
        ttl: Duration,
    ) -> Result<Inserted, StoreError> {
        self.insert_inner(key, payload, ttl, None)
    }

    /// Like [`insert`](Self::insert), but drops the value if `key`'s endpoint was
    /// invalidated since `epoch` was read with [`epoch`](Self::epoch).
    pub fn insert_at_epoch(
        &self,
        key: FingerprintKey,
        payload: Bytes,
        ttl: Duration,
        epoch: u64,
    ) -> Result<Inserted, StoreError> {
        self.insert_inner(key, payload, ttl, Some(epoch))
    }

    fn insert_inner(
        &self,
        key: FingerprintKey,
        payload: Bytes,
        ttl: Duration,
        epoch: Option<u64>,
    ) -> Result<Inserted, StoreError> {
        let size = self.size_of(&key, &payload);
        let limit = self.capacity.limit();
        if size > limit {
            return Err(StoreError::EntryTooLarge {
                size,
                capacity: limit,
            });
        }

        let ttl = ttl.min(self.max_ttl);
        if ttl.is_zero() {
            return Ok(Inserted::Expired);
        }

        let now = Instant::now();
        let fingerprint = key.fingerprint();
        let payload_len = payload.len() as u64;
        let mut inner = self.inner.lock();

        if epoch.is_some_and(|e| inner.invalidated_since(&key, e)) {
            return Ok(Inserted::Superseded);
        }

        inner.remove(&fingerprint);

        let mut evicted = 0usize;
        let mut expired = 0u64;
        while inner.used + size > limit {
            let Some((_, old)) = inner.lru.pop_lru() else {
                break;
            };
            inner.release(&old);
            if old.is_expired(now) {
                expired += 1;
            } else {
                evicted += 1;
            }
        }

        inner.lru.push(
            fingerprint,
            CacheEntry {
                key,
                payload,
                stored_at: now,
                ttl,
                size,
                last_access: now,
                hit_count: 0,
            },
        );
        inner.used += size;
        inner.payload_bytes += payload_len;
        drop(inner);

        if evicted > 0 {
            self.metrics.record_evictions(evicted as u64);
        }
        if expired > 0 {
            self.metrics.record_expirations(expired);
        }
        Ok(Inserted::Stored {
            evicted: evicted + expired as usize,
        })
    }

    /// Removes the entry for `key`. Returns `true` if one was present.
    ///
    /// Results still being fetched for the same endpoint are not stored.
    pub fn invalidate(&self, key: &FingerprintKey) -> bool {
        let mut inner = self.inner.lock();
        inner.mark_invalidated(key.endpoint());
        inner.remove(&key.fingerprint()).is_some()
    }

    /// Removes every entry whose endpoint starts with `prefix`. Returns how many.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.mark_invalidated(prefix);
        let doomed: Vec<Fingerprint> = inner
            .lru
            .iter()
            .filter(|(_, entry)| entry.key.matches_prefix(prefix))
            .map(|(fingerprint, _)| *fingerprint)
            .collect();
        for fingerprint in &doomed {
            inner.remove(fingerprint);
        }
        doomed.len()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        // Every prefix is covered by "" from here on.
        inner.invalidated.clear();
        inner.mark_invalidated("");
        inner.lru.clear();
        inner.used = 0;
        inner.payload_bytes = 0;
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<Fingerprint> = inner
            .lru
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(fingerprint, _)| *fingerprint)
            .collect();
        for fingerprint in &expired {
            inner.remove(fingerprint);
        }
        drop(inner);

        if !expired.is_empty() {
            self.metrics.record_expirations(expired.len() as u64);
        }
        expired.len()
    }

    /// Current invalidation epoch.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of entry sizes, in capacity units.
    pub fn used(&self) -> u64 {
        self.inner.lock().used
    }

    /// Sum of payload bytes regardless of capacity mode.
    pub fn estimated_bytes(&self) -> u64 {
        self.inner.lock().payload_bytes
    }
}
