//! Bounded in-memory cache with per-entry TTL and insertion-order eviction.
//!
//! Expiry is checked lazily at read time against a monotonic clock
//! (`tokio::time::Instant`), so wall-clock jumps never resurrect or kill entries.
//! Expired entries stay in the table until they are evicted, overwritten,
//! purged or cleared; `get` simply never returns them.

use std::{
    borrow::Borrow,
    collections::{BTreeMap, HashMap},
    hash::Hash,
    time::Duration,
};

use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

#[derive(Debug)]
struct Slot<V> {
    seq: u64,
    entry: CacheEntry<V>,
}

/// FIFO-bounded TTL cache.
///
/// Invariant: `len() <= capacity()`. When an insert pushes the size over capacity the
/// oldest *inserted* key is dropped, regardless of how recently it was read.
/// Overwriting a key counts as a fresh insertion.
#[derive(Debug)]
pub struct BoundedTtlCache<K, V> {
    capacity: usize,
    next_seq: u64,
    entries: HashMap<K, Slot<V>>,
    order: BTreeMap<u64, K>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K, V> BoundedTtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_at(key, Instant::now())
    }

    pub fn get_at<Q>(&mut self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get(key) {
            Some(slot) if !slot.entry.is_expired_at(now) => {
                self.hits += 1;
                Some(slot.entry.value.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    /// Like `get_at` but without touching hit/miss counters.
    pub fn contains_fresh_at<Q>(&self, key: &Q, now: Instant) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired_at(now))
    }

    pub fn put(&mut self, key: K, value: V, ttl: Duration) {
        self.put_at(key, value, ttl, Instant::now());
    }

    pub fn put_at(&mut self, key: K, value: V, ttl: Duration, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let slot = Slot {
            seq,
            entry: CacheEntry {
                value,
                inserted_at: now,
                ttl,
            },
        };

        if let Some(old) = self.entries.insert(key.clone(), slot) {
            self.order.remove(&old.seq);
        }
        self.order.insert(seq, key);
        self.evict_over_capacity();
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.entry.value)
    }

    /// Drop every expired entry. Never required for correctness.
    pub fn purge_expired_at(&mut self, now: Instant) -> usize {
        let expired: Vec<(u64, K)> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired_at(now))
            .map(|(k, slot)| (slot.seq, k.clone()))
            .collect();

        for (seq, key) in &expired {
            self.entries.remove(key);
            self.order.remove(seq);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Change the bound, evicting oldest-inserted entries if the cache is now too large.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict_over_capacity();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            len: self.entries.len(),
            capacity: self.capacity,
        }
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            self.evictions += 1;
        }
    }
}
