//! Bounded TTL cache shared by request dedup and per-file metadata caching.
//!
//! Entries expire after their TTL and are dropped lazily on the next lookup
//! (or by [`ShardedTtlCache::purge_expired`]). The cache holds at most
//! `max_entries` live entries in total; inserting past that bound first
//! drops expired entries and then evicts the least-recently-used entry,
//! whichever shard it lives in. Client-supplied keys therefore cannot grow
//! it without bound, and skewed hashing never evicts below capacity.
//!
//! Keys hash to one of several independently locked shards; lookups for
//! different keys rarely contend. Eviction locks one shard at a time.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache disabled (capacity 0)")]
    Disabled,

    #[error("refusing to store entry with zero TTL")]
    ZeroTtl,
}

/// Generic keyed store with per-entry expiry.
pub trait Cache<K, V>: Send + Sync {
    /// Live value for `key`; expired entries behave as misses.
    fn get(&self, key: &K) -> Option<V>;

    fn insert(&self, key: K, value: V, ttl: Duration) -> Result<(), CacheError>;

    fn remove(&self, key: &K) -> Option<V>;

    /// Entries currently held, including expired ones not yet purged.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_access: u64,
}

type Shard<K, V> = Mutex<HashMap<K, CacheEntry<V>>>;

/// Sharded TTL + LRU cache with a global entry bound.
#[derive(Debug)]
pub struct ShardedTtlCache<K, V> {
    shards: Vec<Shard<K, V>>,
    max_entries: usize,
    entries: AtomicUsize,
    hasher: RandomState,
    clock: AtomicU64,
}

impl<K, V> ShardedTtlCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Cache holding at most `max_entries` entries across default shards.
    pub fn new(max_entries: usize) -> Self {
        Self::with_shards(max_entries, DEFAULT_SHARDS.min(max_entries).max(1))
    }

    /// Cache with an explicit shard count.
    pub fn with_shards(max_entries: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            max_entries,
            entries: AtomicUsize::new(0),
            hasher: RandomState::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Maximum entries across all shards.
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut map = lock(shard);
                let before = map.len();
                map.retain(|_, entry| entry.expires_at > now);
                let removed = before - map.len();
                self.entries.fetch_sub(removed, Ordering::Relaxed);
                removed
            })
            .sum()
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut map = lock(shard);
            self.entries.fetch_sub(map.len(), Ordering::Relaxed);
            map.clear();
        }
    }

    fn shard(&self, key: &K) -> &Shard<K, V> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        &self.shards[idx]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove the least-recently-used entry across all shards.
    ///
    /// Returns false when no candidate was found (another caller got there
    /// first, or the cache is empty).
    fn evict_lru(&self) -> bool {
        let oldest = self
            .shards
            .iter()
            .enumerate()
            .filter_map(|(idx, shard)| {
                lock(shard)
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_access)
                    .map(|(key, entry)| (entry.last_access, idx, key.clone()))
            })
            .min_by_key(|(access, _, _)| *access);

        let Some((access, idx, key)) = oldest else {
            return false;
        };
        let mut map = lock(&self.shards[idx]);
        // Touched or replaced since the scan: leave it and let the caller rescan.
        if map.get(&key).map(|entry| entry.last_access) != Some(access) {
            return true;
        }
        map.remove(&key);
        self.entries.fetch_sub(1, Ordering::Relaxed);
        debug!("Evicted least-recently-used cache entry");
        true
    }
}

impl<K, V> Cache<K, V> for ShardedTtlCache<K, V>
where
    K: Hash + Eq + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let mut map = lock(self.shard(key));
        let now = Instant::now();
        match map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_access = self.tick();
                Some(entry.value.clone())
            }
            Some(_) => {
                map.remove(key);
                self.entries.fetch_sub(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    fn insert(&self, key: K, value: V, ttl: Duration) -> Result<(), CacheError> {
        if self.max_entries == 0 {
            return Err(CacheError::Disabled);
        }
        if ttl.is_zero() {
            return Err(CacheError::ZeroTtl);
        }

        let now = Instant::now();
        let entry = CacheEntry {
            value,
            expires_at: now + ttl,
            last_access: self.tick(),
        };
        if lock(self.shard(&key)).insert(key, entry).is_some() {
            return Ok(());
        }

        if self.entries.fetch_add(1, Ordering::Relaxed) + 1 > self.max_entries {
            self.purge_expired();
            while self.entries.load(Ordering::Relaxed) > self.max_entries {
                if !self.evict_lru() {
                    break;
                }
            }
        }
        Ok(())
    }

    fn remove(&self, key: &K) -> Option<V> {
        let removed = lock(self.shard(key)).remove(key)?;
        self.entries.fetch_sub(1, Ordering::Relaxed);
        Some(removed.value)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hit_before_expiry_miss_after() {
        let cache: ShardedTtlCache<String, u32> = ShardedTtlCache::new(8);
        cache
            .insert("fp".into(), 7, Duration::from_secs(10))
            .unwrap();
        assert_eq!(cache.get(&"fp".to_string()), Some(7));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get(&"fp".to_string()), None);
        assert!(cache.is_empty(), "expired entry removed lazily");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction_when_full() {
        let cache: ShardedTtlCache<&str, u32> = ShardedTtlCache::with_shards(2, 1);
        let ttl = Duration::from_secs(60);
        cache.insert("a", 1, ttl).unwrap();
        cache.insert("b", 2, ttl).unwrap();
        // touch "a" so "b" becomes least recently used
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3, ttl).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_make_room_before_eviction() {
        let cache: ShardedTtlCache<&str, u32> = ShardedTtlCache::with_shards(2, 1);
        cache.insert("old", 1, Duration::from_secs(1)).unwrap();
        cache.insert("keep", 2, Duration::from_secs(60)).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.insert("new", 3, Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get(&"keep"), Some(2));
        assert_eq!(cache.get(&"new"), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_does_not_evict() {
        let cache: ShardedTtlCache<&str, u32> = ShardedTtlCache::with_shards(1, 1);
        cache.insert("a", 1, Duration::from_secs(5)).unwrap();
        cache.insert("a", 2, Duration::from_secs(5)).unwrap();
        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_and_zero_ttl_rejected() {
        let disabled: ShardedTtlCache<&str, u32> = ShardedTtlCache::new(0);
        assert_eq!(
            disabled.insert("a", 1, Duration::from_secs(1)),
            Err(CacheError::Disabled)
        );
        let cache: ShardedTtlCache<&str, u32> = ShardedTtlCache::new(4);
        assert_eq!(cache.insert("a", 1, Duration::ZERO), Err(CacheError::ZeroTtl));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_and_remove() {
        let cache: ShardedTtlCache<u32, u32> = ShardedTtlCache::new(32);
        for i in 0..10 {
            cache.insert(i, i, Duration::from_secs(i as u64 + 1)).unwrap();
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.purge_expired(), 5);
        assert_eq!(cache.remove(&9), Some(9));
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_capacity_is_global_bound() {
        let cache: ShardedTtlCache<u32, u32> = ShardedTtlCache::with_shards(10, 4);
        assert_eq!(cache.capacity(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_eviction_below_capacity_regardless_of_shard_skew() {
        // Every key lands in one of 16 shards; a per-shard split of 32 would
        // allow two per shard and evict live entries long before 32.
        for _ in 0..50 {
            let cache: ShardedTtlCache<u32, u32> = ShardedTtlCache::new(32);
            for i in 0..32 {
                cache.insert(i, i, Duration::from_secs(600)).unwrap();
            }
            assert_eq!(cache.len(), 32);
            assert!((0..32).all(|i| cache.get(&i) == Some(i)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_lru_eviction_across_shards() {
        let cache: ShardedTtlCache<u32, u32> = ShardedTtlCache::with_shards(4, 4);
        let ttl = Duration::from_secs(60);
        for i in 0..4 {
            cache.insert(i, i, ttl).unwrap();
        }
        // 0 becomes the most recent, so 1 is the oldest
        assert_eq!(cache.get(&0), Some(0));
        cache.insert(4, 4, ttl).unwrap();

        assert_eq!(cache.len(), 4);
        assert_eq!(cache.get(&1), None);
        assert!([0, 2, 3, 4].iter().all(|i| cache.get(i) == Some(*i)));
    }
}
