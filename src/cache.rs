//! Capacity-bounded result cache with least-recently-used eviction.

use std::fmt::Debug;

use slab::Slab;

struct CacheEntry<K, V> {
    key: K,
    value: V,
    last_used: u64,
}

/// A small cache mapping request keys to lazily computed values.
///
/// Keys are compared with `PartialEq` rather than hashed, because the time
/// component of a request key uses tolerance-aware equality. Layer caches hold
/// a few tens of entries, so lookup is a linear scan.
///
/// When an insert would exceed the capacity, the least recently used entry is
/// evicted. Dropping an evicted value releases whatever it holds, such as the
/// strong reference to a reconstruct context.
///
/// # Examples
///
/// ```
/// # use layer_flow::BoundedCache;
/// let mut cache = BoundedCache::new(2);
/// let v = cache.get_or_try_insert_with("a", || Ok::<_, ()>(1)).unwrap();
/// assert_eq!(v, 1);
/// // A hit never calls the factory.
/// let v = cache.get_or_try_insert_with("a", || Err(())).unwrap();
/// assert_eq!(v, 1);
/// ```
pub struct BoundedCache<K, V> {
    entries: Slab<CacheEntry<K, V>>,
    capacity: usize,
    clock: u64,
}

impl<K: Debug, V> Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .field("keys", &self.entries.iter().map(|(_, e)| &e.key).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: PartialEq + Debug,
    V: Clone,
{
    /// Create an empty cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity, evicting least recently used entries if needed.
    ///
    /// Returns the evicted keys.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<K> {
        self.capacity = capacity.max(1);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.evict_lru() {
                Some(key) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.key == *key)
            .map(|(index, _)| index)
    }

    /// Look up `key` and mark it as most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let index = self.position(key)?;
        let now = self.tick();
        let entry = &mut self.entries[index];
        entry.last_used = now;
        Some(entry.value.clone())
    }

    /// Look up `key` mutably and mark it as most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let index = self.position(key)?;
        let now = self.tick();
        let entry = &mut self.entries[index];
        entry.last_used = now;
        Some(&mut entry.value)
    }

    /// Look up `key` without affecting recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.position(key).map(|index| &self.entries[index].value)
    }

    /// Returns true if `key` is cached.
    pub fn contains(&self, key: &K) -> bool {
        self.position(key).is_some()
    }

    /// Insert or replace the value for `key`.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        let now = self.tick();
        if let Some(index) = self.position(&key) {
            let entry = &mut self.entries[index];
            entry.value = value;
            entry.last_used = now;
            return None;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.evict_lru()
        } else {
            None
        };
        self.entries.insert(CacheEntry {
            key,
            value,
            last_used: now,
        });
        evicted
    }

    /// Return the cached value for `key`, creating it with `create` on a miss.
    ///
    /// If `create` fails nothing is inserted, so the next call retries.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        key: K,
        create: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = create()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let index = self.position(key)?;
        Some(self.entries.remove(index).value)
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate over cached keys in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.entries.iter().map(|(_, entry)| &entry.key)
    }

    fn evict_lru(&mut self) -> Option<K> {
        let index = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(index, _)| index)?;
        let entry = self.entries.remove(index);
        tracing::trace!(key = ?entry.key, "evicted least recently used cache entry");
        Some(entry.key)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::time::{GeoTime, GEO_TIME_EPSILON};

    fn query(cache: &mut BoundedCache<&'static str, u32>, key: &'static str, calls: &Cell<u32>) {
        cache
            .get_or_try_insert_with(key, || {
                calls.set(calls.get() + 1);
                Ok::<_, ()>(calls.get())
            })
            .unwrap();
    }

    #[test]
    fn test_lru_keeps_recently_touched_entry() {
        let calls = Cell::new(0);
        let mut cache = BoundedCache::new(2);

        query(&mut cache, "a", &calls);
        query(&mut cache, "b", &calls);
        query(&mut cache, "a", &calls);
        query(&mut cache, "c", &calls);

        assert_eq!(calls.get(), 3);
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn test_lru_sequence_without_touch() {
        let calls = Cell::new(0);
        let mut cache = BoundedCache::new(2);

        query(&mut cache, "a", &calls);
        query(&mut cache, "b", &calls);
        query(&mut cache, "c", &calls);
        // "a" was least recently used when "c" arrived.
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));

        query(&mut cache, "a", &calls);
        // Re-creating "a" evicts "b", the oldest remaining entry.
        assert_eq!(calls.get(), 4);
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"c"));
        assert!(cache.contains(&"a"));
    }

    #[test]
    fn test_failed_factory_leaves_no_entry() {
        let mut cache: BoundedCache<&'static str, u32> = BoundedCache::new(4);
        let result = cache.get_or_try_insert_with("a", || Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(cache.is_empty());

        let result = cache.get_or_try_insert_with("a", || Ok::<_, &str>(7));
        assert_eq!(result, Ok(7));
    }

    #[test]
    fn test_shrinking_capacity_evicts_oldest() {
        let mut cache = BoundedCache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(3, "three");
        cache.get(&1);

        let evicted = cache.set_capacity(1);
        assert_eq!(evicted, vec![2, 3]);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&1));
    }

    #[test]
    fn test_time_keys_use_tolerance() {
        let mut cache = BoundedCache::new(4);
        cache.insert(GeoTime::new(10.0), 1);
        assert_eq!(cache.get(&GeoTime::new(10.0 + GEO_TIME_EPSILON / 2.0)), Some(1));
        assert_eq!(cache.get(&GeoTime::new(10.0 + GEO_TIME_EPSILON * 10.0)), None);
    }
}
