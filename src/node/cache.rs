//! Byte weighted LRU store backing a node's share of the key space.

use bytes::Bytes;
use lru::LruCache;
use tracing::trace;

use crate::common::Id;

/// Default capacity, in bytes of stored values.
pub const DEFAULT_CACHE_CAPACITY: usize = 100 * 1024 * 1024;

#[derive(Debug)]
/// LRU cache bounded by the total length of its values rather than their count.
pub struct WeightedCache {
    entries: LruCache<Id, Bytes>,
    weight: usize,
    capacity: usize,
}

impl Default for WeightedCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl WeightedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            weight: 0,
            capacity,
        }
    }

    /// Stores `value` as the most recently used entry, evicting the least recently
    /// used ones until the cache fits its capacity again.
    ///
    /// A value larger than the whole capacity is not stored, and drops any older
    /// value under the same key.
    pub fn insert(&mut self, key: Id, value: Bytes) {
        if value.len() > self.capacity {
            trace!(?key, size = value.len(), "Value exceeds the cache capacity");
            self.remove(&key);
            return;
        }

        self.weight += value.len();
        if let Some(old) = self.entries.put(key, value) {
            self.weight -= old.len();
        }

        self.shrink();
    }

    /// Returns the value and marks it as most recently used.
    pub fn get(&mut self, key: &Id) -> Option<Bytes> {
        self.entries.get(key).cloned()
    }

    /// Returns the value without touching its recency.
    pub fn peek(&self, key: &Id) -> Option<Bytes> {
        self.entries.peek(key).cloned()
    }

    pub fn remove(&mut self, key: &Id) -> Option<Bytes> {
        let value = self.entries.pop(key)?;
        self.weight -= value.len();

        Some(value)
    }

    pub fn contains(&self, key: &Id) -> bool {
        self.entries.contains(key)
    }

    /// Total length of the stored values.
    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn shrink(&mut self) {
        while self.weight > self.capacity {
            match self.entries.pop_lru() {
                Some((key, value)) => {
                    self.weight -= value.len();
                    trace!(?key, size = value.len(), "Evicted cached value");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn value(size: usize) -> Bytes {
        vec![0u8; size].into()
    }

    #[test]
    fn weight_accounting() {
        let mut cache = WeightedCache::new(100);
        let key = Id::random();

        cache.insert(key, value(10));
        cache.insert(Id::random(), value(20));
        assert_eq!(cache.weight(), 30);

        // Replacing a value only counts the new one.
        cache.insert(key, value(5));
        assert_eq!(cache.weight(), 25);
        assert_eq!(cache.len(), 2);

        cache.remove(&key);
        assert_eq!(cache.weight(), 20);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = WeightedCache::new(30);
        let (a, b, c) = (Id::random(), Id::random(), Id::random());

        cache.insert(a, value(10));
        cache.insert(b, value(10));
        cache.insert(c, value(10));

        // Touch `a`, making `b` the least recently used.
        cache.get(&a);
        cache.insert(Id::random(), value(10));

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.weight(), 30);
    }

    #[test]
    fn peek_does_not_promote() {
        let mut cache = WeightedCache::new(20);
        let (a, b) = (Id::random(), Id::random());

        cache.insert(a, value(10));
        cache.insert(b, value(10));
        cache.peek(&a);
        cache.insert(Id::random(), value(10));

        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
    }

    #[test]
    fn oversized_values_are_dropped() {
        let mut cache = WeightedCache::new(10);
        let key = Id::random();

        cache.insert(key, value(5));
        cache.insert(key, value(11));

        assert!(cache.is_empty());
        assert_eq!(cache.weight(), 0);
    }
}
