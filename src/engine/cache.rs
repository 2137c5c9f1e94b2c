use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// A map whose entries expire a fixed TTL after insertion.
///
/// Expired entries are invisible to `get` immediately and reclaimed lazily
/// by `sweep`. Not synchronized; callers wrap it in a lock when shared.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

impl<K: Eq + Hash, V> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Insert or replace, resetting the entry's clock to `now`.
    pub fn insert(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    pub fn get(&self, key: &K, now: Instant) -> Option<&V> {
        let entry = self.entries.get(key)?;
        if now.duration_since(entry.inserted_at) >= self.ttl {
            return None;
        }
        Some(&entry.value)
    }

    pub fn get_mut(&mut self, key: &K, now: Instant) -> Option<&mut V> {
        let ttl = self.ttl;
        let entry = self.entries.get_mut(key)?;
        if now.duration_since(entry.inserted_at) >= ttl {
            return None;
        }
        Some(&mut entry.value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Reclaim expired entries. Call periodically; `get` stays correct
    /// either way.
    pub fn sweep(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
    }

    /// Entry count including not-yet-swept expired entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_before_and_after_expiry() {
        let now = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(10));
        cache.insert("k", 7u32, now);

        assert_eq!(cache.get(&"k", now + Duration::from_secs(9)), Some(&7));
        assert_eq!(cache.get(&"k", now + Duration::from_secs(10)), None);
    }

    #[test]
    fn insert_resets_clock() {
        let now = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(10));
        cache.insert("k", 1u32, now);
        cache.insert("k", 2u32, now + Duration::from_secs(8));

        // 12s after the first insert but only 4s after the second
        assert_eq!(cache.get(&"k", now + Duration::from_secs(12)), Some(&2));
    }

    #[test]
    fn sweep_reclaims_expired_only() {
        let now = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(10));
        cache.insert("old", 1u32, now);
        cache.insert("new", 2u32, now + Duration::from_secs(8));

        cache.sweep(now + Duration::from_secs(12));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"new", now + Duration::from_secs(12)), Some(&2));
    }

    #[test]
    fn get_mut_respects_expiry() {
        let now = Instant::now();
        let mut cache = TtlCache::new(Duration::from_secs(5));
        cache.insert("k", vec![1u32], now);

        cache.get_mut(&"k", now).unwrap().push(2);
        assert_eq!(cache.get(&"k", now), Some(&vec![1, 2]));
        assert!(cache.get_mut(&"k", now + Duration::from_secs(5)).is_none());
    }
}
