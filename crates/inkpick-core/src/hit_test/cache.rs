//! Fixed-capacity point-query cache with insertion-order eviction.

use crate::element::ElementId;
use kurbo::Point;
use std::collections::{HashMap, VecDeque};

/// Coordinates and tolerances are bucketed to this step before hashing.
pub const KEY_QUANTUM: f64 = 1e-6;

/// Quantized `(point, tolerance)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    x: i64,
    y: i64,
    tolerance: i64,
}

impl CacheKey {
    /// Build a key, or `None` if any input is not finite or too large to
    /// quantize without saturating.
    pub fn new(point: Point, tolerance: f64) -> Option<Self> {
        if !point.is_finite() || !tolerance.is_finite() {
            return None;
        }
        Some(Self {
            x: quantize(point.x)?,
            y: quantize(point.y)?,
            tolerance: quantize(tolerance.max(0.0))?,
        })
    }
}

fn quantize(value: f64) -> Option<i64> {
    let scaled = (value / KEY_QUANTUM).round();
    // `i64::MAX as f64` is 2^63, the first value that no longer fits.
    (scaled.abs() < i64::MAX as f64).then_some(scaled as i64)
}

#[derive(Debug, Clone)]
struct Slot {
    key: CacheKey,
    ids: Vec<ElementId>,
}

/// Arena-backed cache. Hits do not refresh an entry's position; the oldest
/// inserted entry is evicted first.
#[derive(Debug, Clone)]
pub struct QueryCache {
    capacity: usize,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    lookup: HashMap<CacheKey, usize>,
    order: VecDeque<usize>,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    /// Create a cache holding at most `capacity` entries. Zero disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            free: Vec::new(),
            lookup: HashMap::new(),
            order: VecDeque::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    /// Look up a key, counting the hit or miss.
    pub fn get(&mut self, key: &CacheKey) -> Option<&[ElementId]> {
        match self.lookup.get(key) {
            Some(&slot) => {
                self.hits += 1;
                self.slots[slot].as_ref().map(|s| s.ids.as_slice())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Store a result, evicting the oldest entry when full.
    pub fn insert(&mut self, key: CacheKey, ids: Vec<ElementId>) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&slot) = self.lookup.get(&key) {
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.ids = ids;
            }
            return;
        }
        while self.lookup.len() >= self.capacity {
            if !self.evict_oldest() {
                break;
            }
        }

        let entry = Some(Slot { key, ids });
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = entry;
                slot
            }
            None => {
                self.slots.push(entry);
                self.slots.len() - 1
            }
        };
        self.lookup.insert(key, slot);
        self.order.push_back(slot);
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(slot) = self.order.pop_front() else {
            return false;
        };
        if let Some(entry) = self.slots[slot].take() {
            self.lookup.remove(&entry.key);
        }
        self.free.push(slot);
        true
    }

    /// Drop every entry. Hit and miss counters are kept.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.lookup.clear();
        self.order.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Fraction of lookups answered from the cache.
    pub fn hit_ratio(&self) -> f64 {
        crate::index::ratio(self.hits, self.hits + self.misses)
    }

    /// Approximate bytes held by cached results.
    pub fn memory_usage(&self) -> usize {
        let ids: usize = self
            .slots
            .iter()
            .flatten()
            .map(|s| s.ids.capacity() * std::mem::size_of::<ElementId>())
            .sum();
        let entry = std::mem::size_of::<CacheKey>() + std::mem::size_of::<usize>();
        ids + self.slots.capacity() * std::mem::size_of::<Option<Slot>>()
            + self.lookup.capacity() * entry
            + self.order.capacity() * std::mem::size_of::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn key(x: f64) -> CacheKey {
        CacheKey::new(Point::new(x, 0.0), 0.0).unwrap()
    }

    #[test]
    fn test_evicts_in_insertion_order() {
        let mut cache = QueryCache::new(2);
        let a = vec![Uuid::new_v4()];
        cache.insert(key(1.0), a.clone());
        cache.insert(key(2.0), Vec::new());

        // A hit does not protect the oldest entry.
        assert_eq!(cache.get(&key(1.0)), Some(a.as_slice()));
        cache.insert(key(3.0), Vec::new());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1.0)).is_none());
        assert!(cache.get(&key(2.0)).is_some());
        assert!(cache.get(&key(3.0)).is_some());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let mut cache = QueryCache::new(0);
        cache.insert(key(1.0), Vec::new());
        assert!(cache.is_empty());
        assert!(cache.get(&key(1.0)).is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_quantization_collapses_noise() {
        let a = CacheKey::new(Point::new(10.0, 20.0), 2.0).unwrap();
        let b = CacheKey::new(Point::new(10.0 + 1e-9, 20.0), 2.0).unwrap();
        let c = CacheKey::new(Point::new(10.00001, 20.0), 2.0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(CacheKey::new(Point::new(f64::NAN, 0.0), 0.0).is_none());
        assert!(CacheKey::new(Point::new(1e13, 0.0), 0.0).is_none());
        assert!(CacheKey::new(Point::new(0.0, -5e13), 0.0).is_none());
        assert!(CacheKey::new(Point::ZERO, 1e14).is_none());
        assert!(CacheKey::new(Point::new(9e12, 0.0), 0.0).is_some());
        assert_eq!(
            CacheKey::new(Point::ZERO, -1.0),
            CacheKey::new(Point::ZERO, 0.0)
        );
    }

    #[test]
    fn test_clear_keeps_counters_and_reuses_slots() {
        let mut cache = QueryCache::new(4);
        cache.insert(key(1.0), Vec::new());
        cache.get(&key(1.0));
        cache.get(&key(9.0));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
        assert!((cache.hit_ratio() - 0.5).abs() < 1e-12);

        for i in 0..10 {
            cache.insert(key(i as f64), Vec::new());
        }
        assert_eq!(cache.len(), 4);
        assert!(cache.get(&key(9.0)).is_some());
        assert!(cache.get(&key(5.0)).is_none());
    }

    #[test]
    fn test_reinsert_updates_in_place() {
        let mut cache = QueryCache::new(2);
        let id = Uuid::new_v4();
        cache.insert(key(1.0), Vec::new());
        cache.insert(key(1.0), vec![id]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(1.0)), Some([id].as_slice()));
    }
}
