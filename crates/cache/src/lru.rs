//! Generic key-to-slot LRU cache with lazy resource construction
//!
//! Binds external ordered keys (block indices) to a fixed arena of reusable
//! resources. Resources are built by a caller-supplied factory the first
//! time an empty slot is claimed, and after that slots are only ever
//! rebound, never reallocated.

use std::collections::{BTreeMap, BTreeSet};

use crate::slot_table::SlotTable;
use crate::{CacheError, CacheStats};

/// Factory for slot-backed resources.
///
/// `create` is called at most once per slot, lazily, when an empty slot is
/// first claimed. It is allowed to fail under memory pressure; the cache
/// then falls back to evicting an already-constructed slot instead.
pub trait SlotFactory<V> {
    /// Build one slot's backing resource.
    fn create(&mut self) -> Result<V, CacheError>;
}

impl<V, F> SlotFactory<V> for F
where
    F: FnMut() -> Result<V, CacheError>,
{
    fn create(&mut self) -> Result<V, CacheError> {
        self()
    }
}

/// LRU cache mapping keys to slot-backed resources
///
/// The forward (key to slot) and reverse (slot to key) maps are kept as
/// exact inverses: at most one entry per key and one per slot. A claimed
/// slot is marked in use and must be released before it can be evicted
/// again.
#[derive(Debug)]
pub struct LruCache<K, V, F> {
    table: SlotTable,
    resources: Vec<Option<V>>,
    forward: BTreeMap<K, usize>,
    reverse: Vec<Option<K>>,
    factory: F,
    stats: CacheStats,
}

impl<K, V, F> LruCache<K, V, F>
where
    K: Ord + Copy,
    F: SlotFactory<V>,
{
    /// Create a cache with `capacity` slots. Resources are not constructed
    /// until a slot is first claimed.
    pub fn new(capacity: usize, factory: F) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            table: SlotTable::new(capacity),
            resources: (0..capacity).map(|_| None).collect(),
            forward: BTreeMap::new(),
            reverse: vec![None; capacity],
            factory,
            stats: CacheStats::default(),
        })
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Number of keys currently bound to a slot.
    pub fn resident_len(&self) -> usize {
        self.forward.len()
    }

    /// Whether `key` is currently bound to a slot.
    pub fn is_resident(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    /// Snapshot of hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Find the first candidate key that is resident, touch its slot, and
    /// return its resource.
    ///
    /// Candidates are scanned in sorted key order. Never blocks and never
    /// evicts; `None` is a plain cache miss.
    pub fn get_any(&mut self, candidates: &BTreeSet<K>) -> Option<(K, &V)> {
        for key in candidates {
            let Some(&slot) = self.forward.get(key) else {
                continue;
            };
            // A bound slot always holds a constructed resource.
            let Some(resource) = self.resources[slot].as_ref() else {
                continue;
            };
            self.table.touch(slot);
            self.stats.hits += 1;
            return Some((*key, resource));
        }
        self.stats.misses += 1;
        None
    }

    /// Claim the globally least valuable slot for `key`, evicting whatever
    /// it held, and return the backing resource for the caller to fill.
    ///
    /// The claimed slot is marked in use; call [`release`](Self::release)
    /// when done with it. If `key` is already resident its existing slot is
    /// reclaimed in place.
    ///
    /// An empty slot's resource is constructed here on first use. If that
    /// construction fails, an already-constructed slot is evicted instead;
    /// only when neither option exists does this return an error.
    pub fn set_oldest(&mut self, key: K) -> Result<&mut V, CacheError> {
        let slot = match self.forward.get(&key) {
            Some(&slot) => slot,
            None => self.claim_slot()?,
        };

        if let Some(old) = self.reverse[slot] {
            if old != key {
                self.forward.remove(&old);
                self.stats.evictions += 1;
            }
        }
        self.forward.insert(key, slot);
        self.reverse[slot] = Some(key);
        self.table.set_in_use(slot, true);
        self.table.touch(slot);

        match self.resources[slot].as_mut() {
            Some(resource) => Ok(resource),
            None => Err(CacheError::AllocationFailed),
        }
    }

    /// Return a claimed slot to the evictable pool.
    pub fn release(&mut self, key: &K) -> bool {
        match self.forward.get(key) {
            Some(&slot) => {
                self.table.set_in_use(slot, false);
                true
            }
            None => false,
        }
    }

    /// Drop every key-to-slot binding without destroying resources.
    ///
    /// Used when upstream data invalidates all cached content, for example
    /// when switching files. Constructed resources stay in their slots and
    /// are reused by later claims.
    pub fn clear(&mut self) {
        self.forward.clear();
        for bound in &mut self.reverse {
            *bound = None;
        }
        self.table.reset();
    }

    fn claim_slot(&mut self) -> Result<usize, CacheError> {
        let capacity = self.capacity();
        let slot = self
            .table
            .eviction_candidate()
            .ok_or(CacheError::NoEvictableSlot(capacity))?;

        if self.resources[slot].is_none() {
            match self.factory.create() {
                Ok(resource) => self.resources[slot] = Some(resource),
                Err(_) => {
                    // Construction failed under pressure; fall back to a
                    // slot that already owns a resource.
                    let resources = &self.resources;
                    return self
                        .table
                        .eviction_candidate_where(|s| resources[s].is_some())
                        .ok_or(CacheError::AllocationFailed);
                }
            }
        }
        Ok(slot)
    }

    #[cfg(test)]
    fn check_invariants(&self)
    where
        K: std::fmt::Debug,
    {
        assert!(self.forward.len() <= self.capacity());
        for (key, &slot) in &self.forward {
            assert_eq!(self.reverse[slot].as_ref(), Some(key));
            assert!(self.resources[slot].is_some());
        }
        let bound = self.reverse.iter().filter(|k| k.is_some()).count();
        assert_eq!(bound, self.forward.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Factory that counts constructions and can be switched to fail.
    struct CountingFactory {
        built: usize,
        fail: bool,
    }

    impl SlotFactory<Vec<f32>> for &mut CountingFactory {
        fn create(&mut self) -> Result<Vec<f32>, CacheError> {
            if self.fail {
                return Err(CacheError::AllocationFailed);
            }
            self.built += 1;
            Ok(vec![0.0; 16])
        }
    }

    fn buffer_cache(capacity: usize) -> LruCache<u32, Vec<f32>, fn() -> Result<Vec<f32>, CacheError>>
    {
        LruCache::new(capacity, (|| Ok(vec![0.0f32; 16])) as fn() -> _).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result: Result<LruCache<u32, Vec<f32>, _>, _> =
            LruCache::new(0, || Ok(vec![0.0f32; 16]));
        assert!(matches!(result, Err(CacheError::ZeroCapacity)));
    }

    #[test]
    fn test_miss_then_claim_then_hit() {
        let mut cache = buffer_cache(2);

        let candidates = BTreeSet::from([7u32]);
        assert!(cache.get_any(&candidates).is_none());

        let buffer = cache.set_oldest(7).unwrap();
        buffer[0] = 1.5;
        cache.release(&7);

        let (key, buffer) = cache.get_any(&candidates).unwrap();
        assert_eq!(key, 7);
        assert_eq!(buffer[0], 1.5);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        cache.check_invariants();
    }

    #[test]
    fn test_get_any_picks_first_sorted_intersection() {
        let mut cache = buffer_cache(3);
        for key in [9u32, 3, 5] {
            cache.set_oldest(key).unwrap();
            cache.release(&key);
        }

        let candidates = BTreeSet::from([4u32, 5, 9]);
        let (key, _) = cache.get_any(&candidates).unwrap();
        assert_eq!(key, 5);
    }

    #[test]
    fn test_capacity_invariant() {
        let mut cache = buffer_cache(3);
        for key in 0..20u32 {
            cache.set_oldest(key).unwrap();
            cache.release(&key);
            assert!(cache.resident_len() <= 3);
            cache.check_invariants();
        }
        assert_eq!(cache.resident_len(), 3);
    }

    #[test]
    fn test_eviction_unbinds_old_key() {
        let mut cache = buffer_cache(1);
        cache.set_oldest(1).unwrap();
        cache.release(&1);
        cache.set_oldest(2).unwrap();
        cache.release(&2);

        assert!(!cache.is_resident(&1));
        assert!(cache.is_resident(&2));
        assert_eq!(cache.stats().evictions, 1);
        cache.check_invariants();
    }

    #[test]
    fn test_reclaim_resident_key_in_place() {
        let mut cache = buffer_cache(2);
        cache.set_oldest(1).unwrap();
        cache.release(&1);
        cache.set_oldest(2).unwrap();
        cache.release(&2);

        // Claiming key 1 again must reuse its own slot, not evict key 2.
        cache.set_oldest(1).unwrap();
        cache.release(&1);
        assert!(cache.is_resident(&1));
        assert!(cache.is_resident(&2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_in_use_slot_not_evicted() {
        let mut cache = buffer_cache(2);
        cache.set_oldest(1).unwrap(); // held, never released
        cache.set_oldest(2).unwrap();
        cache.release(&2);

        // Only key 2's slot is evictable.
        cache.set_oldest(3).unwrap();
        assert!(cache.is_resident(&1));
        assert!(!cache.is_resident(&2));
        assert!(cache.is_resident(&3));
    }

    #[test]
    fn test_all_slots_in_use_is_backpressure() {
        let mut cache = buffer_cache(1);
        cache.set_oldest(1).unwrap();
        assert!(matches!(
            cache.set_oldest(2),
            Err(CacheError::NoEvictableSlot(1))
        ));
    }

    #[test]
    fn test_lazy_construction_counts() {
        let mut factory = CountingFactory {
            built: 0,
            fail: false,
        };
        let mut cache = LruCache::new(2, &mut factory).unwrap();
        for key in 0..5u32 {
            cache.set_oldest(key).unwrap();
            cache.release(&key);
        }
        drop(cache);
        // Two slots, so exactly two constructions despite five claims.
        assert_eq!(factory.built, 2);
    }

    #[test]
    fn test_failed_construction_falls_back_to_eviction() {
        let mut factory = CountingFactory {
            built: 0,
            fail: false,
        };
        let mut cache = LruCache::new(2, &mut factory).unwrap();
        cache.set_oldest(1).unwrap();
        cache.release(&1);

        // The second slot's construction now fails, so claiming a new key
        // must evict key 1 instead of erroring out.
        cache.factory.fail = true;
        cache.set_oldest(2).unwrap();
        cache.release(&2);
        assert!(!cache.is_resident(&1));
        assert!(cache.is_resident(&2));
        cache.check_invariants();
    }

    #[test]
    fn test_failed_construction_with_nothing_built_is_fatal() {
        let mut factory = CountingFactory {
            built: 0,
            fail: true,
        };
        let mut cache = LruCache::new(1, &mut factory).unwrap();
        assert!(matches!(
            cache.set_oldest(1),
            Err(CacheError::AllocationFailed)
        ));
    }

    #[test]
    fn test_clear_unbinds_but_reuses_resources() {
        let mut factory = CountingFactory {
            built: 0,
            fail: false,
        };
        let mut cache = LruCache::new(2, &mut factory).unwrap();
        cache.set_oldest(1).unwrap();
        cache.release(&1);
        cache.set_oldest(2).unwrap();
        cache.release(&2);

        cache.clear();

        // Every previously bound key misses now.
        assert!(cache.get_any(&BTreeSet::from([1u32])).is_none());
        assert!(cache.get_any(&BTreeSet::from([2u32])).is_none());
        assert_eq!(cache.resident_len(), 0);

        // Rebinding succeeds without constructing anything new.
        cache.set_oldest(1).unwrap();
        cache.release(&1);
        drop(cache);
        assert_eq!(factory.built, 2);
    }

    #[test]
    fn test_lru_order_drives_eviction() {
        let mut cache = buffer_cache(2);
        cache.set_oldest(1).unwrap();
        cache.release(&1);
        cache.set_oldest(2).unwrap();
        cache.release(&2);

        // Touch key 1 via a hit; key 2 becomes the older binding.
        cache.get_any(&BTreeSet::from([1u32]));

        cache.set_oldest(3).unwrap();
        cache.release(&3);
        assert!(cache.is_resident(&1));
        assert!(!cache.is_resident(&2));
    }
}
