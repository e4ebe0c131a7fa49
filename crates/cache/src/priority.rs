//! Priority cache logic for pull/fill pipelines
//!
//! Variant of the LRU cache used when populating a slot requires a slow
//! I/O or compute step performed by a different thread than the requester.
//! Consumers enqueue block keys with a priority; a loader thread pops the
//! most urgent unmet request with [`PriorityCache::fill`], performs the
//! blocking work, and publishes the slot with
//! [`PriorityCache::release`].
//!
//! Per-key lifecycle: unrequested, pending (in the request queue), filling
//! (slot claimed and in use by the loader), ready (bound, not in use),
//! borrowed (in use by a consumer), then back to ready on release or
//! evicted back to unrequested.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::slot_table::{Priority, SlotTable, PRIORITY_IDLE};
use crate::{CacheError, CacheStats};

/// A queued `(key, priority)` request.
///
/// Requests are served most urgent first (lowest priority value); equal
/// priorities are served in insertion order, so the queue is FIFO within a
/// priority level.
#[derive(Debug, Clone, Copy)]
struct PendingRequest<K> {
    key: K,
    priority: Priority,

    /// Monotone arrival stamp for the FIFO tie-break
    arrival: u64,
}

impl<K: Eq> PartialEq for PendingRequest<K> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.arrival == other.arrival
    }
}

impl<K: Eq> Eq for PendingRequest<K> {}

impl<K: Eq> PartialOrd for PendingRequest<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Eq> Ord for PendingRequest<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap, so reverse both fields: the greatest
        // element is the lowest priority value, earliest arrival.
        match other.priority.cmp(&self.priority) {
            Ordering::Equal => other.arrival.cmp(&self.arrival),
            ordering => ordering,
        }
    }
}

/// Key-to-slot cache with an explicit pending-request queue
///
/// Slot storage itself lives with the caller (the pipeline stage owns the
/// actual buffers); this type manages bindings, borrow state, priorities,
/// and admission control. The forward and reverse maps are exact inverses
/// at all times.
#[derive(Debug)]
pub struct PriorityCache<K> {
    table: SlotTable,
    forward: BTreeMap<K, usize>,
    reverse: Vec<Option<K>>,
    pending: BinaryHeap<PendingRequest<K>>,

    /// Best (priority, arrival) currently queued per key. Superseded heap
    /// entries are dropped lazily when popped.
    pending_index: BTreeMap<K, (Priority, u64)>,

    arrival_counter: u64,
    stats: CacheStats,
}

impl<K> PriorityCache<K>
where
    K: Ord + Copy,
{
    /// Create cache logic for `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::ZeroCapacity);
        }
        Ok(Self {
            table: SlotTable::new(capacity),
            forward: BTreeMap::new(),
            reverse: vec![None; capacity],
            pending: BinaryHeap::new(),
            pending_index: BTreeMap::new(),
            arrival_counter: 0,
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

    /// Number of distinct keys waiting for a slot.
    pub fn pending_len(&self) -> usize {
        self.pending_index.len()
    }

    /// Whether `key` is currently bound to a slot.
    pub fn is_resident(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    /// Whether the given slot is currently borrowed.
    pub fn is_in_use(&self, slot: usize) -> bool {
        self.table.in_use(slot)
    }

    /// Snapshot of hit/miss/eviction/refusal counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Request the given keys at `priority`.
    ///
    /// A key that is already resident has its stored priority tightened in
    /// place (the more urgent value wins). Anything else is queued; a key
    /// already queued at an equal or more urgent priority is left alone.
    pub fn enqueue<I>(&mut self, keys: I, priority: Priority)
    where
        I: IntoIterator<Item = K>,
    {
        for key in keys {
            if let Some(&slot) = self.forward.get(&key) {
                if priority < self.table.priority(slot) {
                    self.table.set_priority(slot, priority);
                }
                continue;
            }
            match self.pending_index.get(&key) {
                Some(&(queued, _)) if queued <= priority => {}
                _ => {
                    self.arrival_counter += 1;
                    let request = PendingRequest {
                        key,
                        priority,
                        arrival: self.arrival_counter,
                    };
                    self.pending_index.insert(key, (priority, request.arrival));
                    self.pending.push(request);
                }
            }
        }
    }

    /// Pop the most urgent pending request and claim a slot for it.
    ///
    /// Returns the `(slot, key)` pair for the caller to fill with data; the
    /// slot is marked in use until [`release`](Self::release) or
    /// [`abort_fill`](Self::abort_fill).
    ///
    /// Admission control: a pending request may only displace resident data
    /// whose priority is numerically strictly greater (strictly less
    /// urgent) than its own. If the eviction candidate is in use or not
    /// strictly worse, the request stays queued and `None` is returned:
    /// the normal backpressure signal, resolved by a later release.
    pub fn fill(&mut self) -> Option<(usize, K)> {
        loop {
            let request = self.pending.pop()?;

            // Drop stale heap entries: requests superseded by a more
            // urgent re-enqueue, and requests whose key became resident
            // while they waited (enqueue already tightened the slot's
            // priority in that case).
            match self.pending_index.get(&request.key) {
                Some(&(priority, arrival))
                    if priority == request.priority && arrival == request.arrival => {}
                _ => continue,
            }

            let candidate = self.table.eviction_candidate();
            let admissible = match candidate {
                Some(slot) => {
                    self.reverse[slot].is_none() || self.table.priority(slot) > request.priority
                }
                None => false,
            };
            if !admissible {
                self.stats.refusals += 1;
                self.pending.push(request);
                return None;
            }

            let slot = candidate?;
            if let Some(old) = self.reverse[slot].take() {
                self.forward.remove(&old);
                self.stats.evictions += 1;
            }
            self.pending_index.remove(&request.key);
            self.forward.insert(request.key, slot);
            self.reverse[slot] = Some(request.key);
            self.table.set_priority(slot, request.priority);
            self.table.set_in_use(slot, true);
            self.table.touch(slot);
            return Some((slot, request.key));
        }
    }

    /// Borrow the first resident, not-in-use candidate key.
    ///
    /// On a hit the slot is marked in use and touched. On a total miss
    /// every candidate is enqueued at `miss_priority` as a side effect, so
    /// a later [`fill`](Self::fill) will service the request.
    pub fn read_any(
        &mut self,
        candidates: &BTreeSet<K>,
        miss_priority: Priority,
    ) -> Option<(usize, K)> {
        if let Some(found) = self.borrow_first(candidates) {
            return Some(found);
        }
        self.stats.misses += 1;
        self.enqueue(candidates.iter().copied(), miss_priority);
        None
    }

    /// Borrow the first resident, not-in-use candidate key without
    /// queueing anything or counting a miss.
    ///
    /// Retry path for a blocking reader whose candidates are already
    /// queued: the request was counted and enqueued once by
    /// [`read_any`](Self::read_any), so later polls must not inflate the
    /// miss counter.
    pub fn try_read_any(&mut self, candidates: &BTreeSet<K>) -> Option<(usize, K)> {
        self.borrow_first(candidates)
    }

    fn borrow_first(&mut self, candidates: &BTreeSet<K>) -> Option<(usize, K)> {
        for key in candidates {
            let Some(&slot) = self.forward.get(key) else {
                continue;
            };
            if self.table.in_use(slot) {
                // Still being filled or borrowed elsewhere.
                continue;
            }
            self.table.set_in_use(slot, true);
            self.table.touch(slot);
            self.stats.hits += 1;
            return Some((slot, *key));
        }
        None
    }

    /// Return a borrowed slot to the evictable pool, optionally resetting
    /// its resting priority (for example to demote a block the renderer is
    /// done showing).
    pub fn release(&mut self, key: &K, new_priority: Option<Priority>) -> bool {
        match self.forward.get(key) {
            Some(&slot) => {
                self.table.set_in_use(slot, false);
                if let Some(priority) = new_priority {
                    self.table.set_priority(slot, priority);
                }
                true
            }
            None => false,
        }
    }

    /// Abandon a claimed fill without publishing it.
    ///
    /// Unbinds the key and frees the slot so partial data is never exposed
    /// as ready. Used by the loader when the fill body fails.
    pub fn abort_fill(&mut self, key: &K) {
        if let Some(slot) = self.forward.remove(key) {
            self.reverse[slot] = None;
            self.table.set_in_use(slot, false);
            self.table.set_priority(slot, PRIORITY_IDLE);
        }
    }

    /// Drop all bindings and pending requests. Slot storage owned by the
    /// caller is untouched and reusable.
    pub fn clear(&mut self) {
        self.forward.clear();
        for bound in &mut self.reverse {
            *bound = None;
        }
        self.pending.clear();
        self.pending_index.clear();
        self.table.reset();
    }

    #[cfg(test)]
    fn check_invariants(&self)
    where
        K: std::fmt::Debug,
    {
        assert!(self.forward.len() <= self.capacity());
        for (key, &slot) in &self.forward {
            assert_eq!(self.reverse[slot].as_ref(), Some(key));
        }
        let bound = self.reverse.iter().filter(|k| k.is_some()).count();
        assert_eq!(bound, self.forward.len());
        // Nothing both resident and pending.
        for key in self.pending_index.keys() {
            assert!(!self.forward.contains_key(key));
        }
    }
}
