//! Slot table with priority/recency eviction ordering
//!
//! Tracks the bookkeeping for a fixed set of reusable buffer slots and
//! answers "which slot is least valuable to keep". Slots that are in use
//! are never candidates; among the rest, a higher (less urgent) priority
//! value loses to a lower one, and ties go to the least recently touched
//! slot.

/// Numeric urgency value for pending fills and resident data.
///
/// Lower values are more urgent. `PRIORITY_IDLE` marks a slot no request
/// currently cares about, which makes it the first thing to evict.
pub type Priority = u32;

/// Resting priority of a slot with no pending need.
pub const PRIORITY_IDLE: Priority = Priority::MAX;

/// Priority used when a consumer is actively blocked waiting for a block.
pub const PRIORITY_URGENT: Priority = 0;

/// Per-slot bookkeeping
#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    /// Slot is borrowed (being filled by a loader or held by a consumer)
    in_use: bool,

    /// Urgency of the data the slot holds (or `PRIORITY_IDLE`)
    priority: Priority,

    /// Global tick of the last access; 0 means never touched
    last_touch: u64,
}

/// Fixed-capacity table of slot metadata with eviction ordering
///
/// Eviction order, most evictable first: not-in-use slots sorted by
/// descending priority value, then by ascending last-touch tick. A slot
/// that was never touched sorts as the oldest possible, so freshly
/// constructed (still unbound) slots are claimed before anything resident
/// is displaced.
///
/// Recency is implemented as a monotone global clock rather than a
/// per-slot counter that every access would have to increment: `touch`
/// stamps the current tick, and "older" means a smaller stamp.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<SlotMeta>,

    /// Slot indices sorted by eviction preference; rebuilt lazily
    order: Vec<usize>,

    /// Set when priorities or recency changed since the last sort
    dirty: bool,

    /// Global access clock
    clock: u64,
}

impl SlotTable {
    /// Create a table of `capacity` slots, all unused and idle.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![
                SlotMeta {
                    in_use: false,
                    priority: PRIORITY_IDLE,
                    last_touch: 0,
                };
                capacity
            ],
            order: (0..capacity).collect(),
            dirty: capacity > 1,
            clock: 0,
        }
    }

    /// Number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Find the least valuable slot that is not in use.
    ///
    /// Returns `None` only when every slot is in use. That is the normal
    /// backpressure outcome, not an error.
    pub fn eviction_candidate(&mut self) -> Option<usize> {
        self.eviction_candidate_where(|_| true)
    }

    /// Like [`eviction_candidate`](Self::eviction_candidate), restricted to
    /// slots the predicate accepts.
    pub fn eviction_candidate_where<F>(&mut self, accept: F) -> Option<usize>
    where
        F: Fn(usize) -> bool,
    {
        self.resort();
        self.order
            .iter()
            .copied()
            .find(|&slot| !self.slots[slot].in_use && accept(slot))
    }

    /// Set the stored priority of a slot.
    pub fn set_priority(&mut self, slot: usize, priority: Priority) {
        if self.slots[slot].priority != priority {
            self.slots[slot].priority = priority;
            self.dirty = true;
        }
    }

    /// Get the stored priority of a slot.
    pub fn priority(&self, slot: usize) -> Priority {
        self.slots[slot].priority
    }

    /// Mark a slot as borrowed or returned.
    pub fn set_in_use(&mut self, slot: usize, in_use: bool) {
        self.slots[slot].in_use = in_use;
    }

    /// Whether a slot is currently borrowed.
    pub fn in_use(&self, slot: usize) -> bool {
        self.slots[slot].in_use
    }

    /// Record an access to a slot, making it the most recently used.
    pub fn touch(&mut self, slot: usize) {
        self.clock += 1;
        self.slots[slot].last_touch = self.clock;
        self.dirty = true;
    }

    /// Reset every slot to unused and idle. Recency survives so that
    /// reclaim order after a reset is still deterministic.
    pub fn reset(&mut self) {
        for meta in &mut self.slots {
            meta.in_use = false;
            meta.priority = PRIORITY_IDLE;
        }
        self.dirty = true;
    }

    fn resort(&mut self) {
        if !self.dirty {
            return;
        }
        let slots = &self.slots;
        self.order
            .sort_by_key(|&slot| (std::cmp::Reverse(slots[slot].priority), slots[slot].last_touch));
        self.dirty = false;
    }
}
