//! Signal Viewer Cache Library
//!
//! Slot-based LRU/priority caches for streaming signal blocks. A fixed
//! arena of reusable buffer slots is bound to block keys on demand, with
//! eviction ordered by in-use state, priority, and recency.
//!
//! Two cache flavors share the same [`SlotTable`] bookkeeping:
//!
//! - [`LruCache`] binds keys to resources it constructs itself (through a
//!   [`SlotFactory`]) at claim time.
//! - [`PriorityCache`] adapts the same model to a request/fulfillment
//!   protocol for fills that run on a separate loader thread, with an
//!   explicit pending-request queue and admission control.

pub mod lru;
pub mod priority;
pub mod slot_table;

pub use lru::{LruCache, SlotFactory};
pub use priority::PriorityCache;
pub use slot_table::{Priority, SlotTable, PRIORITY_IDLE, PRIORITY_URGENT};

use thiserror::Error;

/// Errors raised by cache construction and slot claiming.
///
/// Cache misses and backpressure are not errors; they are `None`/`false`
/// returns on the lookup and fill operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A cache needs at least one slot to operate.
    #[error("cache capacity must be at least one slot")]
    ZeroCapacity,

    /// Every slot is currently borrowed, so nothing can be claimed.
    #[error("no evictable slot: all {0} slots are in use")]
    NoEvictableSlot(usize),

    /// A slot's backing resource could not be constructed and no
    /// already-constructed slot was available to evict.
    #[error("slot resource allocation failed")]
    AllocationFailed,
}

/// Counters describing cache behavior over time.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Number of lookups satisfied from a resident slot
    pub hits: u64,

    /// Number of lookups that found no resident candidate
    pub misses: u64,

    /// Number of keys displaced to make room for another
    pub evictions: u64,

    /// Number of fills refused by admission control (backpressure)
    pub refusals: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
