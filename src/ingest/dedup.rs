//! Fast-path idempotency keys.
//!
//! The durable event store is the authority on whether an event was seen.
//! An [`IdempotencyStore`] only short-circuits the common redelivery case
//! before touching it, so implementations may forget keys at any time.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Best-effort record of already-ingested event hashes.
pub trait IdempotencyStore: Send + Sync {
    /// Returns true if `hash` is known to have been ingested.
    fn contains(&self, hash: &str) -> bool;

    /// Records `hash` as ingested.
    fn insert(&self, hash: &str);
}

/// Default capacity of [`InMemoryIdempotencyCache`].
pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

#[derive(Debug, Default)]
struct CacheState {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded in-process cache; the oldest key is evicted first.
#[derive(Debug)]
pub struct InMemoryIdempotencyCache {
    state: Mutex<CacheState>,
    capacity: usize,
}

impl InMemoryIdempotencyCache {
    /// Creates a cache holding at most `capacity` keys (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            capacity: capacity.max(1),
        }
    }

    /// Number of cached keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |s| s.keys.len())
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl IdempotencyStore for InMemoryIdempotencyCache {
    fn contains(&self, hash: &str) -> bool {
        // A poisoned cache is just a miss; the durable store still answers.
        self.state.lock().map_or(false, |s| s.keys.contains(hash))
    }

    fn insert(&self, hash: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.keys.insert(hash.to_string()) {
            return;
        }
        state.order.push_back(hash.to_string());
        while state.order.len() > self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.keys.remove(&oldest);
            }
        }
    }
}
