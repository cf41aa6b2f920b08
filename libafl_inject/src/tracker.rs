//! Occurrence counters, per function and per return address.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use hashbrown::HashMap;
use strum::EnumCount;

use crate::function::Function;

/// Counts intercepted calls.
///
/// Both increment functions hand out occurrence indices: the first call gets `0`, and no two
/// concurrent calls ever get the same index. Counters are never reset.
#[derive(Debug)]
pub struct CallTracker {
    call_counts: [AtomicU64; Function::COUNT],
    /// Keyed by the normalized return address. The lock is only taken exclusively to insert a
    /// new address; counting at a known address is a shared lock and an atomic add.
    ret_addr_counts: RwLock<HashMap<u64, AtomicU64>>,
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTracker {
    /// Creates a tracker with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            call_counts: core::array::from_fn(|_| AtomicU64::new(0)),
            ret_addr_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the occurrence index of this call to `function` and counts it.
    #[inline]
    pub fn increment_call_count(&self, function: Function) -> u64 {
        self.call_counts[function.index()].fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the occurrence index of this call at `ret_addr` and counts it.
    pub fn increment_retaddr_count(&self, ret_addr: u64) -> u64 {
        {
            let counts = self
                .ret_addr_counts
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(count) = counts.get(&ret_addr) {
                return count.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut counts = self
            .ret_addr_counts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // someone else may have inserted it between the two locks
        counts
            .entry(ret_addr)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }

    /// Number of calls to `function` seen so far.
    #[must_use]
    pub fn call_count(&self, function: Function) -> u64 {
        self.call_counts[function.index()].load(Ordering::Relaxed)
    }

    /// Number of calls at `ret_addr` seen so far.
    #[must_use]
    pub fn retaddr_count(&self, ret_addr: u64) -> u64 {
        self.ret_addr_counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ret_addr)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// Number of distinct return addresses seen so far.
    #[must_use]
    pub fn retaddr_len(&self) -> usize {
        self.ret_addr_counts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
