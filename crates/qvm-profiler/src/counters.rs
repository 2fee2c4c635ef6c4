//! Call counters indexed by instruction.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Call counters for one module, one slot per instruction index.
///
/// Only procedure entries are ever incremented; other slots stay zero.
pub struct CallProfile {
    counts: Box<[AtomicU64]>,
}

/// Snapshot of the nonzero counters (for reporting)
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallProfileSnapshot {
    /// `(instruction index, calls)` pairs in ascending index order
    pub counts: Vec<(usize, u64)>,
    /// Sum of all counters
    pub total: u64,
}

impl CallProfile {
    /// Create counters for a program of `len` instructions
    pub fn new(len: usize) -> Self {
        Self {
            counts: (0..len).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Record one call into the procedure starting at `pc`
    #[inline]
    pub fn record(&self, pc: usize) {
        if let Some(slot) = self.counts.get(pc) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Calls recorded at `pc`
    pub fn count(&self, pc: usize) -> u64 {
        self.counts
            .get(pc)
            .map_or(0, |slot| slot.load(Ordering::Relaxed))
    }

    /// Number of instruction slots
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Whether there are no slots
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Take a snapshot of current counters
    pub fn snapshot(&self) -> CallProfileSnapshot {
        let mut snapshot = CallProfileSnapshot::default();
        for (pc, slot) in self.counts.iter().enumerate() {
            let count = slot.load(Ordering::Relaxed);
            if count > 0 {
                snapshot.counts.push((pc, count));
                snapshot.total += count;
            }
        }
        snapshot
    }

    /// Reset all counters
    pub fn reset(&self) {
        for slot in self.counts.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}
