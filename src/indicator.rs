//! Per-thread read indicator.
//!
//! Each participant owns one cache-padded slot that it flips between
//! `NOT_READING` and `READING`. A writer that wants exclusivity scans the
//! whole table; a writer that has just acquired exclusivity bumps every
//! `READING` slot to `READING + 1` so that a reader racing its own rollback
//! can tell that the writer has already counted it.

use crate::sync::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

const NOT_READING: u64 = 0;
const READING: u64 = 1;

pub(crate) struct ReadIndicator {
    states: Box<[CachePadded<AtomicU64>]>,
}

impl ReadIndicator {
    pub(crate) fn new(max_threads: usize) -> Self {
        let states = (0..max_threads)
            .map(|_| CachePadded::new(AtomicU64::new(NOT_READING)))
            .collect();
        Self { states }
    }

    pub(crate) fn arrive(&self, tid: usize) {
        self.states[tid].store(READING, Ordering::SeqCst);
    }

    pub(crate) fn depart(&self, tid: usize) {
        // must stay seq_cst: a release store here can overlap a writer's
        // forced invalidation and underflow the slot on rollback
        self.states[tid].store(NOT_READING, Ordering::SeqCst);
    }

    /// Undo an `arrive`. Returns `false` if a writer already invalidated the
    /// slot, in which case the arrive still stands and the caller holds a
    /// valid shared entry.
    pub(crate) fn rollback_arrive(&self, tid: usize) -> bool {
        self.states[tid].fetch_sub(1, Ordering::SeqCst) == READING
    }

    /// Invalidate every in-flight `READING` slot so concurrent rollbacks
    /// observe the writer and report the arrive as still standing.
    pub(crate) fn abort_rollback(&self) {
        for state in self.states.iter() {
            if state.load(Ordering::SeqCst) != READING {
                continue;
            }
            let _ = state.compare_exchange(
                READING,
                READING + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.states
            .iter()
            .all(|state| state.load(Ordering::SeqCst) == NOT_READING)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn arrive_depart() {
        let ri = ReadIndicator::new(4);
        assert!(ri.is_empty());
        ri.arrive(2);
        assert!(!ri.is_empty());
        ri.depart(2);
        assert!(ri.is_empty());
    }

    #[test]
    fn rollback_without_writer() {
        let ri = ReadIndicator::new(2);
        ri.arrive(0);
        assert!(ri.rollback_arrive(0));
        assert!(ri.is_empty());
    }

    #[test]
    fn rollback_after_invalidation_stands() {
        let ri = ReadIndicator::new(2);
        ri.arrive(1);
        ri.abort_rollback();
        // the writer got there first; the arrive is still visible
        assert!(!ri.rollback_arrive(1));
        assert!(!ri.is_empty());
        ri.depart(1);
        assert!(ri.is_empty());
    }

    #[test]
    fn abort_rollback_skips_idle_slots() {
        let ri = ReadIndicator::new(3);
        ri.arrive(0);
        ri.abort_rollback();
        ri.depart(0);
        assert!(ri.is_empty());
    }
}
