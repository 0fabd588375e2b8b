//! A reader/writer try-lock whose trylock calls never fail spuriously.
//!
//! The lock word packs a 62-bit sequence number and a 2-bit state so every
//! transition is a single compare-and-swap. The four states:
//!
//! - `IDLE`: nobody holds the lock; shared or exclusive may enter.
//! - `HELPER`: an aspiring writer announced intent; a reader may still take
//!   the lock out from under it and force it to retry.
//! - `WRITER`: exclusive hold granted; shared holders have drained.
//! - `DRAIN`: a finished writer downgraded; readers enter freely, but no new
//!   writer may acquire until the state returns to `IDLE`.
//!
//! Transitions:
//!
//! - `(s, IDLE)   -> (s+1, HELPER)`: writer announces.
//! - `(s, HELPER) -> (s,   WRITER)`: writer confirms, read indicator empty.
//! - `(s, HELPER) -> (s,   IDLE)`:   a reader captures the lock instead.
//! - `(s, WRITER) -> (s,   DRAIN)`:  downgrade.
//! - `(s, DRAIN)  -> (s,   IDLE)`:   full release.
//!
//! "Strong" means a failed trylock tells the caller definitively that some
//! other participant holds the lock, never that it merely lost a race. The
//! construction above needs that: a writer that fails to acquire a replica
//! slot may conclude the slot is busy and move on.

use crate::indicator::ReadIndicator;
use crate::sync::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

const IDLE: u64 = 0;
const HELPER: u64 = 1;
const DRAIN: u64 = 2;
const WRITER: u64 = 3;

const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = (1 << STATE_BITS) - 1;

fn pack(seq: u64, state: u64) -> u64 {
    (seq << STATE_BITS) | state
}

fn state_of(word: u64) -> u64 {
    word & STATE_MASK
}

fn seq_of(word: u64) -> u64 {
    word >> STATE_BITS
}

pub(crate) struct StrongTryRwLock {
    ri: ReadIndicator,
    word: CachePadded<AtomicU64>,
}

impl StrongTryRwLock {
    pub(crate) fn new(max_threads: usize) -> Self {
        Self {
            ri: ReadIndicator::new(max_threads),
            word: CachePadded::new(AtomicU64::new(pack(0, IDLE))),
        }
    }

    /// Attempt a shared hold. Never fails spuriously: `false` means a writer
    /// holds the lock.
    pub(crate) fn shared_try_lock(&self, tid: usize) -> bool {
        if state_of(self.word.load(Ordering::SeqCst)) == WRITER {
            return false;
        }
        self.ri.arrive(tid);
        let w = self.word.load(Ordering::SeqCst);
        if state_of(w) == HELPER {
            // take the lock out from under the aspiring writer
            if self
                .word
                .compare_exchange(w, pack(seq_of(w), IDLE), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            let w = self.word.load(Ordering::SeqCst);
            return state_of(w) != WRITER || !self.ri.rollback_arrive(tid);
        }
        // if the rollback fails, the writer already counted our arrive and
        // the shared entry stands
        state_of(w) != WRITER || !self.ri.rollback_arrive(tid)
    }

    pub(crate) fn shared_unlock(&self, tid: usize) {
        self.ri.depart(tid);
    }

    /// Attempt an exclusive hold. Never fails spuriously.
    pub(crate) fn exclusive_try_lock(&self, _tid: usize) -> bool {
        let w = self.word.load(Ordering::SeqCst);
        if state_of(w) == WRITER || state_of(w) == DRAIN {
            return false;
        }
        if !self.ri.is_empty() {
            return false;
        }
        if state_of(w) == HELPER {
            if w != self.word.load(Ordering::SeqCst) {
                return false;
            }
            // another writer announced and bailed; confirm in its place
            return self
                .word
                .compare_exchange(w, pack(seq_of(w), WRITER), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
        }
        let next = pack(seq_of(w) + 1, HELPER);
        let _ = self
            .word
            .compare_exchange(w, next, Ordering::SeqCst, Ordering::SeqCst);
        if !self.ri.is_empty() {
            return false;
        }
        if self.word.load(Ordering::SeqCst) != next {
            return false;
        }
        self.word
            .compare_exchange(
                next,
                pack(seq_of(next), WRITER),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn exclusive_unlock(&self) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(pack(seq_of(w), DRAIN), Ordering::SeqCst);
        self.ri.abort_rollback();
        self.word.store(pack(seq_of(w), IDLE), Ordering::SeqCst);
    }

    /// Downgrade `WRITER` to `DRAIN`: readers may enter, writers may not.
    pub(crate) fn downgrade(&self) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(pack(seq_of(w), DRAIN), Ordering::SeqCst);
        self.ri.abort_rollback();
    }

    /// Force the lock into `DRAIN` without holding it. Only sound while the
    /// caller is the sole participant able to reach the lock, e.g. during
    /// construction.
    pub(crate) fn set_drain(&self) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(pack(seq_of(w), DRAIN), Ordering::SeqCst);
    }

    /// Release a `DRAIN` hold back to `IDLE`, making the lock acquirable by
    /// writers again.
    pub(crate) fn clear_drain(&self) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(pack(seq_of(w), IDLE), Ordering::SeqCst);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    use crossbeam_utils::thread::scope;

    use std::sync::atomic::{AtomicUsize, Ordering as O};

    #[test]
    fn exclusive_excludes_shared() {
        let lock = StrongTryRwLock::new(2);
        assert!(lock.exclusive_try_lock(0));
        assert!(!lock.shared_try_lock(1));
        lock.exclusive_unlock();
        assert!(lock.shared_try_lock(1));
        lock.shared_unlock(1);
    }

    #[test]
    fn shared_excludes_exclusive() {
        let lock = StrongTryRwLock::new(2);
        assert!(lock.shared_try_lock(0));
        assert!(!lock.exclusive_try_lock(1));
        lock.shared_unlock(0);
        assert!(lock.exclusive_try_lock(1));
        lock.exclusive_unlock();
    }

    #[test]
    fn shared_holds_stack() {
        let lock = StrongTryRwLock::new(3);
        assert!(lock.shared_try_lock(0));
        assert!(lock.shared_try_lock(1));
        assert!(!lock.exclusive_try_lock(2));
        lock.shared_unlock(0);
        assert!(!lock.exclusive_try_lock(2));
        lock.shared_unlock(1);
        assert!(lock.exclusive_try_lock(2));
        lock.exclusive_unlock();
    }

    #[test]
    fn downgrade_admits_readers_not_writers() {
        let lock = StrongTryRwLock::new(2);
        assert!(lock.exclusive_try_lock(0));
        lock.downgrade();
        assert!(lock.shared_try_lock(1));
        assert!(!lock.exclusive_try_lock(0));
        lock.shared_unlock(1);
        lock.clear_drain();
        assert!(lock.exclusive_try_lock(0));
        lock.exclusive_unlock();
    }

    #[test]
    fn hammered_exclusion() {
        const THREADS: usize = 4;
        const ITERS: usize = 20_000;

        let lock = StrongTryRwLock::new(THREADS);
        let writers = AtomicUsize::new(0);
        let readers = AtomicUsize::new(0);

        scope(|s| {
            for tid in 0..THREADS {
                let lock = &lock;
                let writers = &writers;
                let readers = &readers;
                s.spawn(move |_| {
                    for i in 0..ITERS {
                        if (i + tid) % 2 == 0 {
                            if lock.exclusive_try_lock(tid) {
                                assert_eq!(readers.load(O::SeqCst), 0);
                                assert_eq!(writers.fetch_add(1, O::SeqCst), 0);
                                writers.fetch_sub(1, O::SeqCst);
                                lock.exclusive_unlock();
                            }
                        } else if lock.shared_try_lock(tid) {
                            readers.fetch_add(1, O::SeqCst);
                            assert_eq!(writers.load(O::SeqCst), 0);
                            readers.fetch_sub(1, O::SeqCst);
                            lock.shared_unlock(tid);
                        }
                    }
                });
            }
        })
        .unwrap();
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;

    use loom::sync::atomic::{AtomicUsize, Ordering as O};
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn writers_exclude_each_other() {
        loom::model(|| {
            let lock = Arc::new(StrongTryRwLock::new(2));
            let wins = Arc::new(AtomicUsize::new(0));

            let l = Arc::clone(&lock);
            let w = Arc::clone(&wins);
            let t = thread::spawn(move || {
                if l.exclusive_try_lock(0) {
                    w.fetch_add(1, O::SeqCst);
                }
            });
            if lock.exclusive_try_lock(1) {
                wins.fetch_add(1, O::SeqCst);
            }
            t.join().unwrap();

            assert!(wins.load(O::SeqCst) <= 1);
        });
    }

    #[test]
    fn reader_never_overlaps_writer() {
        loom::model(|| {
            let lock = Arc::new(StrongTryRwLock::new(2));
            let in_write = Arc::new(AtomicUsize::new(0));

            let l = Arc::clone(&lock);
            let w = Arc::clone(&in_write);
            let t = thread::spawn(move || {
                if l.exclusive_try_lock(0) {
                    w.store(1, O::SeqCst);
                    w.store(0, O::SeqCst);
                    l.exclusive_unlock();
                }
            });
            if lock.shared_try_lock(1) {
                assert_eq!(in_write.load(O::SeqCst), 0);
                lock.shared_unlock(1);
            }
            t.join().unwrap();
        });
    }
}
