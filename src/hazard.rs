//! Hazard pointers with object-reference counts.
//!
//! This is the classic per-thread slot table, with two extra gates on the
//! reclamation predicate that the mutation log needs. A retired node is
//! freed only when all three hold:
//!
//! 1. no thread's hazard slots reference it;
//! 2. its reference count is zero (no replica's head points at it);
//! 3. its `next` is self-linked, the marker set once the node has been
//!    passed by the published replica.
//!
//! Hazards alone do not protect against a replica whose owner is asleep
//! while its head still points at the node, and the reference count alone
//! does not protect a thread that is mid-traversal. The self-link also lets
//! log walks tell excised nodes from live ones.

use crate::sync::{AtomicPtr, Ordering};

use std::sync::Mutex;

use crossbeam_utils::CachePadded;

/// Per-thread hazard slots. Two for the enqueue (tail and tail's successor),
/// two rotated while walking the log, one for the thread's own submission.
pub(crate) const SLOT_TAIL: usize = 0;
pub(crate) const SLOT_TAIL_NEXT: usize = 1;
pub(crate) const SLOT_HEAD: usize = 2;
pub(crate) const SLOT_NEXT: usize = 3;
pub(crate) const SLOT_MY_NODE: usize = 4;
pub(crate) const NUM_SLOTS: usize = 5;

/// A node that lives in the mutation log and is reclaimed through this
/// registry.
pub(crate) trait LogNode: Sized {
    fn next_ptr(&self) -> &AtomicPtr<Self>;
    fn ref_count(&self) -> usize;
    fn ticket(&self) -> u64;

    /// A node whose `next` points at itself has been passed by the published
    /// replica and excised from the log.
    fn is_unlinked(&self) -> bool {
        let me = self as *const Self as *mut Self;
        self.next_ptr().load(Ordering::Acquire) == me
    }
}

pub(crate) struct HazardPointers<N> {
    slots: Box<[CachePadded<[AtomicPtr<N>; NUM_SLOTS]>]>,
    retired: Box<[CachePadded<Mutex<Vec<*mut N>>>]>,
}

unsafe impl<N: Send + Sync> Send for HazardPointers<N> {}
unsafe impl<N: Send + Sync> Sync for HazardPointers<N> {}

impl<N: LogNode> HazardPointers<N> {
    pub(crate) fn new(max_threads: usize) -> Self {
        let slots = (0..max_threads)
            .map(|_| CachePadded::new(std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut()))))
            .collect();
        let retired = (0..max_threads)
            .map(|_| CachePadded::new(Mutex::new(Vec::new())))
            .collect();
        Self { slots, retired }
    }

    /// Publish `ptr` in the given slot and hand it back.
    pub(crate) fn protect_ptr(&self, slot: usize, ptr: *mut N, tid: usize) -> *mut N {
        self.slots[tid][slot].store(ptr, Ordering::SeqCst);
        ptr
    }

    /// Like `protect_ptr` for pointers that only need to be ordered after
    /// the stores that made them reachable.
    pub(crate) fn protect_ptr_release(&self, slot: usize, ptr: *mut N, tid: usize) -> *mut N {
        self.slots[tid][slot].store(ptr, Ordering::Release);
        ptr
    }

    pub(crate) fn clear(&self, tid: usize) {
        for slot in self.slots[tid].iter() {
            slot.store(std::ptr::null_mut(), Ordering::Release);
        }
    }

    fn is_protected(&self, ptr: *mut N) -> bool {
        self.slots
            .iter()
            .any(|slots| slots.iter().any(|slot| slot.load(Ordering::SeqCst) == ptr))
    }

    /// Stage `ptr` for reclamation and sweep this thread's retired list,
    /// freeing every node that passes the tri-condition predicate.
    pub(crate) fn retire(&self, ptr: *mut N, tid: usize) {
        let mut retired = self.retired[tid].lock().unwrap();
        retired.push(ptr);
        let mut i = 0;
        while i < retired.len() {
            let candidate = retired[i];
            let node = unsafe { &*candidate };
            if node.is_unlinked() && node.ref_count() == 0 && !self.is_protected(candidate) {
                retired.swap_remove(i);
                drop(unsafe { Box::from_raw(candidate) });
            } else {
                i += 1;
            }
        }
    }

    /// Take every pointer still staged for reclamation. Used at teardown,
    /// when no participant can still be traversing.
    pub(crate) fn drain_retired(&self) -> Vec<*mut N> {
        let mut all = Vec::new();
        for retired in self.retired.iter() {
            all.append(&mut retired.lock().unwrap());
        }
        all
    }
}

impl<N> Drop for HazardPointers<N> {
    fn drop(&mut self) {
        for retired in self.retired.iter() {
            for &node in retired.lock().unwrap().iter() {
                drop(unsafe { Box::from_raw(node) });
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    use crate::sync::{AtomicPtr, AtomicU64, AtomicUsize};

    struct TestNode {
        next: AtomicPtr<TestNode>,
        refcnt: AtomicUsize,
        ticket: AtomicU64,
    }

    impl TestNode {
        fn boxed() -> *mut TestNode {
            Box::into_raw(Box::new(TestNode {
                next: AtomicPtr::new(std::ptr::null_mut()),
                refcnt: AtomicUsize::new(0),
                ticket: AtomicU64::new(0),
            }))
        }
    }

    impl LogNode for TestNode {
        fn next_ptr(&self) -> &AtomicPtr<Self> {
            &self.next
        }
        fn ref_count(&self) -> usize {
            self.refcnt.load(Ordering::SeqCst)
        }
        fn ticket(&self) -> u64 {
            self.ticket.load(Ordering::SeqCst)
        }
    }

    fn unlink(node: *mut TestNode) {
        unsafe { (*node).next.store(node, Ordering::SeqCst) };
    }

    #[test]
    fn unlinked_unreferenced_node_is_freed() {
        let hp = HazardPointers::new(1);
        let node = TestNode::boxed();
        unlink(node);
        hp.retire(node, 0);
        assert!(hp.drain_retired().is_empty());
    }

    #[test]
    fn linked_node_survives() {
        let hp = HazardPointers::new(1);
        let node = TestNode::boxed();
        hp.retire(node, 0);
        let left = hp.drain_retired();
        assert_eq!(left, vec![node]);
        drop(unsafe { Box::from_raw(node) });
    }

    #[test]
    fn referenced_node_survives() {
        let hp = HazardPointers::new(1);
        let node = TestNode::boxed();
        unsafe { (*node).refcnt.store(1, Ordering::SeqCst) };
        unlink(node);
        hp.retire(node, 0);
        let left = hp.drain_retired();
        assert_eq!(left, vec![node]);
        drop(unsafe { Box::from_raw(node) });
    }

    #[test]
    fn protected_node_survives_until_cleared() {
        let hp = HazardPointers::new(2);
        let node = TestNode::boxed();
        unlink(node);
        hp.protect_ptr(SLOT_HEAD, node, 1);
        hp.retire(node, 0);
        {
            let retired = hp.retired[0].lock().unwrap();
            assert_eq!(*retired, vec![node]);
        }
        hp.clear(1);
        // the next sweep may free it
        let trigger = TestNode::boxed();
        hp.retire(trigger, 0);
        let left = hp.drain_retired();
        assert_eq!(left, vec![trigger]);
        drop(unsafe { Box::from_raw(trigger) });
    }
}
