//! Replica containers.
//!
//! A `Combined` pairs one replica of the underlying object with a head
//! pointer into the mutation log, guarded by the strong try-lock. Whenever
//! `head` is observed under a hold, the replica reflects the application of
//! every log node from the start through `head` inclusive.

use crate::node::Node;
use crate::sync::{AtomicBool, AtomicPtr, Ordering};
use crate::trylock::StrongTryRwLock;

use std::cell::UnsafeCell;

pub(crate) struct Combined<T, R> {
    head: AtomicPtr<Node<T, R>>,
    obj: UnsafeCell<Option<Box<T>>>,
    seeded: AtomicBool,
    pub(crate) lock: StrongTryRwLock,
}

// the object is reached only under the lock protocol: exclusively while
// WRITER is held, shared otherwise
unsafe impl<T: Send + Sync, R: Send> Sync for Combined<T, R> {}
unsafe impl<T: Send, R: Send> Send for Combined<T, R> {}

impl<T, R> Combined<T, R> {
    pub(crate) fn new(max_threads: usize) -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            obj: UnsafeCell::new(None),
            seeded: AtomicBool::new(false),
            lock: StrongTryRwLock::new(max_threads),
        }
    }

    /// Seed the replica during construction, before the pool is shared.
    pub(crate) fn seed(&mut self, head: *mut Node<T, R>, obj: Box<T>) {
        self.head.store(head, Ordering::Relaxed);
        *self.obj.get_mut() = Some(obj);
        self.seeded.store(true, Ordering::Relaxed);
    }

    pub(crate) fn head(&self) -> *mut Node<T, R> {
        self.head.load(Ordering::Acquire)
    }

    /// Whether this slot has ever held a replica. Racy by design; used only
    /// to steer acquisition away from slots that would force a copy.
    pub(crate) fn has_object(&self) -> bool {
        self.seeded.load(Ordering::Relaxed)
    }

    /// # Safety
    ///
    /// The caller must hold the lock in shared or exclusive mode, and the
    /// slot must have been seeded or copied into.
    pub(crate) unsafe fn object(&self) -> &T {
        (*self.obj.get())
            .as_deref()
            .expect("replica present while lock is held")
    }

    /// # Safety
    ///
    /// The caller must hold the lock in exclusive mode, and the slot must
    /// have been seeded or copied into.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn object_mut(&self) -> &mut T {
        (*self.obj.get())
            .as_deref_mut()
            .expect("replica present while exclusively held")
    }

    /// Replace the replica. The old one is dropped.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock in exclusive mode.
    pub(crate) unsafe fn install_object(&self, obj: Box<T>) {
        *self.obj.get() = Some(obj);
        self.seeded.store(true, Ordering::Relaxed);
    }

    /// Move the head to `node`, keeping the reference counts in step:
    /// `node` gains a referent before the old head loses one.
    ///
    /// # Safety
    ///
    /// The caller must hold the lock in exclusive mode and `node` must be
    /// protected by one of the caller's hazard slots.
    pub(crate) unsafe fn update_head(&self, node: *mut Node<T, R>) {
        (*node).refcnt.fetch_add(1, Ordering::SeqCst);
        let old = self.head.load(Ordering::Relaxed);
        if !old.is_null() {
            (*old).refcnt.fetch_sub(1, Ordering::SeqCst);
        }
        self.head.store(node, Ordering::Release);
    }
}
