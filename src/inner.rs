//! Machinery shared by the plain and timed constructions: the ticketed
//! mutation log, the replica pool, the publish protocol, the read path, and
//! participant registration.
//!
//! The log is a singly-linked list behind a sentinel. Linking is the
//! Turn-queue enqueue: a submitter publishes its node in a per-thread
//! request slot, and every participant helps complete the three steps
//! (link into `tail.next`, assign the ticket, advance `tail`) so that any
//! submitter finishes within a bounded number of iterations. The node's
//! ticket is the position of the operation in the linearization order.

use crate::combined::Combined;
use crate::hazard::{HazardPointers, SLOT_MY_NODE, SLOT_TAIL, SLOT_TAIL_NEXT};
use crate::node::{Mutation, Node};
use crate::ring::RetireRing;
use crate::sync::{AtomicPtr, Ordering};

use std::collections::HashSet;
use std::ptr;
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;
use slab::Slab;

/// Failed shared acquisitions a reader tolerates before enqueueing its
/// operation as if it were a mutation.
pub(crate) const MAX_READ_TRIES: usize = 10;

static NEXT_INSTANCE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// The error returned when registration would exceed the participant count
/// fixed at construction.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Every participant identifier is currently live.
    #[error("participant registry is full ({max_threads} identifiers live)")]
    Full {
        /// The participant count the construction was built with.
        max_threads: usize,
    },
}

/// A registered participant identity.
///
/// Every operation takes a token, and the token pins the unique identifier
/// the calling thread operates under. A token is bound to the construction
/// that issued it; presenting it to another instance panics. The identifier
/// is recycled once the token is passed back to
/// [`deregister`](crate::Cx::deregister).
#[derive(Debug)]
pub struct ThreadToken {
    pub(crate) tid: usize,
    pub(crate) instance: u64,
}

impl ThreadToken {
    /// The participant identifier this token pins, in `[0, max_threads)`.
    pub fn id(&self) -> usize {
        self.tid
    }
}

/// Aborts the process if dropped while panicking. A user closure that
/// panics leaves its replica in a state that would be re-applied to future
/// copies, so the process cannot be allowed to continue.
pub(crate) struct AbortOnPanic;

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if std::thread::panicking() {
            std::process::abort();
        }
    }
}

pub(crate) struct Inner<T, R> {
    pub(crate) max_threads: usize,
    instance: u64,
    pub(crate) current: CachePadded<AtomicPtr<Combined<T, R>>>,
    tail: CachePadded<AtomicPtr<Node<T, R>>>,
    sentinel: *mut Node<T, R>,
    pub(crate) combs: Box<[Combined<T, R>]>,
    enqueuers: Box<[CachePadded<AtomicPtr<Node<T, R>>>]>,
    pub(crate) hazards: HazardPointers<Node<T, R>>,
    rings: Box<[Mutex<RetireRing<Node<T, R>>>]>,
    registry: Mutex<Slab<()>>,
    #[cfg(test)]
    pub(crate) read_escalations: std::sync::atomic::AtomicU64,
    #[cfg(test)]
    pub(crate) replica_copies: std::sync::atomic::AtomicU64,
}

unsafe impl<T: Send + Sync, R: Send> Send for Inner<T, R> {}
unsafe impl<T: Send + Sync, R: Send> Sync for Inner<T, R> {}

impl<T, R> Inner<T, R>
where
    T: Clone + Send + Sync,
    R: Copy + Default + Send,
{
    pub(crate) fn new(initial: T, max_threads: usize) -> Self {
        assert!(max_threads >= 1, "need at least one participant");
        let sentinel: *mut Node<T, R> =
            Box::into_raw(Box::new(Node::new(Box::new(|_: &mut T| R::default()), 0)));

        // twice the participant count guarantees an exclusive slot under
        // worst-case concurrency
        let mut combs: Vec<Combined<T, R>> = (0..2 * max_threads)
            .map(|_| Combined::new(max_threads))
            .collect();

        let seeded = if max_threads >= 2 { 4 } else { 2 };
        let first = Box::new(initial);
        for comb in combs.iter_mut().take(seeded).skip(1) {
            comb.seed(sentinel, Box::new((*first).clone()));
        }
        combs[0].seed(sentinel, first);
        unsafe { (*sentinel).refcnt.store(seeded, Ordering::Relaxed) };

        // the published slot starts out in the drain state so no writer can
        // take it exclusive while it is current
        combs[0].lock.set_drain();
        let combs = combs.into_boxed_slice();
        let current = &combs[0] as *const Combined<T, R> as *mut Combined<T, R>;

        Self {
            max_threads,
            instance: NEXT_INSTANCE.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            current: CachePadded::new(AtomicPtr::new(current)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            sentinel,
            combs,
            enqueuers: (0..max_threads)
                .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
                .collect(),
            hazards: HazardPointers::new(max_threads),
            rings: (0..max_threads)
                .map(|_| Mutex::new(RetireRing::new()))
                .collect(),
            registry: Mutex::new(Slab::new()),
            #[cfg(test)]
            read_escalations: std::sync::atomic::AtomicU64::new(0),
            #[cfg(test)]
            replica_copies: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub(crate) fn register(&self) -> Result<ThreadToken, RegistryError> {
        let mut registry = self.registry.lock().unwrap();
        if registry.len() == self.max_threads {
            return Err(RegistryError::Full {
                max_threads: self.max_threads,
            });
        }
        let tid = registry.insert(());
        debug_assert!(tid < self.max_threads);
        Ok(ThreadToken {
            tid,
            instance: self.instance,
        })
    }

    pub(crate) fn deregister(&self, token: ThreadToken) {
        self.check(&token);
        self.hazards.clear(token.tid);
        self.registry.lock().unwrap().remove(token.tid);
    }

    pub(crate) fn check(&self, token: &ThreadToken) {
        assert!(
            token.instance == self.instance,
            "thread token presented to a construction that did not issue it"
        );
    }

    /// Link `my_node` into the log. Completes within `max_threads`
    /// iterations: every participant helps finish whatever step the current
    /// tail is stuck on, so either a helper links our node or the tail has
    /// advanced `max_threads` positions, which already implies it.
    pub(crate) fn enqueue(&self, my_node: *mut Node<T, R>, tid: usize) {
        self.enqueuers[tid].store(my_node, Ordering::SeqCst);
        for _ in 0..self.max_threads {
            if self.enqueuers[tid].load(Ordering::SeqCst).is_null() {
                return; // a helper completed every step
            }
            let ltail = self
                .hazards
                .protect_ptr(SLOT_TAIL, self.tail.load(Ordering::SeqCst), tid);
            if ltail != self.tail.load(Ordering::SeqCst) {
                continue;
            }
            let owner = unsafe { (*ltail).enq_tid };
            if self.enqueuers[owner].load(Ordering::SeqCst) == ltail {
                // the tail's submitter has not cleared its request yet
                let _ = self.enqueuers[owner].compare_exchange(
                    ltail,
                    ptr::null_mut(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
            // link somebody's pending node, scanning round-robin from one
            // past the tail owner's slot
            for j in 1..=self.max_threads {
                let candidate =
                    self.enqueuers[(j + owner) % self.max_threads].load(Ordering::SeqCst);
                if candidate.is_null() {
                    continue;
                }
                let _ = unsafe {
                    (*ltail).next.compare_exchange(
                        ptr::null_mut(),
                        candidate,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                };
                break;
            }
            let lnext = unsafe { (*ltail).next.load(Ordering::Acquire) };
            if !lnext.is_null() {
                self.hazards.protect_ptr(SLOT_TAIL_NEXT, lnext, tid);
                if ltail != self.tail.load(Ordering::SeqCst) {
                    continue;
                }
                // every helper stores the same value; the link CAS above
                // orders the store
                unsafe {
                    (*lnext)
                        .ticket
                        .store((*ltail).ticket.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
                }
                let _ = self
                    .tail
                    .compare_exchange(ltail, lnext, Ordering::SeqCst, Ordering::SeqCst);
            }
        }
        self.enqueuers[tid].store(ptr::null_mut(), Ordering::Release);
    }

    /// Find a shared-held replica whose head is strictly behind `my_ticket`
    /// and still linked, to copy from. `None` means the published state has
    /// already passed `my_ticket` and the caller's operation is complete.
    pub(crate) fn get_combined(&self, my_ticket: u64, tid: usize) -> Option<&Combined<T, R>> {
        for _ in 0..self.max_threads {
            let lptr = self.current.load(Ordering::SeqCst);
            let lcomb = unsafe { &*lptr };
            if !lcomb.lock.shared_try_lock(tid) {
                continue;
            }
            let lhead = lcomb.head();
            let lticket = unsafe { (*lhead).ticket.load(Ordering::Acquire) };
            let unlinked = unsafe { (*lhead).next.load(Ordering::Acquire) == lhead };
            if lticket < my_ticket && !unlinked {
                return Some(lcomb);
            }
            lcomb.lock.shared_unlock(tid);
            // the head ticket may have been made visible by a replica that
            // is no longer current
            if lticket >= my_ticket && lptr == self.current.load(Ordering::SeqCst) {
                return None;
            }
        }
        None
    }

    /// Try to install `new_comb`, whose head `mn` covers `my_ticket`, as the
    /// published replica. Returns once the operation is visible through the
    /// published pointer, whether or not this call performed the install.
    ///
    /// # Safety
    ///
    /// `new_comb` must be held by the caller in the drain state with
    /// `new_comb.head() == mn`.
    pub(crate) unsafe fn publish(
        &self,
        new_comb: &Combined<T, R>,
        mn: *mut Node<T, R>,
        my_ticket: u64,
        tid: usize,
    ) {
        for _ in 0..self.max_threads {
            let lptr = self.current.load(Ordering::SeqCst);
            let lcomb = &*lptr;
            if !lcomb.lock.shared_try_lock(tid) {
                continue;
            }
            if (*lcomb.head()).ticket.load(Ordering::Acquire) >= my_ticket {
                lcomb.lock.shared_unlock(tid);
                if lptr != self.current.load(Ordering::SeqCst) {
                    continue;
                }
                break;
            }
            let new_ptr = new_comb as *const Combined<T, R> as *mut Combined<T, R>;
            if self
                .current
                .compare_exchange(lptr, new_ptr, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                // the old replica may be taken exclusive again
                lcomb.lock.clear_drain();
                let mut node = lcomb.head();
                lcomb.lock.shared_unlock(tid);
                // stage every node we passed; `mn` itself stays live as the
                // published head
                let mut ring = self.rings[tid].lock().unwrap();
                while node != mn {
                    (*node).done.store(true, Ordering::Relaxed);
                    let lnext = (*node).next.load(Ordering::Acquire);
                    ring.add(node, &self.hazards, tid);
                    node = lnext;
                }
                return;
            }
            lcomb.lock.shared_unlock(tid);
        }
        // somebody else published past us; release our hold
        new_comb.lock.clear_drain();
    }

    pub(crate) fn apply_read<F>(&self, token: &ThreadToken, read: F) -> R
    where
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        self.check(token);
        let tid = token.tid;
        let _guard = AbortOnPanic;
        let mut direct = Some(read);
        let mut shared: Option<Arc<F>> = None;
        let mut my_node: *mut Node<T, R> = ptr::null_mut();
        for i in 0..(MAX_READ_TRIES + self.max_threads) {
            let lptr = self.current.load(Ordering::SeqCst);
            if i == MAX_READ_TRIES {
                // contention keeps denying us a shared hold; enqueue the
                // read as a mutation and let helpers run it
                #[cfg(test)]
                self.read_escalations
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let f = Arc::new(direct.take().expect("escalation happens at most once"));
                shared = Some(Arc::clone(&f));
                let mutation: Mutation<T, R> = Box::new(move |obj: &mut T| (*f)(&*obj));
                my_node = Box::into_raw(Box::new(Node::new(mutation, tid)));
                self.hazards.protect_ptr(SLOT_MY_NODE, my_node, tid);
                self.enqueue(my_node, tid);
            }
            let lcomb = unsafe { &*lptr };
            if lcomb.lock.shared_try_lock(tid) {
                if lptr == self.current.load(Ordering::SeqCst) {
                    let obj = unsafe { lcomb.object() };
                    let ret = match &direct {
                        Some(f) => f(obj),
                        None => (**shared.as_ref().expect("set at escalation"))(obj),
                    };
                    lcomb.lock.shared_unlock(tid);
                    if !my_node.is_null() {
                        self.hazards.clear(tid);
                    }
                    return ret;
                }
                lcomb.lock.shared_unlock(tid);
            }
        }
        // bounded helping has run our node by now
        let ret = unsafe { (*my_node).result.load() };
        self.hazards.clear(tid);
        ret
    }
}

impl<T, R> Drop for Inner<T, R> {
    fn drop(&mut self) {
        // no participant can still be inside an operation here, so every
        // unreclaimed node is staged in a ring, staged in a retired list,
        // the sentinel, or reachable from the published head onward (nodes
        // the published pointer never passed keep their links intact)
        let mut nodes: HashSet<*mut Node<T, R>> = HashSet::new();
        for ring in self.rings.iter() {
            for node in ring.lock().unwrap().drain() {
                nodes.insert(node);
                // a staged node's successor may have been excised out of
                // another ring without ever reaching a retired list; one
                // link from each staged node covers exactly those
                let next = unsafe { (*node).next.load(Ordering::Acquire) };
                if !next.is_null() && next != node {
                    nodes.insert(next);
                }
            }
        }
        for node in self.hazards.drain_retired() {
            nodes.insert(node);
        }
        nodes.insert(self.sentinel);
        let current = self.current.load(Ordering::Acquire);
        let mut node = unsafe { (*current).head() };
        while !node.is_null() {
            nodes.insert(node);
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            if next == node {
                break;
            }
            node = next;
        }
        for node in nodes {
            drop(unsafe { Box::from_raw(node) });
        }
    }
}
