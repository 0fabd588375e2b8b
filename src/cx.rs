//! The wait-free construction.

use crate::combined::Combined;
use crate::hazard::{SLOT_HEAD, SLOT_MY_NODE, SLOT_NEXT};
use crate::inner::{AbortOnPanic, Inner, RegistryError, ThreadToken};
use crate::node::Node;
use crate::sync::Ordering;

use std::fmt;

/// A wait-free universal construction.
///
/// `Cx` turns any sequential object `T` into a linearizable concurrent one.
/// Updates go through [`apply_update`](Cx::apply_update), which appends the
/// operation to a shared mutation log and applies the log to one of a pool
/// of replicas; reads go through [`apply_read`](Cx::apply_read), which in
/// the common case runs directly against the published replica. Both
/// complete within a number of steps bounded by the participant count,
/// regardless of scheduling: a participant that cannot make progress on its
/// own operation helps whoever is in its way, and a participant that stalls
/// has its operation finished by someone else.
///
/// `R` is the operation result type and must behave like a small value: it
/// is kept in a single racy cell that every helper that applies the
/// operation stores into. Word-sized results stay lock-free.
///
/// Operations must be deterministic. The same operation is replayed against
/// several replicas, and replicas are copied from one another; an operation
/// that consults outside state (time, randomness, iteration order of a
/// randomized hasher) will make the replicas drift apart.
pub struct Cx<T, R = bool> {
    pub(crate) inner: Inner<T, R>,
}

impl<T, R> fmt::Debug for Cx<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("max_threads", &self.inner.max_threads)
            .field("replicas", &self.inner.combs.len())
            .finish()
    }
}

impl<T, R> Cx<T, R>
where
    T: Clone + Send + Sync,
    R: Copy + Default + Send,
{
    /// Construct over `initial`, for up to `max_threads` concurrent
    /// participants. Additional replicas are seeded by cloning `initial`.
    pub fn new(initial: T, max_threads: usize) -> Self {
        Self {
            inner: Inner::new(initial, max_threads),
        }
    }

    /// Claim a participant identifier. At most `max_threads` tokens are
    /// live at any moment; each must be used by one thread at a time.
    pub fn register(&self) -> Result<ThreadToken, RegistryError> {
        self.inner.register()
    }

    /// Return a participant identifier for reuse by another thread. The
    /// caller must have no operation in flight under this token.
    pub fn deregister(&self, token: ThreadToken) {
        self.inner.deregister(token)
    }

    /// Apply `op` to the object and return its result.
    ///
    /// The operation is appended to the mutation log and becomes visible
    /// atomically; concurrent readers observe either all of it or none of
    /// it. The call may apply other participants' pending operations on the
    /// way to its own, and its own operation may equally be applied by a
    /// helper. Completes within `O(max_threads)` steps.
    ///
    /// If `op` panics the process aborts: the replica it was mutating can
    /// no longer be trusted, and the operation would be re-applied to
    /// future copies.
    pub fn apply_update<F>(&self, token: &ThreadToken, op: F) -> R
    where
        F: Fn(&mut T) -> R + Send + Sync + 'static,
    {
        self.inner.check(token);
        let tid = token.tid;
        let _guard = AbortOnPanic;
        let my_node: *mut Node<T, R> = Box::into_raw(Box::new(Node::new(Box::new(op), tid)));
        self.inner
            .hazards
            .protect_ptr_release(SLOT_MY_NODE, my_node, tid);
        self.inner.enqueue(my_node, tid);
        let my_ticket = unsafe { (*my_node).ticket.load(Ordering::Acquire) };

        // a pool of twice the participant count always has a free slot
        let mut new_comb = None;
        for comb in self.inner.combs.iter() {
            if comb.lock.exclusive_try_lock(tid) {
                new_comb = Some(comb);
                break;
            }
        }
        let new_comb = match new_comb {
            Some(comb) => comb,
            None => {
                log::error!(
                    "no exclusive replica available ({} slots, {} participants)",
                    self.inner.combs.len(),
                    self.inner.max_threads
                );
                panic!("replica pool exhausted");
            }
        };

        let result = unsafe { self.drive(new_comb, my_node, my_ticket, tid) };
        self.inner.hazards.clear(tid);
        result
    }

    /// Apply every pending log operation to `new_comb`'s replica, up to and
    /// including our own, then publish.
    unsafe fn drive(
        &self,
        new_comb: &Combined<T, R>,
        my_node: *mut Node<T, R>,
        my_ticket: u64,
        tid: usize,
    ) -> R {
        let inner = &self.inner;
        let mut mn = new_comb.head();
        if !mn.is_null() && (*mn).ticket.load(Ordering::Acquire) >= my_ticket {
            // this replica already covers our ticket; a helper finished us
            new_comb.lock.exclusive_unlock();
            return (*my_node).result.load();
        }
        let mut copied = false;
        while mn != my_node {
            if mn.is_null() || mn == (*mn).next.load(Ordering::Acquire) {
                // our replica's view of the log was excised under it (or the
                // slot was never seeded); re-seed from the published replica
                let peer = if copied {
                    None
                } else {
                    inner.get_combined(my_ticket, tid)
                };
                let peer = match peer {
                    Some(peer) => peer,
                    None => {
                        if !mn.is_null() {
                            new_comb.update_head(mn);
                        }
                        new_comb.lock.exclusive_unlock();
                        return (*my_node).result.load();
                    }
                };
                mn = peer.head();
                // neither the peer's replica nor its head can move while we
                // hold it shared
                new_comb.update_head(mn);
                #[cfg(test)]
                inner
                    .replica_copies
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                new_comb.install_object(Box::new(peer.object().clone()));
                peer.lock.shared_unlock(tid);
                copied = true;
                continue;
            }
            let lnext = inner
                .hazards
                .protect_ptr(SLOT_HEAD, (*mn).next.load(Ordering::Acquire), tid);
            // re-validate after the protecting store; the successor only
            // ever changes to the self-link
            if mn == (*mn).next.load(Ordering::SeqCst) {
                continue;
            }
            let value = (*lnext).apply(new_comb.object_mut());
            (*lnext).result.store(value);
            inner.hazards.protect_ptr_release(SLOT_NEXT, lnext, tid);
            mn = lnext;
        }
        new_comb.update_head(mn);
        new_comb.lock.downgrade();
        inner.publish(new_comb, mn, my_ticket, tid);
        (*my_node).result.load()
    }

    /// Run `read` against the object and return its result.
    ///
    /// Nearly always completes on the fast path: a shared hold on the
    /// published replica, with `read` run in place. Only when contention
    /// repeatedly denies the shared hold is the read enqueued as if it were
    /// a mutation, at which point mutators help it exactly as they help
    /// each other. `read` must be side-effect-free and deterministic; it
    /// may run several times, against different replicas.
    pub fn apply_read<F>(&self, token: &ThreadToken, read: F) -> R
    where
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        self.inner.apply_read(token, read)
    }
}
