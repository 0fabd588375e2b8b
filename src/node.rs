//! Mutation-log nodes.

use crate::hazard::LogNode;
use crate::sync::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::atomic::AtomicCell;

/// An operation staged in the log. Helpers may apply it to several replicas
/// concurrently, so it only gets shared access to itself.
pub(crate) type Mutation<T, R> = Box<dyn Fn(&mut T) -> R + Send + Sync>;

/// One submitted operation.
///
/// `result` is a racy cell: every helper that applies the operation stores
/// the value it produced, and determinism guarantees they all store the same
/// one. `next` starts null, is linked exactly once, and is set to self
/// exactly once when the node is excised from the log. `refcnt` counts the
/// replica heads currently at this node.
pub(crate) struct Node<T, R> {
    mutation: Mutation<T, R>,
    pub(crate) result: AtomicCell<R>,
    pub(crate) done: AtomicBool,
    pub(crate) next: AtomicPtr<Node<T, R>>,
    pub(crate) ticket: AtomicU64,
    pub(crate) refcnt: AtomicUsize,
    pub(crate) enq_tid: usize,
}

impl<T, R: Default> Node<T, R> {
    pub(crate) fn new(mutation: Mutation<T, R>, enq_tid: usize) -> Self {
        Self {
            mutation,
            result: AtomicCell::new(R::default()),
            done: AtomicBool::new(false),
            next: AtomicPtr::new(std::ptr::null_mut()),
            ticket: AtomicU64::new(0),
            refcnt: AtomicUsize::new(0),
            enq_tid,
        }
    }
}

impl<T, R> Node<T, R> {
    pub(crate) fn apply(&self, obj: &mut T) -> R {
        (self.mutation)(obj)
    }
}

impl<T, R> LogNode for Node<T, R> {
    fn next_ptr(&self) -> &AtomicPtr<Self> {
        &self.next
    }

    fn ref_count(&self) -> usize {
        self.refcnt.load(Ordering::SeqCst)
    }

    fn ticket(&self) -> u64 {
        self.ticket.load(Ordering::Relaxed)
    }
}
