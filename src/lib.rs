//! A wait-free universal construction for large objects.
//!
//! This crate takes any sequential data type with a copy operation and
//! turns it into a linearizable concurrent object whose operations complete
//! in a bounded number of steps, no matter how threads are scheduled. Hand
//! it a `T: Clone`, and [`Cx`] gives back an object on which any closure
//! over `&mut T` runs as one atomic, totally-ordered update, and any
//! closure over `&T` as a consistent read.
//!
//! The construction keeps a pool of replicas of the underlying object and a
//! shared log of pending mutations. An updater appends its operation to the
//! log, takes a free replica exclusively, rolls that replica forward
//! through the log (applying other threads' pending operations along the
//! way), and then publishes the replica as the one readers see. Every step
//! of that path is bounded: appending uses a helping protocol in which any
//! participant can finish any other's enqueue, and a stalled updater's
//! operation is applied by whoever passes it in the log. Readers take a
//! shared hold on the published replica and run in place; a reader that
//! keeps losing the hold to writers enqueues its read as if it were a
//! mutation and lets the helpers run it.
//!
//! # Trade-offs
//!
//! Few concurrency wins come for free, and this one is no exception:
//!
//!  - **Memory use**: the pool holds up to twice as many replicas as there
//!    are participating threads. For a large object that multiplier is the
//!    price of wait-freedom; size the participant count accordingly.
//!  - **Deterministic operations**: operations are replayed against several
//!    replicas, so they must be deterministic. An operation that consults
//!    the clock, randomness, or a randomized hash iteration order will make
//!    replicas diverge.
//!  - **Write cost**: every update may be applied once per replica that
//!    catches up past it, and a replica that has fallen too far behind is
//!    refreshed by deep-copying a peer.
//!
//! # Variants
//!
//! [`Cx`] is the plain construction. [`CxTimed`] additionally tracks how
//! long replica copies take and uses that estimate when a writer is looking
//! for a free replica slot, so that fast writers back off instead of
//! piling onto a slot whose owner is mid-copy of a huge object. The two
//! are interchangeable; `CxTimed` earns its keep once copies stop being
//! effectively instant.
//!
//! # Example
//!
//! ```rust
//! use cx::Cx;
//! use std::collections::BTreeSet;
//!
//! let set = Cx::<BTreeSet<u64>, bool>::new(BTreeSet::new(), 4);
//!
//! // each thread claims its own identity
//! let token = set.register().unwrap();
//!
//! assert!(set.apply_update(&token, |s| s.insert(7)));
//! assert!(set.apply_update(&token, |s| s.insert(9)));
//! assert!(set.apply_update(&token, |s| s.remove(&7)));
//! assert!(set.apply_read(&token, |s| s.contains(&9)));
//! assert!(!set.apply_read(&token, |s| s.contains(&7)));
//!
//! set.deregister(token);
//! ```
//!
//! Result values flow back through a single shared cell per operation, so
//! keep `R` small; word-sized results stay lock-free end to end.

#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]
#![allow(clippy::type_complexity)]

mod sync;

mod combined;
mod hazard;
mod indicator;
mod node;
mod ring;
mod trylock;

mod inner;
pub use crate::inner::{RegistryError, ThreadToken};

mod cx;
pub use crate::cx::Cx;

mod timed;
pub use crate::timed::CxTimed;
