//! A safe, opinionated implementation of Dice's and Kogan's [reciprocating
//! lock] for mutual exclusion.
//!
//! The reciprocating lock is a queue-based spinlock where arriving threads
//! push themselves onto an "arrival segment" with a single atomic exchange on
//! the lock's tail word, and then spin on a locally accessible field of their
//! own queue node. The main properties of this mechanism are:
//!
//! - spins on locally-accessible node fields only;
//! - requires a single word of space per lock and a single word per thread;
//! - uncontended acquisitions and releases take one atomic operation each;
//! - releases take at most two atomic read-modify-write operations, no matter
//!   how many threads arrived during the critical section; and
//! - queue nodes may live on the stack, since no thread ever dereferences a
//!   node once its owner has been admitted.
//!
//! Admission alternates between arrival segments: the threads that arrived
//! while the lock was held are admitted, one at a time, in reverse arrival
//! order, before any thread that arrives after the segment was detached. No
//! stronger ordering guarantee is made.
//!
//! ## Spinlock use cases
//!
//! It is noteworthy to mention that [spinlocks are usually not what you want].
//! The majority of use cases are well covered by OS-based mutexes like
//! [`std::sync::Mutex`], [`parking_lot::Mutex`]. These implementations will
//! notify the system that the waiting thread should be parked, freeing the
//! processor to work on something else.
//!
//! Spinlocks are only efficient in very few circunstances where the overhead
//! of context switching or process rescheduling are greater than busy waiting
//! for very short periods. Spinlocks can be useful inside operating-system
//! kernels, on embedded systems or even complement other locking designs.
//!
//! ## Locking with a raw reciprocating spinlock
//!
//! Raw locking APIs require exclusive access to a queue node for the duration
//! of the critical section. Queue nodes are represented by the
//! [`raw::MutexNode`] type. This implementation is `no_std` compatible. See
//! the [`raw`] module for more information.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! // Simply spins during contention.
//! use reciplock::raw::{spins::Mutex, MutexNode};
//!
//! let mutex = Arc::new(Mutex::new(0));
//! let c_mutex = Arc::clone(&mutex);
//!
//! thread::spawn(move || {
//!     // A queue node must be mutably accessible.
//!     let mut node = MutexNode::new();
//!     *c_mutex.lock(&mut node) = 10;
//! })
//! .join().expect("thread::spawn failed");
//!
//! // A node may also be transparently allocated in the stack.
//! assert_eq!(mutex.lock_with(|guard| *guard), 10);
//! ```
//!
//! ## Generic lock interface
//!
//! The [`lock::RawLock`] trait is the surface shared by every lock backend in
//! this crate: acquire with a per-thread node, get an opaque context back, and
//! hand that context to the matching release. Non-blocking acquisition is a
//! separate capability, [`lock::RawTryLock`], which the reciprocating lock
//! does not provide. The [`baseline`] module contains simpler backends (CAS
//! spinlock, ticket lock, CLH, MCS and hemlock) that implement the same
//! interface, so that [`Mutex`] and any benchmarking code can switch backends
//! through a type parameter.
//!
//! ## Features
//!
//! This crate dos not provide any default features. Features that can be enabled
//! are:
//!
//! ### yield
//!
//! The `yield` feature requires linking to the standard library, so it is not
//! suitable for `no_std` environments. By enabling the `yield` feature, instead
//! of busy-waiting during lock acquisitions and releases, this will call
//! [`std::thread::yield_now`], which cooperatively gives up a timeslice to the
//! OS scheduler. This may cause a context switch, so you may not want to enable
//! this feature if your intention is to to actually do optimistic spinning. The
//! default implementation calls [`core::hint::spin_loop`], which does in fact
//! just simply busy-waits. This feature is not `not_std` compatible.
//!
//! ### thread_local
//!
//! The `thread_local` feature enables the [`thread_local_node!`] macro and the
//! thread local mode of the reciprocating lock: each thread keeps its queue
//! node and its holder state in thread local storage, so
//! [`RawRecipLock::lock_local`] and `unlock_local` need no caller held
//! context. [`Mutex`] gets the matching `lock_local` and `lock_with_local`
//! methods.
//! This feature also requires linking to the standard library.
//!
//! [reciprocating lock]: https://arxiv.org/abs/2501.02380
//! [`RawRecipLock::lock_local`]: recip::RawRecipLock::lock_local
//! [spinlocks are usually not what you want]: https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html
//!
//! [`parking_lot::Mutex`]: https://docs.rs/parking_lot/latest/parking_lot/type.Mutex.html

#![no_std]
#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

#[cfg(any(feature = "yield", feature = "thread_local", loom, test))]
extern crate std;

pub mod baseline;
pub mod lock;
pub mod raw;
pub mod recip;
pub mod relax;

mod mutex;
pub use mutex::{Mutex, MutexGuard};

pub(crate) mod cfg;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
