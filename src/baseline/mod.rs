//! Baseline lock backends that share the [`RawLock`] interface with the
//! reciprocating lock.
//!
//! These are the usual suspects a reciprocating lock gets compared against,
//! so that [`Mutex`] users and benchmark harnesses can switch the lock
//! algorithm through a type parameter alone:
//!
//! - [`RawCasLock`]: a compare-and-swap spinlock, the simplest possible
//!   backend, with global spinning and no fairness;
//! - [`RawTicketLock`]: a FIFO ticket lock, with global spinning;
//! - [`RawClhLock`]: the CLH queue lock, with heap allocated nodes that
//!   migrate between threads;
//! - [`RawMcsLock`]: the MCS queue lock, with explicit successor links;
//! - [`RawHemLock`]: Dice and Kogan's hemlock, one pointer per lock and one
//!   node per thread;
//! - [`RawTwaLock`]: Dice and Kogan's TWA, a ticket lock whose far waiters
//!   park on a global waiting array.
//!
//! All backends are generic over a [`Relax`] policy, and all of them except
//! CLH implement [`RawTryLock`].
//!
//! # Example
//!
//! ```
//! use reciplock::baseline::RawTicketLock;
//! use reciplock::relax::Spin;
//!
//! type Mutex<T> = reciplock::Mutex<T, RawTicketLock<Spin>>;
//!
//! let mutex = Mutex::new(0);
//! mutex.lock_with(|mut guard| *guard += 1);
//! assert_eq!(mutex.lock_with(|guard| *guard), 1);
//! ```
//!
//! [`RawLock`]: crate::lock::RawLock
//! [`RawTryLock`]: crate::lock::RawTryLock
//! [`Mutex`]: crate::Mutex
//! [`Relax`]: crate::relax::Relax

pub mod cas;
pub mod clh;
pub mod hemlock;
pub mod mcs;
pub mod ticket;
#[cfg(not(all(loom, test)))]
pub mod twa;

mod node;

pub use cas::RawCasLock;
pub use clh::RawClhLock;
pub use hemlock::RawHemLock;
pub use mcs::RawMcsLock;
pub use ticket::RawTicketLock;
#[cfg(not(all(loom, test)))]
pub use twa::RawTwaLock;
