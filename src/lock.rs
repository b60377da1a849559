//! The raw lock interface shared by every lock backend of this crate.
//!
//! A raw lock protects no data. It only serializes the callers of
//! [`acquire`] and [`release`]. Each backend chooses two types:
//!
//! - a `Node`, the per-thread record a waiting thread spins on. Backends that
//!   keep no per-thread state use `()`.
//! - a `Context`, the opaque value a successful acquisition returns and the
//!   matching release consumes. It borrows the node for its whole lifetime,
//!   so a node can never be handed to a second acquisition while it is still
//!   queued or held.
//!
//! Locks are initialized by [`RawLock::new`] and torn down by their [`Drop`]
//! implementation (if any). Because dropping requires ownership, no thread can
//! be holding or waiting on a lock that is being destroyed.
//!
//! Non-blocking acquisition is a separate capability, see [`RawTryLock`].
//! Backends whose protocol cannot abandon a queued arrival, such as the
//! reciprocating and the CLH locks, simply do not implement it.
//!
//! Data-protecting, RAII style locking is provided on top of this interface
//! by [`Mutex`].
//!
//! [`acquire`]: RawLock::acquire
//! [`release`]: RawLock::release
//! [`Mutex`]: crate::Mutex

/// Raw mutual exclusion that requires a per-thread node to acquire and
/// returns a context that must be handed back to release.
///
/// # Safety
///
/// Implementations must guarantee that between the return of [`acquire`] (or
/// a successful [`RawTryLock::try_acquire`]) and the matching [`release`] call,
/// no other acquisition of the same lock instance returns.
///
/// # Example
///
/// ```
/// use reciplock::lock::RawLock;
/// use reciplock::recip::{MutexNode, RawRecipLock};
/// use reciplock::relax::Spin;
///
/// let lock = RawRecipLock::<Spin>::new();
/// let mut node = MutexNode::new();
///
/// let ctx = lock.acquire(&mut node);
/// assert!(lock.is_locked());
/// // SAFETY: `ctx` was returned by `lock.acquire` on this thread and is
/// // released exactly once.
/// unsafe { lock.release(ctx) };
/// assert!(!lock.is_locked());
/// ```
///
/// [`acquire`]: RawLock::acquire
/// [`release`]: RawLock::release
pub unsafe trait RawLock {
    /// The per-thread queue node consumed by acquisitions.
    type Node: Default;

    /// The value retained by the lock holder between acquire and release.
    type Context<'a>
    where
        Self: 'a;

    /// Creates a new lock in the unlocked state.
    fn new() -> Self
    where
        Self: Sized;

    /// Acquires the lock, busy-waiting until the calling thread is its sole
    /// holder.
    ///
    /// The lock is not reentrant: acquiring a lock that the calling thread
    /// already holds never returns.
    fn acquire<'a>(&'a self, node: &'a mut Self::Node) -> Self::Context<'a>;

    /// Releases the lock, handing it to a waiting thread if there is one.
    ///
    /// # Safety
    ///
    /// `ctx` must have been returned by an acquisition of this very lock
    /// instance, and must not have been released before.
    unsafe fn release(&self, ctx: Self::Context<'_>);

    /// Returns `true` if the lock is currently held.
    ///
    /// The value is a snapshot and may be stale by the time it is observed.
    fn is_locked(&self) -> bool;
}

/// Raw mutual exclusion that can also be acquired without waiting.
///
/// # Safety
///
/// Same as [`RawLock`]: a successful [`try_acquire`] grants exclusive access
/// until the matching release.
///
/// [`try_acquire`]: RawTryLock::try_acquire
pub unsafe trait RawTryLock: RawLock {
    /// Attempts to acquire the lock without waiting.
    ///
    /// Returns `None` if the lock is held, or if it could not be acquired
    /// without queueing behind another thread.
    fn try_acquire<'a>(&'a self, node: &'a mut Self::Node) -> Option<Self::Context<'a>>;
}
