//! Reciprocating lock aliases with caller provided queue nodes.
//!
//! The `raw` flavour of the reciprocating lock requires callers to provide a
//! queue node for every acquisition. Nodes are represented by the
//! [`MutexNode`] type, are cheap to create and may live in the stack. This
//! module is `no_std` compatible.
//!
//! The lock is held for as long as its associated RAII guard is in scope. Once
//! the guard is dropped, the mutex is freed. Mutex guards are returned by the
//! [`lock`] method. Guards are also accessible as the closure argument for the
//! [`lock_with`] method.
//!
//! The reciprocating lock is generic over the relax policy. Users may choose a
//! policy as long as it implements the [`Relax`] trait, see [`RawRecipLock`].
//! The following modules provide type aliases for [`Mutex`] and
//! [`MutexGuard`] associated with one relax policy each.
//!
//! [`lock`]: crate::Mutex::lock
//! [`lock_with`]: crate::Mutex::lock_with
//! [`Relax`]: crate::relax::Relax
//! [`RawRecipLock`]: crate::recip::RawRecipLock

use crate::recip::RawRecipLock;

pub use crate::recip::MutexNode;

#[cfg(all(feature = "thread_local", not(all(loom, test))))]
#[cfg_attr(docsrs, doc(cfg(feature = "thread_local")))]
mod thread_local;
#[cfg(all(feature = "thread_local", not(all(loom, test))))]
pub use thread_local::{LocalMutexGuard, LocalMutexNode};

#[cfg(all(feature = "thread_local", not(all(loom, test))))]
#[doc(hidden)]
pub use thread_local::LocalSlot as __LocalSlot;

/// A reciprocating lock that protects data of type `T`, generic over the
/// relax policy `R`.
pub type Mutex<T, R> = crate::Mutex<T, RawRecipLock<R>>;

/// A guard of [`Mutex`], generic over the relax policy `R`.
pub type MutexGuard<'a, T, R> = crate::MutexGuard<'a, T, RawRecipLock<R>>;

/// A reciprocating lock that implements a `spin` relax policy.
///
/// During lock contention, this lock spins while signaling the processor that
/// it is running a busy-wait spin-loop.
pub mod spins {
    use crate::relax::Spin;

    /// A [`raw::Mutex`] that implements the [`Spin`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use reciplock::raw::{spins::Mutex, MutexNode};
    ///
    /// let mutex = Mutex::new(0);
    /// let mut node = MutexNode::new();
    /// let guard = mutex.lock(&mut node);
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`raw::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, Spin>;

    /// A [`raw::MutexGuard`] that implements the [`Spin`] relax policy.
    ///
    /// [`raw::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Spin>;

    /// A reciprocating lock that implements a `spin with backoff` relax
    /// policy.
    ///
    /// During lock contention, this lock will perform exponential backoff
    /// while spinning, signaling the processor that it is running a busy-wait
    /// spin-loop.
    pub mod backoff {
        use crate::relax::SpinBackoff;

        /// A [`raw::Mutex`] that implements the [`SpinBackoff`] relax policy.
        ///
        /// # Example
        ///
        /// ```
        /// use reciplock::raw::{spins::backoff::Mutex, MutexNode};
        ///
        /// let mutex = Mutex::new(0);
        /// let mut node = MutexNode::new();
        /// let guard = mutex.lock(&mut node);
        /// assert_eq!(*guard, 0);
        /// ```
        /// [`raw::Mutex`]: crate::raw::Mutex
        pub type Mutex<T> = crate::raw::Mutex<T, SpinBackoff>;

        /// A [`raw::MutexGuard`] that implements the [`SpinBackoff`] relax
        /// policy.
        ///
        /// [`raw::MutexGuard`]: crate::raw::MutexGuard
        pub type MutexGuard<'a, T> = crate::raw::MutexGuard<'a, T, SpinBackoff>;
    }
}

/// A reciprocating lock that implements a `yield` relax policy.
///
/// During lock contention, this lock will yield the current time slice to the
/// OS scheduler.
#[cfg(any(feature = "yield", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub mod yields {
    use crate::relax::Yield;

    /// A [`raw::Mutex`] that implements the [`Yield`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use reciplock::raw::{yields::Mutex, MutexNode};
    ///
    /// let mutex = Mutex::new(0);
    /// let mut node = MutexNode::new();
    /// let guard = mutex.lock(&mut node);
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`raw::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, Yield>;

    /// A [`raw::MutexGuard`] that implements the [`Yield`] relax policy.
    ///
    /// [`raw::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Yield>;

    /// A reciprocating lock that implements a `yield with backoff` relax
    /// policy.
    ///
    /// During lock contention, this lock will perform exponential backoff while
    /// spinning, up to a threshold, then yields back to the OS scheduler.
    pub mod backoff {
        use crate::relax::YieldBackoff;

        /// A [`raw::Mutex`] that implements the [`YieldBackoff`] relax policy.
        ///
        /// # Example
        ///
        /// ```
        /// use reciplock::raw::{yields::backoff::Mutex, MutexNode};
        ///
        /// let mutex = Mutex::new(0);
        /// let mut node = MutexNode::new();
        /// let guard = mutex.lock(&mut node);
        /// assert_eq!(*guard, 0);
        /// ```
        /// [`raw::Mutex`]: crate::raw::Mutex
        pub type Mutex<T> = crate::raw::Mutex<T, YieldBackoff>;

        /// A [`raw::MutexGuard`] that implements the [`YieldBackoff`] relax
        /// policy.
        ///
        /// [`raw::MutexGuard`]: crate::raw::MutexGuard
        pub type MutexGuard<'a, T> = crate::raw::MutexGuard<'a, T, YieldBackoff>;
    }
}

/// A reciprocating lock that implements a `loop` relax policy.
///
/// During lock contention, this lock will rapidly spin without telling the CPU
/// to do any power down.
pub mod loops {
    use crate::relax::Loop;

    /// A [`raw::Mutex`] that implements the [`Loop`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use reciplock::raw::{loops::Mutex, MutexNode};
    ///
    /// let mutex = Mutex::new(0);
    /// let mut node = MutexNode::new();
    /// let guard = mutex.lock(&mut node);
    /// assert_eq!(*guard, 0);
    /// ```
    /// [`raw::Mutex`]: super::Mutex
    pub type Mutex<T> = super::Mutex<T, Loop>;

    /// A [`raw::MutexGuard`] that implements the [`Loop`] relax policy.
    ///
    /// [`raw::MutexGuard`]: super::MutexGuard
    pub type MutexGuard<'a, T> = super::MutexGuard<'a, T, Loop>;
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::raw::yields::Mutex;
    use crate::test::tests;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<Mutex<_>>();
    }

    #[test]
    fn lots_and_lots_reused_node() {
        tests::lots_and_lots_reused_node::<crate::recip::RawRecipLock<crate::relax::Yield>>();
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion::<Mutex<_>>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<Mutex<_>>();
    }

    #[test]
    fn test_guard_debug_display() {
        tests::test_guard_debug_display::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_from() {
        tests::test_mutex_from::<Mutex<_>>();
    }

    #[test]
    fn test_mutex_default() {
        tests::test_mutex_default::<Mutex<_>>();
    }

    #[test]
    fn test_get_mut() {
        tests::test_get_mut::<Mutex<_>>();
    }

    #[test]
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<Mutex<_>, Mutex<_>>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<Mutex<_>>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<Mutex<_>>();
    }

    #[test]
    fn test_lock_unsized() {
        tests::test_lock_unsized::<Mutex<_>>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::raw::yields::Mutex;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }

    #[test]
    fn lock_join_reused_node() {
        models::lock_join_reused_node::<crate::recip::RawRecipLock<crate::relax::Yield>>();
    }
}
