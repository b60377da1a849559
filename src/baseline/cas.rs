//! A compare-and-swap spinlock.
//!
//! Every waiter retries a compare-and-swap on the same flag, relaxing between
//! attempts. There is no ordering among waiters whatsoever.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::lock::{RawLock, RawTryLock};
use crate::relax::{self, Relax};

/// A raw compare-and-swap spinlock, generic over the relax policy `R`.
///
/// # Example
///
/// ```
/// use reciplock::baseline::RawCasLock;
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawCasLock<Spin>>;
///
/// let mutex = Mutex::new(0);
/// let mut node = ();
/// *mutex.lock(&mut node) = 10;
/// assert_eq!(mutex.try_lock(&mut node).map(|guard| *guard), Some(10));
/// ```
pub struct RawCasLock<R> {
    locked: AtomicBool,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations.
unsafe impl<R> Send for RawCasLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawCasLock<R> {}

impl<R> RawCasLock<R> {
    /// Creates a new, unlocked and core based lock (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    /// Creates a new, unlocked and Loom based lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { locked: AtomicBool::new(false), relax: PhantomData }
    }

    fn try_lock_flag(&self) -> bool {
        self.locked.compare_exchange(false, true, Acquire, Relaxed).is_ok()
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawCasLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawCasLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawCasLock").field("locked", &self.locked.load(Relaxed)).finish()
    }
}

// SAFETY: The flag is set by a successful compare-and-swap from `false`, and
// only the holder clears it.
unsafe impl<R: Relax> RawLock for RawCasLock<R> {
    type Node = ();

    type Context<'a>
        = ()
    where
        Self: 'a;

    #[inline]
    fn new() -> Self {
        Self::new()
    }

    fn acquire<'a>(&'a self, _: &'a mut ()) {
        relax::wait_until::<R, _>(|| self.try_lock_flag().then_some(()));
    }

    #[inline]
    unsafe fn release(&self, (): ()) {
        debug_assert!(self.locked.load(Relaxed), "released a free lock");
        self.locked.store(false, Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

// SAFETY: A successful `try_acquire` performs the very same transition as
// `acquire`.
unsafe impl<R: Relax> RawTryLock for RawCasLock<R> {
    #[inline]
    fn try_acquire<'a>(&'a self, _: &'a mut ()) -> Option<()> {
        self.try_lock_flag().then_some(())
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::relax::Yield;
    use crate::test::tests;

    type Lock = super::RawCasLock<Yield>;
    type Mutex<T> = crate::Mutex<T, Lock>;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<Mutex<_>>();
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion::<Mutex<_>>();
    }

    #[test]
    fn raw_mutual_exclusion() {
        tests::raw_mutual_exclusion::<Lock>();
    }

    #[test]
    fn test_try_lock() {
        tests::test_try_lock::<Lock>();
    }

    #[test]
    fn lots_and_lots_try_lock() {
        tests::lots_and_lots_try_lock::<Lock>();
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<Mutex<_>>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<Mutex<_>>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    type Mutex<T> = crate::Mutex<T, super::RawCasLock<Yield>>;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }
}
