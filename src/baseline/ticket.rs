//! A FIFO ticket lock.
//!
//! Arrivals draw a ticket from `next` and wait for `serving` to reach it. The
//! lock is strictly fair, but all waiters spin on the same word.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicUsize;
use crate::lock::{RawLock, RawTryLock};
use crate::relax::{self, Relax};

/// A raw ticket lock, generic over the relax policy `R`.
///
/// # Example
///
/// ```
/// use reciplock::baseline::RawTicketLock;
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawTicketLock<Spin>>;
///
/// let mutex = Mutex::new(0);
/// let mut node = ();
/// let guard = mutex.lock(&mut node);
/// assert!(mutex.is_locked());
/// drop(guard);
/// assert!(!mutex.is_locked());
/// ```
pub struct RawTicketLock<R> {
    next: AtomicUsize,
    serving: AtomicUsize,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations.
unsafe impl<R> Send for RawTicketLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawTicketLock<R> {}

impl<R> RawTicketLock<R> {
    /// Creates a new, unlocked and core based lock (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        let (next, serving) = (AtomicUsize::new(0), AtomicUsize::new(0));
        Self { next, serving, relax: PhantomData }
    }

    /// Creates a new, unlocked and Loom based lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        let (next, serving) = (AtomicUsize::new(0), AtomicUsize::new(0));
        Self { next, serving, relax: PhantomData }
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawTicketLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawTicketLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTicketLock")
            .field("next", &self.next.load(Relaxed))
            .field("serving", &self.serving.load(Relaxed))
            .finish()
    }
}

// SAFETY: Tickets are unique, and `serving` only advances on release, so a
// single ticket is served at a time.
unsafe impl<R: Relax> RawLock for RawTicketLock<R> {
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
        let ticket = self.next.fetch_add(1, Relaxed);
        relax::wait_while::<R>(|| self.serving.load(Acquire) != ticket);
    }

    #[inline]
    unsafe fn release(&self, (): ()) {
        debug_assert!(self.is_locked(), "released a free lock");
        // Only the holder writes `serving`.
        let serving = self.serving.load(Relaxed);
        self.serving.store(serving.wrapping_add(1), Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.next.load(Relaxed) != self.serving.load(Relaxed)
    }
}

// SAFETY: The ticket is drawn only if it is the one being served.
unsafe impl<R: Relax> RawTryLock for RawTicketLock<R> {
    fn try_acquire<'a>(&'a self, _: &'a mut ()) -> Option<()> {
        let serving = self.serving.load(Acquire);
        let next = serving.wrapping_add(1);
        self.next.compare_exchange(serving, next, Acquire, Relaxed).ok().map(drop)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::relax::Yield;
    use crate::test::tests;

    type Lock = super::RawTicketLock<Yield>;
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
    fn ticket_counters_wrap_around() {
        use crate::lock::{RawLock, RawTryLock};
        use core::sync::atomic::Ordering::Relaxed;

        let lock = Lock::new();
        lock.next.store(usize::MAX, Relaxed);
        lock.serving.store(usize::MAX, Relaxed);
        assert!(!lock.is_locked());
        for _ in 0..3 {
            let ctx = lock.try_acquire(&mut ()).expect("lock is free");
            assert!(lock.is_locked());
            // SAFETY: `ctx` was just acquired from `lock`.
            unsafe { lock.release(ctx) };
        }
        assert_eq!(lock.serving.load(Relaxed), 2);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<Mutex<_>>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    type Mutex<T> = crate::Mutex<T, super::RawTicketLock<Yield>>;

    #[test]
    fn lock_join() {
        models::lock_join::<Mutex<_>>();
    }
}
