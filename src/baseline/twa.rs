//! Dice and Kogan's TWA: a ticket lock augmented with a waiting array.
//!
//! The next thread in line spins on `grant` like in a plain ticket lock.
//! Threads further back park on a slot of a waiting array shared by all TWA
//! locks, selected by hashing the lock address and the ticket, and only move
//! over to `grant` once they are close to being served. Each release bumps
//! the slot of the ticket that just became close, so long-term waiters spin
//! on a word that changes once per handoff that concerns them, instead of
//! once per handoff of the lock.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::lock::{RawLock, RawTryLock};
use crate::relax::{self, Relax};

/// Number of slots in the waiting array, a power of two.
const SLOTS: usize = 4096;

/// Waiters at most this far from `grant` spin on it directly.
const LONG_TERM_THRESHOLD: usize = 1;

static WAITING: [AtomicUsize; SLOTS] = [const { AtomicUsize::new(0) }; SLOTS];

/// A raw TWA lock, generic over the relax policy `R`.
///
/// # Example
///
/// ```
/// use reciplock::baseline::RawTwaLock;
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawTwaLock<Spin>>;
///
/// let mutex = Mutex::new(0);
/// mutex.lock_with(|mut guard| *guard += 1);
/// assert_eq!(mutex.try_lock_with(|guard| guard.map(|g| *g)), Some(1));
/// ```
pub struct RawTwaLock<R> {
    ticket: AtomicUsize,
    grant: AtomicUsize,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations.
unsafe impl<R> Send for RawTwaLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawTwaLock<R> {}

impl<R> RawTwaLock<R> {
    /// Creates a new, unlocked lock (const).
    #[must_use]
    pub const fn new() -> Self {
        let (ticket, grant) = (AtomicUsize::new(0), AtomicUsize::new(0));
        Self { ticket, grant, relax: PhantomData }
    }

    /// The waiting array slot long-term waiters with `ticket` park on.
    fn slot(&self, ticket: usize) -> &'static AtomicUsize {
        let addr = self as *const Self as usize;
        let hash = (addr >> 4).wrapping_add(ticket.wrapping_mul(127));
        &WAITING[hash & (SLOTS - 1)]
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawTwaLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawTwaLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTwaLock")
            .field("ticket", &self.ticket.load(Relaxed))
            .field("grant", &self.grant.load(Relaxed))
            .finish()
    }
}

// SAFETY: Tickets are unique and `grant` only advances on release, so a
// single ticket is served at a time. The waiting array only ever delays a
// waiter, it never admits one.
unsafe impl<R: Relax> RawLock for RawTwaLock<R> {
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
        let ticket = self.ticket.fetch_add(1, Relaxed);
        if ticket.wrapping_sub(self.grant.load(Acquire)) > LONG_TERM_THRESHOLD {
            let slot = self.slot(ticket);
            loop {
                let seen = slot.load(Acquire);
                if ticket.wrapping_sub(self.grant.load(Acquire)) <= LONG_TERM_THRESHOLD {
                    break;
                }
                relax::wait_while::<R>(|| slot.load(Acquire) == seen);
            }
        }
        relax::wait_while::<R>(|| self.grant.load(Acquire) != ticket);
    }

    #[inline]
    unsafe fn release(&self, (): ()) {
        debug_assert!(self.is_locked(), "released a free lock");
        // Only the holder writes `grant`.
        let grant = self.grant.load(Relaxed).wrapping_add(1);
        self.grant.store(grant, Release);
        self.slot(grant.wrapping_add(LONG_TERM_THRESHOLD)).fetch_add(1, AcqRel);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.ticket.load(Relaxed) != self.grant.load(Relaxed)
    }
}

// SAFETY: The ticket is drawn only if it is the one being granted.
unsafe impl<R: Relax> RawTryLock for RawTwaLock<R> {
    fn try_acquire<'a>(&'a self, _: &'a mut ()) -> Option<()> {
        let grant = self.grant.load(Acquire);
        self.ticket.compare_exchange(grant, grant.wrapping_add(1), Acquire, Relaxed).ok().map(drop)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::{Relaxed, SeqCst};

    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use crate::lock::RawLock;
    use crate::relax::{self, Yield};
    use crate::test::tests;

    use super::LONG_TERM_THRESHOLD;

    type Lock = super::RawTwaLock<Yield>;
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
    fn release_signals_the_next_long_term_waiter() {
        let lock = Lock::new();
        let slot = lock.slot(1 + LONG_TERM_THRESHOLD);
        let before = slot.load(SeqCst);
        lock.acquire(&mut ());
        // SAFETY: The lock was just acquired.
        unsafe { lock.release(()) };
        // Other locks may share the slot, but slots only ever go up.
        assert!(slot.load(SeqCst).wrapping_sub(before) >= 1);
        assert_eq!(lock.grant.load(Relaxed), 1);
    }

    #[test]
    fn long_term_waiters_are_served_in_ticket_order() {
        const WAITERS: usize = 4;
        let lock = Lock::new();
        let served = AtomicUsize::new(0);
        lock.acquire(&mut ());
        thread::scope(|s| {
            for turn in 0..WAITERS {
                let (lock, served) = (&lock, &served);
                // Draw tickets in a known order, most of them long-term.
                relax::wait_while::<Yield>(|| lock.ticket.load(SeqCst) != turn + 1);
                s.spawn(move || {
                    lock.acquire(&mut ());
                    assert_eq!(served.fetch_add(1, SeqCst), turn);
                    // SAFETY: The lock was just acquired.
                    unsafe { lock.release(()) };
                });
            }
            relax::wait_while::<Yield>(|| lock.ticket.load(SeqCst) != WAITERS + 1);
            // SAFETY: The lock was acquired above.
            unsafe { lock.release(()) };
        });
        assert_eq!(served.load(SeqCst), WAITERS);
        assert!(!lock.is_locked());
    }
}
