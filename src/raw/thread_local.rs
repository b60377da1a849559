//! Thread local mode of the reciprocating lock.
//!
//! Each thread owns one queue node per declared key, and the holder state
//! that a [`Context`] would carry (the known successor and the segment end
//! marker) is parked next to that node between lock and unlock. Locking and
//! unlocking then take nothing but the lock and the key.
//!
//! A slot serves one acquisition at a time. Locking through a slot that is
//! already holding a lock panics.
//!
//! [`Context`]: crate::recip::Context

use core::cell::{Cell, UnsafeCell};
use core::fmt::{self, Debug, Display, Formatter};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use std::thread::LocalKey;

use super::{Mutex, MutexNode};
use crate::lock::RawLock;
use crate::recip::{RawRecipLock, RetainedContext};
use crate::relax::Relax;

#[cfg(test)]
use crate::test::{LockNew, LockWith};

type StaticNode = &'static LocalMutexNode;

/// Declares thread local queue nodes for the reciprocating lock.
///
/// Every name becomes a [`LocalMutexNode`] constant that refers to a node
/// and a holder slot in the storage of whichever thread uses it. Pass the
/// constant by reference to [`RawRecipLock::lock_local`],
/// [`Mutex::lock_local`] or [`Mutex::lock_with_local`].
///
/// Declarations are `static` items separated by semicolons, with optional
/// visibility.
///
/// # Example
///
/// ```
/// use reciplock::raw::spins::Mutex;
///
/// reciplock::thread_local_node! {
///     pub static NODE;
///     static OTHER_NODE;
/// }
///
/// let mutex = Mutex::new(0);
/// *mutex.lock_local(&NODE) += 1;
/// mutex.lock_with_local(&OTHER_NODE, |mut guard| *guard += 1);
/// assert_eq!(*mutex.lock_local(&NODE), 2);
/// ```
///
/// [`RawRecipLock::lock_local`]: crate::recip::RawRecipLock::lock_local
/// [`Mutex::lock_local`]: crate::Mutex::lock_local
/// [`Mutex::lock_with_local`]: crate::Mutex::lock_with_local
#[macro_export]
macro_rules! thread_local_node {
    () => {};
    ($vis:vis static $node:ident; $($rest:tt)*) => {
        $crate::__thread_local_node_inner!($vis $node);
        $crate::thread_local_node!($($rest)*);
    };
    ($vis:vis static $node:ident) => {
        $crate::__thread_local_node_inner!($vis $node);
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __thread_local_node_inner {
    ($vis:vis $node:ident) => {
        $vis const $node: $crate::raw::LocalMutexNode = {
            ::std::thread_local! {
                static SLOT: $crate::raw::__LocalSlot = const { $crate::raw::__LocalSlot::new() };
            }
            $crate::raw::LocalMutexNode::__new(SLOT)
        };
    };
}

/// The holder state of a thread local acquisition.
#[derive(Clone, Copy)]
struct Held {
    lock: *const (),
    ctx: RetainedContext,
}

/// A thread's queue node together with the acquisition it currently holds.
#[doc(hidden)]
pub struct LocalSlot {
    node: UnsafeCell<MutexNode>,
    held: Cell<Option<Held>>,
}

impl LocalSlot {
    /// Creates an idle slot. Not public API.
    #[doc(hidden)]
    #[must_use]
    pub const fn new() -> Self {
        Self { node: UnsafeCell::new(MutexNode::new()), held: Cell::new(None) }
    }

    /// Returns `true` if this slot's node is queued on, or holds, a lock.
    fn is_busy(&self) -> bool {
        self.held.get().is_some()
    }
}

/// A key to a queue node stored in thread local storage.
///
/// Declare keys with [`thread_local_node!`]. The key is shared by all
/// threads, but each thread that locks through it uses its own node and its
/// own holder slot, so a thread holds at most one lock per key.
///
/// [`thread_local_node!`]: crate::thread_local_node
pub struct LocalMutexNode {
    key: LocalKey<LocalSlot>,
}

impl LocalMutexNode {
    /// Wraps the thread local key declared by [`thread_local_node!`].
    ///
    /// Not public API.
    ///
    /// [`thread_local_node!`]: crate::thread_local_node
    #[doc(hidden)]
    #[must_use]
    #[inline(always)]
    pub const fn __new(key: LocalKey<LocalSlot>) -> Self {
        Self { key }
    }

    /// Returns `true` if the current thread holds a lock through this key.
    ///
    /// # Panics
    ///
    /// Panics if the thread local storage was already destroyed.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.key.with(LocalSlot::is_busy)
    }
}

impl Debug for LocalMutexNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMutexNode").finish_non_exhaustive()
    }
}

impl<R> RawRecipLock<R> {
    fn id(&self) -> *const () {
        (self as *const Self).cast()
    }
}

impl<R: Relax> RawRecipLock<R> {
    /// Acquires this lock with the current thread's node behind `node`.
    ///
    /// The successor and segment end marker found on arrival are kept in
    /// the same thread local slot, for [`unlock_local`] to consume.
    ///
    /// # Panics
    ///
    /// Panics if this thread already holds a lock through `node`, or if the
    /// thread local storage was already destroyed.
    ///
    /// # Example
    ///
    /// ```
    /// use reciplock::recip::RawRecipLock;
    /// use reciplock::relax::Spin;
    ///
    /// reciplock::thread_local_node!(static NODE);
    ///
    /// let lock = RawRecipLock::<Spin>::new();
    /// lock.lock_local(&NODE);
    /// assert!(NODE.is_held());
    /// // SAFETY: This thread locked `lock` through `NODE` right above.
    /// unsafe { lock.unlock_local(&NODE) };
    /// assert!(!NODE.is_held());
    /// ```
    /// [`unlock_local`]: RawRecipLock::unlock_local
    #[track_caller]
    pub fn lock_local(&self, node: StaticNode) {
        node.key.with(|slot| {
            assert!(!slot.is_busy(), "thread local node is already holding a lock");
            // SAFETY: The slot is idle, so no other borrow of its node exists,
            // and it only ever gets borrowed by the thread that owns it.
            let wait = unsafe { &mut *slot.node.get() };
            let ctx = RawLock::acquire(self, wait).retain();
            slot.held.set(Some(Held { lock: self.id(), ctx }));
        });
    }

    /// Releases this lock, handing it over with the holder state parked by
    /// [`lock_local`].
    ///
    /// # Safety
    ///
    /// The current thread must hold this lock through `node`, and this lock
    /// must not have been moved since it was locked.
    ///
    /// # Panics
    ///
    /// Panics if `node` does not hold this lock on the current thread.
    ///
    /// [`lock_local`]: RawRecipLock::lock_local
    #[track_caller]
    pub unsafe fn unlock_local(&self, node: StaticNode) {
        node.key.with(|slot| {
            let held = slot.held.get().filter(|held| held.lock == self.id());
            let Some(held) = held else {
                panic!("thread local node does not hold this lock");
            };
            slot.held.set(None);
            // SAFETY: The context was retained by `lock_local` on this thread
            // for this lock, and the slot was just emptied, so it is
            // restored once.
            unsafe { self.release(held.ctx.restore()) };
        });
    }
}

impl<T: ?Sized, R: Relax> Mutex<T, R> {
    /// Acquires this mutex through a thread local node.
    ///
    /// The returned guard carries no queue state, the holder state lives in
    /// the slot behind `node` until the guard is dropped.
    ///
    /// # Panics
    ///
    /// Panics if this thread already holds a lock through `node`, or if the
    /// thread local storage was already destroyed.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use reciplock::raw::spins::Mutex;
    ///
    /// reciplock::thread_local_node!(static NODE);
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || *c_mutex.lock_local(&NODE) = 10)
    ///     .join()
    ///     .expect("thread::spawn failed");
    ///
    /// assert_eq!(*mutex.lock_local(&NODE), 10);
    /// ```
    ///
    /// Panic: a key holds one lock per thread at a time:
    ///
    /// ```should_panic
    /// use reciplock::raw::spins::Mutex;
    ///
    /// reciplock::thread_local_node!(static NODE);
    ///
    /// let (a, b) = (Mutex::new(0), Mutex::new(0));
    /// let _a = a.lock_local(&NODE);
    /// let _b = b.lock_local(&NODE);
    /// ```
    #[inline]
    #[track_caller]
    pub fn lock_local(&self, node: StaticNode) -> LocalMutexGuard<'_, T, R> {
        self.raw().lock_local(node);
        LocalMutexGuard { lock: self, node, marker: PhantomData }
    }

    /// Acquires this mutex through a thread local node and then runs the
    /// closure against its guard.
    ///
    /// # Panics
    ///
    /// Same as [`lock_local`].
    ///
    /// # Example
    ///
    /// ```
    /// use reciplock::raw::spins::Mutex;
    ///
    /// reciplock::thread_local_node!(static NODE);
    ///
    /// let mutex = Mutex::new(1);
    /// mutex.lock_with_local(&NODE, |mut guard| *guard *= 3);
    /// assert_eq!(mutex.lock_with_local(&NODE, |guard| *guard), 3);
    /// ```
    ///
    /// Compile fail: the guard cannot escape the closure:
    ///
    /// ```compile_fail
    /// use reciplock::raw::spins::Mutex;
    ///
    /// reciplock::thread_local_node!(static NODE);
    ///
    /// let mutex = Mutex::new(1);
    /// let guard = mutex.lock_with_local(&NODE, |guard| guard);
    /// ```
    /// [`lock_local`]: Mutex::lock_local
    #[inline]
    #[track_caller]
    pub fn lock_with_local<F, Ret>(&self, node: StaticNode, f: F) -> Ret
    where
        F: FnOnce(LocalMutexGuard<'_, T, R>) -> Ret,
    {
        f(self.lock_local(node))
    }
}

/// An RAII guard of a [`Mutex`] locked through a thread local node.
///
/// The guard is bound to the thread that locked, where its holder state is
/// stored, so it is not [`Send`].
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct LocalMutexGuard<'a, T: ?Sized, R: Relax> {
    lock: &'a Mutex<T, R>,
    node: StaticNode,
    marker: PhantomData<*mut ()>,
}

// SAFETY: A shared guard reference only grants shared access to the data.
unsafe impl<T: ?Sized + Sync, R: Relax> Sync for LocalMutexGuard<'_, T, R> {}

impl<T: ?Sized, R: Relax> Drop for LocalMutexGuard<'_, T, R> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: The guard was created by `lock_local` with this node on
        // this very thread, and the raw lock is borrowed, so it did not move.
        unsafe { self.lock.raw().unlock_local(self.node) };
    }
}

impl<T: ?Sized, R: Relax> Deref for LocalMutexGuard<'_, T, R> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data_ptr() }
    }
}

impl<T: ?Sized, R: Relax> DerefMut for LocalMutexGuard<'_, T, R> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data_ptr() }
    }
}

impl<T: ?Sized + Debug, R: Relax> Debug for LocalMutexGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized + Display, R: Relax> Display for LocalMutexGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&**self, f)
    }
}

#[cfg(test)]
thread_local_node!(static TEST_NODE);

/// A mutex that always locks through [`TEST_NODE`].
#[cfg(test)]
struct LocalMutex<T: ?Sized, R>(Mutex<T, R>);

#[cfg(test)]
impl<T: ?Sized, R: Relax> LockNew for LocalMutex<T, R> {
    type Target = T;

    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized,
    {
        Self(Mutex::new(value))
    }
}

#[cfg(test)]
impl<T: ?Sized, R: Relax> LockWith for LocalMutex<T, R> {
    type Guard<'a>
        = LocalMutexGuard<'a, Self::Target, R>
    where
        Self: 'a,
        Self::Target: 'a;

    fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(LocalMutexGuard<'_, T, R>) -> Ret,
    {
        f(self.0.lock_local(&TEST_NODE))
    }
}

#[cfg(test)]
mod test {
    use core::mem;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
    use std::thread;

    use crate::lock::RawLock;
    use crate::recip::RawRecipLock;
    use crate::relax::{self, Yield};
    use crate::test::tests;

    type LocalMutex<T> = super::LocalMutex<T, Yield>;
    type Mutex<T> = super::Mutex<T, Yield>;
    type Lock = RawRecipLock<Yield>;

    crate::thread_local_node! {
        static FIRST;
        static SECOND;
    }

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<LocalMutex<_>>();
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion::<LocalMutex<_>>();
    }

    #[test]
    fn smoke() {
        tests::smoke::<LocalMutex<_>>();
    }

    #[test]
    fn test_guard_debug_display() {
        tests::test_guard_debug_display::<LocalMutex<_>>();
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind::<LocalMutex<_>>();
    }

    #[test]
    fn test_lock_unsized() {
        tests::test_lock_unsized::<LocalMutex<_>>();
    }

    #[test]
    fn uncontended_lock_parks_the_fast_path_state() {
        let lock = Lock::new();
        for _ in 0..10 {
            lock.lock_local(&FIRST);
            let node = lock.tail_addr();
            let (successor, segment_end) =
                FIRST.key.with(|slot| slot.held.get().map(|held| held.ctx.addrs()).unwrap());
            assert_eq!(successor, None);
            assert_eq!(segment_end, node);
            // SAFETY: This thread locked `lock` through `FIRST` right above.
            unsafe { lock.unlock_local(&FIRST) };
            assert!(!FIRST.is_held());
            assert!(!lock.is_locked());
        }
    }

    #[test]
    fn distinct_keys_hold_distinct_locks() {
        let (a, b) = (Mutex::new(1), Mutex::new(2));
        let mut guard_a = a.lock_local(&FIRST);
        let mut guard_b = b.lock_local(&SECOND);
        mem::swap(&mut *guard_a, &mut *guard_b);
        drop(guard_a);
        assert!(!FIRST.is_held() && SECOND.is_held());
        drop(guard_b);
        assert_eq!((a.into_inner(), b.into_inner()), (2, 1));
    }

    #[test]
    fn busy_node_rejects_a_second_lock() {
        let (a, b) = (Mutex::new(0), Mutex::new(0));
        let guard = a.lock_local(&FIRST);
        let nested = panic::catch_unwind(AssertUnwindSafe(|| drop(b.lock_local(&FIRST))));
        assert!(nested.is_err());
        assert!(!b.is_locked());
        drop(guard);
        assert!(!a.is_locked());
    }

    #[test]
    fn forgotten_guard_keeps_the_node_busy() {
        let (a, b) = (Mutex::new(0), Mutex::new(0));
        mem::forget(a.lock_local(&FIRST));
        assert!(FIRST.is_held() && a.is_locked());
        let relock = panic::catch_unwind(AssertUnwindSafe(|| drop(b.lock_local(&FIRST))));
        assert!(relock.is_err());
        // SAFETY: The forgotten guard locked `a` through `FIRST` on this thread.
        unsafe { a.raw().unlock_local(&FIRST) };
        assert!(!a.is_locked());
        drop(b.lock_local(&FIRST));
    }

    #[test]
    #[should_panic(expected = "does not hold this lock")]
    fn unlock_through_the_wrong_node_panics() {
        let lock = Lock::new();
        lock.lock_local(&FIRST);
        // SAFETY: The slot check rejects the call before anything is released.
        unsafe { lock.unlock_local(&SECOND) };
    }

    #[test]
    fn parked_successor_survives_until_unlock() {
        let lock = Lock::new();
        let t2_done = AtomicBool::new(false);
        lock.lock_local(&FIRST);
        let node1 = lock.tail_addr();

        thread::scope(|s| {
            let t2 = s.spawn(|| {
                lock.lock_local(&FIRST);
                let collapsed =
                    FIRST.key.with(|slot| slot.held.get().is_some_and(|held| held.ctx.is_collapsed()));
                // SAFETY: This thread locked `lock` through `FIRST` right above.
                unsafe { lock.unlock_local(&FIRST) };
                t2_done.store(true, SeqCst);
                collapsed
            });
            relax::wait_while::<Yield>(|| lock.tail_addr() == node1);
            let node2 = lock.tail_addr();

            let t3 = s.spawn(|| {
                lock.lock_local(&FIRST);
                let addrs = FIRST.key.with(|slot| slot.held.get().map(|held| held.ctx.addrs()));
                // SAFETY: This thread locked `lock` through `FIRST` right above.
                unsafe { lock.unlock_local(&FIRST) };
                addrs
            });
            relax::wait_while::<Yield>(|| lock.tail_addr() == node2);
            assert!(!t2_done.load(SeqCst));

            // SAFETY: This thread locked `lock` through `FIRST` above.
            unsafe { lock.unlock_local(&FIRST) };
            assert_eq!(t3.join().unwrap(), Some((Some(node2), node1)));
            assert!(t2.join().unwrap());
        });
        assert!(!lock.is_locked());
    }
}
