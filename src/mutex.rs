use core::fmt::{self, Debug, Display, Formatter};
use core::mem::ManuallyDrop;

use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::lock::{RawLock, RawTryLock};

#[cfg(test)]
use crate::test::{LockNew, LockWith};

#[cfg(all(not(loom), test))]
use crate::test::LockData;

/// A mutual exclusion primitive useful for protecting shared data, generic
/// over its raw lock backend.
///
/// The mutex can be created via a [`new`] constructor. Each mutex has a type
/// parameter which represents the data that it is protecting, and one which
/// selects the raw lock implementation, see [`RawLock`]. The data can only be
/// accessed through the RAII guards returned by [`lock`] and [`try_lock`],
/// which guarantees that the data is only ever accessed when the mutex is
/// locked.
///
/// The [`raw`] module provides aliases of this type over the reciprocating
/// lock, and the [`baseline`] module provides the comparison backends.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
/// use std::sync::mpsc::channel;
///
/// use reciplock::raw::MutexNode;
/// use reciplock::recip::RawRecipLock;
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawRecipLock<Spin>>;
///
/// const N: usize = 10;
///
/// // Spawn a few threads to increment a shared variable (non-atomically), and
/// // let the main thread know once all increments are done.
/// //
/// // Here we're using an Arc to share memory among threads, and the data inside
/// // the Arc is protected with a mutex.
/// let data = Arc::new(Mutex::new(0));
///
/// let (tx, rx) = channel();
/// for _ in 0..N {
///     let (data, tx) = (data.clone(), tx.clone());
///     thread::spawn(move || {
///         // A queue node must be mutably accessible.
///         let mut node = MutexNode::new();
///         // The shared state can only be accessed once the lock is held.
///         // Our non-atomic increment is safe because we're the only thread
///         // which can access the shared state when the lock is held.
///         let mut data = data.lock(&mut node);
///         *data += 1;
///         if *data == N {
///             tx.send(()).unwrap();
///         }
///         // the lock is unlocked here when `data` goes out of scope.
///     });
/// }
///
/// rx.recv().unwrap();
/// ```
/// [`new`]: Mutex::new
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
/// [`raw`]: crate::raw
/// [`baseline`]: crate::baseline
pub struct Mutex<T: ?Sized, L> {
    raw: L,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
// SAFETY: The raw lock serializes every access to `data`.
unsafe impl<T: ?Sized + Send, L: Send> Send for Mutex<T, L> {}
// SAFETY: Same as above.
unsafe impl<T: ?Sized + Send, L: Sync> Sync for Mutex<T, L> {}

impl<T, L: RawLock> Mutex<T, L> {
    /// Creates a new mutex in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        Self { raw: L::new(), data: UnsafeCell::new(value) }
    }
}

impl<T, L> Mutex<T, L> {
    /// Consumes this mutex, returning the underlying data.
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(0);
    /// assert_eq!(mutex.into_inner(), 0);
    /// ```
    #[cfg(not(all(loom, test)))]
    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, L: RawLock> Mutex<T, L> {
    /// Acquires this mutex, blocking the current thread until it is able to do so.
    ///
    /// This function will block the local thread until it is available to acquire
    /// the mutex. Upon returning, the thread is the only thread with the lock
    /// held. An RAII guard is returned to allow scoped unlock of the lock. When
    /// the guard goes out of scope, the mutex will be unlocked.
    ///
    /// The queue node is mutably borrowed for as long as the guard is alive,
    /// and can be reused by later acquisitions once the guard is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use reciplock::raw::{spins::Mutex, MutexNode};
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     let mut node = MutexNode::new();
    ///     *c_mutex.lock(&mut node) = 10;
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// let mut node = MutexNode::new();
    /// assert_eq!(*mutex.lock(&mut node), 10);
    /// ```
    #[inline]
    pub fn lock<'a>(&'a self, node: &'a mut L::Node) -> MutexGuard<'a, T, L> {
        let ctx = self.raw.acquire(node);
        MutexGuard::new(self, ctx)
    }

    /// Acquires this mutex and then runs the closure against its guard.
    ///
    /// This function creates a fresh queue node for each call,
    /// which is convenient for one-liners. Hot loops should call [`lock`]
    /// with a reused node instead.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// use reciplock::raw::spins::Mutex;
    ///
    /// let mutex = Arc::new(Mutex::new(0));
    /// let c_mutex = Arc::clone(&mutex);
    ///
    /// thread::spawn(move || {
    ///     c_mutex.lock_with(|mut guard| *guard = 10);
    /// })
    /// .join().expect("thread::spawn failed");
    ///
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    ///
    /// Compile fail: borrows of the guard or its data cannot escape the given
    /// closure:
    ///
    /// ```compile_fail,E0515
    /// use reciplock::raw::spins::Mutex;
    ///
    /// let mutex = Mutex::new(1);
    /// let data = mutex.lock_with(|guard| &*guard);
    /// ```
    /// [`lock`]: Mutex::lock
    #[inline]
    pub fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, L>) -> Ret,
    {
        let mut node = L::Node::default();
        f(self.lock(&mut node))
    }

    /// Returns `true` if the lock is currently held.
    ///
    /// This method does not provide any synchronization guarantees, so its only
    /// useful as a heuristic, and so must be considered not up to date.
    ///
    /// # Example
    ///
    /// ```
    /// use reciplock::raw::{spins::Mutex, MutexNode};
    ///
    /// let mutex = Mutex::new(0);
    /// let mut node = MutexNode::new();
    ///
    /// let guard = mutex.lock(&mut node);
    /// drop(guard);
    ///
    /// assert_eq!(mutex.is_locked(), false);
    /// ```
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: ?Sized, L: RawTryLock> Mutex<T, L> {
    /// Attempts to acquire this mutex without blocking the thread.
    ///
    /// If the lock could not be acquired at this time, then [`None`] is
    /// returned. Otherwise, an RAII guard is returned. The lock will be
    /// unlocked when the guard is dropped.
    ///
    /// Only backends that implement [`RawTryLock`] provide this method; the
    /// reciprocating lock does not.
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::baseline::mcs::{MutexNode, RawMcsLock};
    /// use reciplock::relax::Spin;
    ///
    /// type Mutex<T> = reciplock::Mutex<T, RawMcsLock<Spin>>;
    ///
    /// let mutex = Mutex::new(0);
    /// let mut node = MutexNode::new();
    /// if let Some(mut guard) = mutex.try_lock(&mut node) {
    ///     *guard = 10;
    /// }
    /// assert_eq!(mutex.lock_with(|guard| *guard), 10);
    /// ```
    ///
    /// Compile fail: the reciprocating lock cannot be tried:
    ///
    /// ```compile_fail,E0599
    /// use reciplock::raw::{spins::Mutex, MutexNode};
    ///
    /// let mutex = Mutex::new(0);
    /// let mut node = MutexNode::new();
    /// let guard = mutex.try_lock(&mut node);
    /// ```
    #[inline]
    pub fn try_lock<'a>(&'a self, node: &'a mut L::Node) -> Option<MutexGuard<'a, T, L>> {
        self.raw.try_acquire(node).map(|ctx| MutexGuard::new(self, ctx))
    }

    /// Attempts to acquire this mutex and then runs a closure against its
    /// guard, if the lock was acquired.
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::baseline::ticket::RawTicketLock;
    /// use reciplock::relax::Spin;
    ///
    /// type Mutex<T> = reciplock::Mutex<T, RawTicketLock<Spin>>;
    ///
    /// let mutex = Mutex::new(0);
    /// let value = mutex.try_lock_with(|guard| guard.map(|mut g| { *g += 1; *g }));
    /// assert_eq!(value, Some(1));
    /// ```
    #[inline]
    pub fn try_lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(Option<MutexGuard<'_, T, L>>) -> Ret,
    {
        let mut node = L::Node::default();
        f(self.try_lock(&mut node))
    }
}

impl<T: ?Sized, L> Mutex<T, L> {
    /// Returns a mutable reference to the underlying data.
    ///
    /// Since this call borrows the `Mutex` mutably, no actual locking needs to
    /// take place - the mutable borrow statically guarantees no locks exist.
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::raw::{spins::Mutex, MutexNode};
    ///
    /// let mut mutex = Mutex::new(0);
    /// *mutex.get_mut() = 10;
    ///
    /// let mut node = MutexNode::new();
    /// assert_eq!(*mutex.lock(&mut node), 10);
    /// ```
    #[cfg(not(all(loom, test)))]
    #[inline(always)]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns a reference to the raw lock backing this mutex.
    pub const fn raw(&self) -> &L {
        &self.raw
    }

    /// Returns a raw pointer to the underlying data.
    #[cfg(all(feature = "thread_local", not(all(loom, test))))]
    pub(crate) const fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

impl<T: Default, L: RawLock> Default for Mutex<T, L> {
    /// Creates a `Mutex<T, L>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T, L: RawLock> From<T> for Mutex<T, L> {
    /// Creates a `Mutex<T, L>` from a instance of `T`.
    #[inline]
    fn from(data: T) -> Self {
        Self::new(data)
    }
}

impl<T: ?Sized + Debug, L: RawLock> Debug for Mutex<T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        self.lock_with(|guard| guard.with(|data| {
            d.field("data", &data);
        }));
        d.finish()
    }
}

#[cfg(test)]
impl<T: ?Sized, L: RawLock> LockNew for Mutex<T, L> {
    type Target = T;

    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized,
    {
        Self::new(value)
    }
}

#[cfg(test)]
impl<T: ?Sized, L: RawLock> LockWith for Mutex<T, L> {
    type Guard<'a>
        = MutexGuard<'a, Self::Target, L>
    where
        Self: 'a,
        Self::Target: 'a;

    fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(MutexGuard<'_, T, L>) -> Ret,
    {
        self.lock_with(f)
    }
}

#[cfg(all(not(loom), test))]
impl<T: ?Sized, L: RawLock> LockData for Mutex<T, L> {
    fn get_mut(&mut self) -> &mut Self::Target {
        self.get_mut()
    }
}

/// An RAII implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// The data protected by the mutex can be access through this guard via its
/// [`Deref`] and [`DerefMut`] implementations.
///
/// This structure is returned by the [`lock`] and [`try_lock`] methods on
/// [`Mutex`]. It is also given as closure argument by the [`lock_with`] and
/// [`try_lock_with`] methods.
///
/// [`Deref`]: core::ops::Deref
/// [`DerefMut`]: core::ops::DerefMut
/// [`lock`]: Mutex::lock
/// [`try_lock`]: Mutex::try_lock
/// [`lock_with`]: Mutex::lock_with
/// [`try_lock_with`]: Mutex::try_lock_with
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized, L: RawLock + 'a> {
    lock: &'a Mutex<T, L>,
    ctx: ManuallyDrop<L::Context<'a>>,
}

// Same unsafe Sync impl as `std::sync::MutexGuard`.
// SAFETY: A shared guard reference only grants shared access to the data.
unsafe impl<T: ?Sized + Sync, L: RawLock + Sync> Sync for MutexGuard<'_, T, L> {}

impl<'a, T: ?Sized, L: RawLock> MutexGuard<'a, T, L> {
    /// Creates a new `MutexGuard` instance.
    const fn new(lock: &'a Mutex<T, L>, ctx: L::Context<'a>) -> Self {
        Self { lock, ctx: ManuallyDrop::new(ctx) }
    }

    /// Runs `f` against a shared reference pointing to the underlying data.
    fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { self.lock.data.with_unchecked(f) }
    }
}

impl<T: ?Sized, L: RawLock> Drop for MutexGuard<'_, T, L> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: The context is only ever taken here, and drop runs once.
        let ctx = unsafe { ManuallyDrop::take(&mut self.ctx) };
        // SAFETY: The context was returned by an acquisition of this mutex's
        // raw lock, and it is released exactly once.
        unsafe { self.lock.raw.release(ctx) };
    }
}

impl<T: ?Sized + Debug, L: RawLock> Debug for MutexGuard<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

impl<T: ?Sized + Display, L: RawLock> Display for MutexGuard<'_, T, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, L: RawLock> core::ops::Deref for MutexGuard<'_, T, L> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data.get() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T: ?Sized, L: RawLock> core::ops::DerefMut for MutexGuard<'_, T, L> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

/// SAFETY: A guard instance hold the lock locked, with exclusive access to the
/// underlying data.
#[cfg(all(loom, test))]
#[cfg(not(tarpaulin_include))]
unsafe impl<T: ?Sized, L: RawLock> crate::loom::Guard for MutexGuard<'_, T, L> {
    type Target = T;

    fn get(&self) -> &loom::cell::UnsafeCell<Self::Target> {
        &self.lock.data
    }
}
