//! The CLH queue lock, from Craig, Landin and Hagersten.
//!
//! Arrivals exchange their node into the tail and spin on the `locked` flag
//! of the node they got back. On release, the holder clears its own flag and
//! adopts its predecessor's node, leaving its former node to the successor
//! (or to the lock, if no one is waiting). Nodes therefore migrate between
//! threads, and must be heap allocated: a [`MutexNode`] is an owning handle
//! to whichever allocation its thread currently holds. If the holder leaks
//! its guard, its allocation stays at the tail and the handle gives it up to
//! the queue when dropped.

use alloc::boxed::Box;

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::baseline::node::NodeBox;
use crate::cfg::atomic::{AtomicBool, AtomicPtr, UnsyncLoad};
use crate::lock::RawLock;
use crate::relax::{self, Relax};

/// The heap allocated queue node, which is managed by the [`MutexNode`] type.
struct ClhNode {
    locked: AtomicBool,
}

impl ClhNode {
    /// Allocates the initial tail node of a lock.
    ///
    /// Caller is responsible for freeing the node.
    fn alloc(locked: bool) -> NonNull<Self> {
        let node = Box::new(Self { locked: AtomicBool::new(locked) });
        // SAFETY: `Box::into_raw` never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(node)) }
    }

    /// Frees a node allocated by [`ClhNode::alloc`].
    ///
    /// # Safety
    ///
    /// The pointer must have been returned by `alloc`, must not be freed
    /// twice and must not be referenced by any other thread.
    unsafe fn free(ptr: NonNull<Self>) {
        // SAFETY: Caller guaranteed that this is the only remaining pointer
        // to a live, Box allocated node.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
}

/// An owning handle to the heap allocated queue node of a [`RawClhLock`].
///
/// The allocation a handle owns changes with every release. A handle frees
/// its current allocation on drop, unless it is still queued behind a leaked
/// guard.
///
/// # Example
///
/// ```
/// use reciplock::baseline::clh::{MutexNode, RawClhLock};
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawClhLock<Spin>>;
///
/// let mutex = Mutex::new(0);
/// let mut node = MutexNode::new();
/// *mutex.lock(&mut node) += 1;
/// assert_eq!(*mutex.lock(&mut node), 1);
/// ```
pub struct MutexNode {
    inner: NodeBox<ClhNode>,
}

impl MutexNode {
    /// Creates new `MutexNode` instance, allocating its first node.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: NodeBox::new(ClhNode { locked: AtomicBool::new(true) }) }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for MutexNode {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MutexNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexNode").finish_non_exhaustive()
    }
}

/// The holder's node and the predecessor allocation it will adopt on release.
#[must_use = "if unused the lock will never be released"]
pub struct Context<'a> {
    node: &'a mut MutexNode,
    pred: NonNull<ClhNode>,
}

impl Debug for Context<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// A raw CLH lock, generic over the relax policy `R`.
///
/// The lock owns one allocation at all times, the node at its tail, which is
/// freed when the lock is dropped. It does not implement [`RawTryLock`]: a
/// thread that exchanged its node into the tail cannot back out, and a node
/// cannot be published conditionally without reading a tail allocation that
/// may be freed under the reader.
///
/// [`RawTryLock`]: crate::lock::RawTryLock
pub struct RawClhLock<R> {
    tail: AtomicPtr<ClhNode>,
    // The allocation most recently unlocked by a release. Compared to the
    // tail, never dereferenced.
    released: AtomicPtr<ClhNode>,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations.
unsafe impl<R> Send for RawClhLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawClhLock<R> {}

impl<R> RawClhLock<R> {
    /// Creates a new, unlocked lock, allocating its initial tail node.
    #[must_use]
    pub fn new() -> Self {
        let initial = ClhNode::alloc(false).as_ptr();
        let (tail, released) = (AtomicPtr::new(initial), AtomicPtr::new(initial));
        Self { tail, released, relax: PhantomData }
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawClhLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Drop for RawClhLock<R> {
    fn drop(&mut self) {
        let tail = self.tail.load_unsynced();
        // SAFETY: The tail always points to a valid allocation, which is
        // owned by the lock once no thread holds or waits on it.
        unsafe { ClhNode::free(NonNull::new_unchecked(tail)) }
    }
}

impl<R> Debug for RawClhLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let locked = self.tail.load(Relaxed) != self.released.load(Relaxed);
        f.debug_struct("RawClhLock").field("locked", &locked).finish()
    }
}

// SAFETY: The queue is ordered by the tail exchange, and each holder unlocks
// only the node its unique successor spins on.
unsafe impl<R: Relax> RawLock for RawClhLock<R> {
    type Node = MutexNode;

    type Context<'a>
        = Context<'a>
    where
        Self: 'a;

    #[inline]
    fn new() -> Self {
        Self::new()
    }

    fn acquire<'a>(&'a self, node: &'a mut MutexNode) -> Context<'a> {
        node.inner.get().locked.store(true, Relaxed);
        let pred = self.tail.swap(node.inner.enqueue(), AcqRel);
        // SAFETY: The tail always points to a valid allocation. The
        // predecessor allocation is only adopted after it gets unlocked, by
        // this very thread.
        let pred = unsafe { NonNull::new_unchecked(pred) };
        // SAFETY: Same as above.
        let pred_ref = unsafe { pred.as_ref() };
        relax::wait_while::<R>(|| pred_ref.locked.load(Acquire));
        Context { node, pred }
    }

    unsafe fn release(&self, ctx: Context<'_>) {
        let Context { node, pred } = ctx;
        self.released.store(node.inner.as_ptr(), Relaxed);
        node.inner.get().locked.store(false, Release);
        // SAFETY: The predecessor allocation was unlocked, and its former
        // handle adopted another one. The current allocation now belongs to
        // the successor, or to the lock if there is none.
        unsafe { node.inner.adopt(pred) };
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.tail.load(Relaxed) != self.released.load(Relaxed)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::mem;
    use core::sync::atomic::Ordering::{Relaxed, Release};

    use std::thread;

    use crate::lock::RawLock;
    use crate::relax::{self, Yield};
    use crate::test::tests;

    use super::MutexNode;

    type Lock = super::RawClhLock<Yield>;
    type Mutex<T> = crate::Mutex<T, Lock>;

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock::<Mutex<_>>();
    }

    #[test]
    fn lots_and_lots_reused_node() {
        tests::lots_and_lots_reused_node::<Lock>();
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
    fn raw_lots_and_lots() {
        tests::raw_lots_and_lots::<Lock>();
    }

    #[test]
    fn release_adopts_the_predecessor_node() {
        let lock = Lock::new();
        let initial = lock.tail.load(Relaxed);
        let mut node = MutexNode::new();
        let own = node.inner.as_ptr();
        let ctx = lock.acquire(&mut node);
        assert!(lock.is_locked());
        // SAFETY: `ctx` was just acquired from `lock`.
        unsafe { lock.release(ctx) };
        assert!(!lock.is_locked());
        assert_eq!(node.inner.as_ptr(), initial);
        assert_eq!(lock.tail.load(Relaxed), own);
    }

    #[test]
    fn forgotten_guard_keeps_its_node_alive() {
        let mutex = Mutex::new(0);
        let mut node = MutexNode::new();
        mem::forget(mutex.lock(&mut node));
        assert!(node.inner.is_queued());
        let orphan_ptr = node.inner.as_ptr();
        drop(node);
        thread::scope(|s| {
            let waiter = s.spawn(|| mutex.lock_with(|mut guard| *guard += 1));
            relax::wait_while::<Yield>(|| mutex.raw().tail.load(Relaxed) == orphan_ptr);
            // Unlock on behalf of the forgotten guard. The waiter adopts the
            // leaked allocation on release.
            // SAFETY: The handle leaked the allocation, and the waiter spins
            // on it.
            unsafe { &*orphan_ptr }.locked.store(false, Release);
            waiter.join().unwrap();
        });
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), 1);
    }

    #[test]
    fn test_mutex_debug() {
        tests::test_mutex_debug::<Mutex<_>>();
    }

    #[test]
    fn test_lock_unsized() {
        tests::test_lock_unsized::<Mutex<_>>();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    type Lock = super::RawClhLock<Yield>;

    #[test]
    fn lock_join() {
        models::lock_join::<crate::Mutex<_, Lock>>();
    }

    #[test]
    fn lock_join_reused_node() {
        models::lock_join_reused_node::<Lock>();
    }
}
