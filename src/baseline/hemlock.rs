//! Dice and Kogan's hemlock.
//!
//! Like the reciprocating lock, hemlock needs a single pointer per lock and a
//! single node per thread, and arrivals exchange their node into the tail. A
//! waiter spins on its predecessor's `grant` field until it names the lock
//! being handed over, then clears it to acknowledge. The releasing thread
//! waits for that acknowledgement, so a node is never referenced once its
//! owner's release returns. It is still referenced while its owner holds the
//! lock, though, and a leaked guard keeps that going forever: nodes are heap
//! allocated, and a handle dropped while its node is queued leaks it.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::baseline::node::NodeBox;
use crate::cfg::atomic::AtomicPtr;
use crate::lock::{RawLock, RawTryLock};
use crate::relax::{self, Relax};

/// The lock identity as published through `grant`.
type LockId = ();

struct HemNode {
    grant: AtomicPtr<LockId>,
}

/// An owning handle to the heap allocated queue node of a [`RawHemLock`].
///
/// # Example
///
/// ```
/// use reciplock::baseline::hemlock::{MutexNode, RawHemLock};
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawHemLock<Spin>>;
///
/// let mutex = Mutex::new(0);
/// let mut node = MutexNode::new();
/// *mutex.lock(&mut node) += 1;
/// assert_eq!(*mutex.lock(&mut node), 1);
/// ```
pub struct MutexNode {
    inner: NodeBox<HemNode>,
}

impl MutexNode {
    /// Creates new `MutexNode` instance, allocating its node.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: NodeBox::new(HemNode { grant: AtomicPtr::new(ptr::null_mut()) }) }
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
        f.debug_struct("MutexNode").field("queued", &self.inner.is_queued()).finish()
    }
}

/// The holder's node, retained between acquire and release.
#[must_use = "if unused the lock will never be released"]
pub struct Context<'a> {
    node: &'a mut MutexNode,
}

impl Debug for Context<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

/// A raw hemlock, generic over the relax policy `R`.
pub struct RawHemLock<R> {
    tail: AtomicPtr<HemNode>,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations.
unsafe impl<R> Send for RawHemLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawHemLock<R> {}

impl<R> RawHemLock<R> {
    /// Creates a new, unlocked and core based lock (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        Self { tail: AtomicPtr::new(ptr::null_mut()), relax: PhantomData }
    }

    /// Creates a new, unlocked and Loom based lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { tail: AtomicPtr::new(ptr::null_mut()), relax: PhantomData }
    }

    /// The address that identifies this lock in `grant` fields.
    fn id(&self) -> *mut LockId {
        self as *const Self as *mut LockId
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawHemLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawHemLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHemLock").field("locked", &!self.tail.load(Relaxed).is_null()).finish()
    }
}

// SAFETY: The queue is ordered by the tail exchange, and each grant is
// consumed by the single thread that arrived right after the granter.
unsafe impl<R: Relax> RawLock for RawHemLock<R> {
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
        debug_assert!(node.inner.get().grant.load(Relaxed).is_null());
        let pred = self.tail.swap(node.inner.enqueue(), AcqRel);
        if let Some(pred) = NonNull::new(pred) {
            // SAFETY: The predecessor's release waits for the acknowledgement
            // below before returning, and a leaked predecessor node is never
            // freed.
            let pred = unsafe { pred.as_ref() };
            let id = self.id();
            relax::wait_while::<R>(|| pred.grant.load(Acquire) != id);
            pred.grant.store(ptr::null_mut(), Release);
        }
        Context { node }
    }

    unsafe fn release(&self, ctx: Context<'_>) {
        let node = ctx.node;
        let own_ptr = node.inner.as_ptr();
        if self.tail.compare_exchange(own_ptr, ptr::null_mut(), Release, Relaxed).is_err() {
            let own = node.inner.get();
            own.grant.store(self.id(), Release);
            relax::wait_while::<R>(|| !own.grant.load(Acquire).is_null());
        }
        node.inner.dequeue();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        !self.tail.load(Relaxed).is_null()
    }
}

// SAFETY: The node is only published if the lock was free.
unsafe impl<R: Relax> RawTryLock for RawHemLock<R> {
    fn try_acquire<'a>(&'a self, node: &'a mut MutexNode) -> Option<Context<'a>> {
        let node_ptr = node.inner.as_ptr();
        self.tail.compare_exchange(ptr::null_mut(), node_ptr, AcqRel, Relaxed).ok()?;
        node.inner.enqueue();
        Some(Context { node })
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::mem;
    use core::sync::atomic::Ordering::{Acquire, Release};

    use alloc::boxed::Box;
    use std::thread;

    use crate::relax::{self, Yield};
    use crate::test::tests;

    use super::MutexNode;

    type Lock = super::RawHemLock<Yield>;
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
    fn test_try_lock() {
        tests::test_try_lock::<Lock>();
    }

    #[test]
    fn lots_and_lots_try_lock() {
        tests::lots_and_lots_try_lock::<Lock>();
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock::<Mutex<_>>();
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
            // SAFETY: The handle leaked the allocation, it is still the tail
            // and the waiter spins on it.
            let orphan = unsafe { &*orphan_ptr };
            // Grant the lock on behalf of the forgotten guard and wait for
            // the acknowledgement.
            orphan.grant.store(mutex.raw().id(), Release);
            relax::wait_while::<Yield>(|| !orphan.grant.load(Acquire).is_null());
            waiter.join().unwrap();
        });
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), 1);
        // SAFETY: The queue no longer references the leaked allocation.
        drop(unsafe { Box::from_raw(orphan_ptr) });
    }

    #[test]
    fn release_waits_for_acknowledgement() {
        let mutex = Mutex::new(0);
        let mut node = MutexNode::new();
        let own_ptr = node.inner.as_ptr();
        let guard = mutex.lock(&mut node);
        thread::scope(|s| {
            let waiter = s.spawn(|| mutex.lock_with(|mut guard| *guard += 1));
            relax::wait_while::<Yield>(|| mutex.raw().tail.load(Acquire) == own_ptr);
            drop(guard);
            waiter.join().unwrap();
        });
        assert!(!node.inner.is_queued());
        assert!(node.inner.get().grant.load(Acquire).is_null());
        assert_eq!(mutex.into_inner(), 1);
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    type Lock = super::RawHemLock<Yield>;

    #[test]
    fn lock_join() {
        models::lock_join::<crate::Mutex<_, Lock>>();
    }

    #[test]
    fn lock_join_reused_node() {
        models::lock_join_reused_node::<Lock>();
    }
}
