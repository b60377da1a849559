//! The MCS queue lock, from Mellor-Crummey and Scott.
//!
//! Arrivals enqueue their node by exchanging the tail, link themselves to
//! their predecessor's `next` field and spin on their own `locked` flag. The
//! holder notifies its successor through `next`, waiting for the link to be
//! completed if a successor swapped the tail but did not publish itself yet.
//!
//! Nodes are heap allocated. A holder that leaks its guard leaves its node
//! at the tail, where its successor will link itself, so a node handle that
//! is dropped while its node is still queued gives the allocation up instead
//! of freeing it.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use crate::baseline::node::NodeBox;
use crate::cfg::atomic::{AtomicBool, AtomicPtr};
use crate::lock::{RawLock, RawTryLock};
use crate::relax::{self, Relax};

struct McsNode {
    next: AtomicPtr<McsNode>,
    locked: AtomicBool,
}

impl McsNode {
    fn new() -> Self {
        Self { next: AtomicPtr::new(ptr::null_mut()), locked: AtomicBool::new(false) }
    }

    /// Resets the node before it gets published to the queue.
    fn reset(&self) {
        self.next.store(ptr::null_mut(), Relaxed);
        self.locked.store(true, Relaxed);
    }
}

impl Debug for McsNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("McsNode").field("next", &self.next.load(Relaxed)).finish()
    }
}

/// An owning handle to the heap allocated queue node of a [`RawMcsLock`].
///
/// # Example
///
/// ```
/// use reciplock::baseline::mcs::{MutexNode, RawMcsLock};
/// use reciplock::relax::Spin;
///
/// type Mutex<T> = reciplock::Mutex<T, RawMcsLock<Spin>>;
///
/// let mutex = Mutex::new(0);
/// let mut node = MutexNode::new();
/// *mutex.lock(&mut node) += 1;
/// assert_eq!(*mutex.lock(&mut node), 1);
/// ```
pub struct MutexNode {
    inner: NodeBox<McsNode>,
}

impl MutexNode {
    /// Creates new `MutexNode` instance, allocating its node.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: NodeBox::new(McsNode::new()) }
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

/// The holder's queue node, between acquire and release.
#[must_use = "if unused the lock will never be released"]
#[derive(Debug)]
pub struct Context<'a> {
    node: &'a mut MutexNode,
}

/// A raw MCS lock, generic over the relax policy `R`.
pub struct RawMcsLock<R> {
    tail: AtomicPtr<McsNode>,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations.
unsafe impl<R> Send for RawMcsLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawMcsLock<R> {}

impl<R> RawMcsLock<R> {
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
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawMcsLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawMcsLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMcsLock").field("locked", &!self.tail.load(Relaxed).is_null()).finish()
    }
}

// SAFETY: The queue is ordered by the tail exchange, and each holder wakes
// exactly one successor.
unsafe impl<R: Relax> RawLock for RawMcsLock<R> {
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
        node.inner.get().reset();
        let node_ptr = node.inner.enqueue();
        let pred = self.tail.swap(node_ptr, AcqRel);
        if let Some(pred) = NonNull::new(pred) {
            // SAFETY: The predecessor cannot return from its release before
            // it observes this link, and a leaked predecessor node is never
            // freed.
            unsafe { pred.as_ref() }.next.store(node_ptr, Release);
            let own = node.inner.get();
            relax::wait_while::<R>(|| own.locked.load(Acquire));
        }
        Context { node }
    }

    unsafe fn release(&self, ctx: Context<'_>) {
        let node = ctx.node;
        let own = node.inner.get();
        let next = match NonNull::new(own.next.load(Acquire)) {
            Some(next) => Some(next),
            None => {
                let own_ptr = node.inner.as_ptr();
                match self.tail.compare_exchange(own_ptr, ptr::null_mut(), Release, Relaxed) {
                    Ok(_) => None,
                    Err(_) => Some(relax::wait_until::<R, _>(|| NonNull::new(own.next.load(Acquire)))),
                }
            }
        };
        if let Some(next) = next {
            // SAFETY: The successor is spinning on its own flag until this store.
            unsafe { next.as_ref() }.locked.store(false, Release);
        }
        node.inner.dequeue();
    }

    #[inline]
    fn is_locked(&self) -> bool {
        !self.tail.load(Relaxed).is_null()
    }
}

// SAFETY: The node is only published if the queue was empty.
unsafe impl<R: Relax> RawTryLock for RawMcsLock<R> {
    fn try_acquire<'a>(&'a self, node: &'a mut MutexNode) -> Option<Context<'a>> {
        node.inner.get().reset();
        let node_ptr = node.inner.as_ptr();
        self.tail.compare_exchange(ptr::null_mut(), node_ptr, AcqRel, Relaxed).ok()?;
        node.inner.enqueue();
        Some(Context { node })
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::mem;
    use core::ptr::NonNull;
    use core::sync::atomic::Ordering::{Acquire, Release};

    use alloc::boxed::Box;
    use std::thread;

    use crate::relax::{self, Yield};
    use crate::test::tests;

    use super::MutexNode;

    type Lock = super::RawMcsLock<Yield>;
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
    fn test_lock_arc_nested() {
        tests::test_lock_arc_nested::<Mutex<_>, Mutex<_>>();
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
            // SAFETY: The handle leaked the allocation, it is still the tail.
            let orphan = unsafe { &*orphan_ptr };
            let next = relax::wait_until::<Yield, _>(|| NonNull::new(orphan.next.load(Acquire)));
            // Hand the lock over on behalf of the forgotten guard.
            // SAFETY: The waiter spins on its node until this store.
            unsafe { next.as_ref() }.locked.store(false, Release);
            waiter.join().unwrap();
        });
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), 1);
        // SAFETY: The queue no longer references the leaked allocation.
        drop(unsafe { Box::from_raw(orphan_ptr) });
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    type Lock = super::RawMcsLock<Yield>;

    #[test]
    fn lock_join() {
        models::lock_join::<crate::Mutex<_, Lock>>();
    }

    #[test]
    fn lock_join_reused_node() {
        models::lock_join_reused_node::<Lock>();
    }
}
