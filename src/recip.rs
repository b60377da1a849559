//! Reciprocating lock implementation.
//!
//! The lock state is a single atomic `tail` word with three logical values:
//!
//! - `Free`: nobody holds the lock (null);
//! - `HeldEmpty`: the lock is held and no thread arrived since the arrival
//!   segment was last detached (a reserved, misaligned address);
//! - `HeldWithTail(node)`: the lock is held and `node` is the most recent
//!   arrival.
//!
//! An arriving thread exchanges its own node into `tail`. The previous value
//! tells it whether it got the lock straight away (`Free`) or which node
//! arrived right before it. Arrivals link to each other only implicitly,
//! through these exchanged-out values, forming an "arrival segment" that is
//! discovered lazily by hand-offs.
//!
//! A releasing thread that knows of a successor writes the segment end marker
//! into the successor's node and is done. Otherwise it tries to swing `tail`
//! back to `Free`; if that fails, somebody arrived, so it detaches the whole
//! segment by exchanging `tail` for `HeldEmpty` and wakes the node it got
//! back. Each woken thread compares the marker against the node that arrived
//! before it, which tells it if it is the last member of its segment.
//!
//! Threads only spin on their own node, and nodes are never dereferenced by
//! other threads after their owner was admitted. Nodes may therefore live on
//! the stack, see [`MutexNode`].

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst};

use crate::cfg::atomic::AtomicPtr;
use crate::lock::RawLock;
use crate::relax::{self, Relax};

/// The `HeldEmpty` encoding of the tail, and the segment end marker that
/// travels with it.
///
/// Address `1` is misaligned for [`WaitNode`], so it never aliases a node.
const HELD_EMPTY: *mut WaitNode = 1 as *mut WaitNode;

/// The decoded lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Free,
    HeldEmpty,
    HeldWithTail(NonNull<WaitNode>),
}

impl State {
    /// Decodes a raw tail value.
    fn decode(tail: *mut WaitNode) -> Self {
        match NonNull::new(tail) {
            None => Self::Free,
            Some(_) if tail == HELD_EMPTY => Self::HeldEmpty,
            Some(node) => Self::HeldWithTail(node),
        }
    }
}

/// The record a thread publishes when it arrives at the lock.
///
/// `next` is reset by its owner at the start of every acquisition and
/// written exactly once by the thread that hands the lock over.
struct WaitNode {
    next: AtomicPtr<WaitNode>,
}

impl WaitNode {
    #[cfg(not(all(loom, test)))]
    const fn new() -> Self {
        Self { next: AtomicPtr::new(ptr::null_mut()) }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    fn new() -> Self {
        Self { next: AtomicPtr::new(ptr::null_mut()) }
    }
}

/// A locally-accessible record for forming the waiting queue.
///
/// `MutexNode` is an opaque type that holds the metadata of one thread's
/// participation in a [`RawRecipLock`]. It is mutably borrowed for as long as
/// the acquisition it was given to is alive, and may be reused for any number
/// of subsequent acquisitions, on any reciprocating lock, once that borrow
/// ends.
///
/// Nodes are never dereferenced by other threads once their owner has been
/// admitted, so they can be freely allocated in the stack.
///
/// # Example
///
/// ```
/// use reciplock::raw::{spins::Mutex, MutexNode};
///
/// let mutex = Mutex::new(0);
/// let mut node = MutexNode::new();
/// for _ in 0..3 {
///     *mutex.lock(&mut node) += 1;
/// }
/// assert_eq!(*mutex.lock(&mut node), 3);
/// ```
#[repr(transparent)]
pub struct MutexNode {
    inner: WaitNode,
}

impl MutexNode {
    /// Creates new `MutexNode` instance.
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::raw::MutexNode;
    ///
    /// let node = MutexNode::new();
    /// ```
    #[cfg(not(all(loom, test)))]
    #[must_use]
    #[inline(always)]
    pub const fn new() -> Self {
        Self { inner: WaitNode::new() }
    }

    /// Creates new Loom based `MutexNode` instance (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        Self { inner: WaitNode::new() }
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for MutexNode {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MutexNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexNode").finish_non_exhaustive()
    }
}

/// The state retained by the holder of a [`RawRecipLock`] between its
/// acquisition and the matching release.
///
/// It records the successor the holder will hand the lock to, if one was
/// discovered on arrival, and the end marker of the arrival segment the
/// holder belongs to. A context must be consumed by the thread that produced
/// it, so it is neither [`Send`] nor [`Sync`].
#[must_use = "if unused the lock will never be released"]
pub struct Context<'a> {
    node: NonNull<WaitNode>,
    successor: Option<NonNull<WaitNode>>,
    segment_end: *mut WaitNode,
    marker: PhantomData<&'a mut MutexNode>,
}

impl Context<'_> {
    const fn new(
        node: NonNull<WaitNode>,
        successor: Option<NonNull<WaitNode>>,
        segment_end: *mut WaitNode,
    ) -> Self {
        Self { node, successor, segment_end, marker: PhantomData }
    }

    /// Erases the lifetime of this context so it can be parked in thread
    /// local storage until the matching release.
    #[cfg(all(feature = "thread_local", not(all(loom, test))))]
    pub(crate) const fn retain(self) -> RetainedContext {
        RetainedContext { node: self.node, successor: self.successor, segment_end: self.segment_end }
    }
}

/// A [`Context`] whose borrow of the node is tracked at runtime instead.
#[cfg(all(feature = "thread_local", not(all(loom, test))))]
#[derive(Clone, Copy)]
pub(crate) struct RetainedContext {
    node: NonNull<WaitNode>,
    successor: Option<NonNull<WaitNode>>,
    segment_end: *mut WaitNode,
}

#[cfg(all(feature = "thread_local", not(all(loom, test))))]
impl RetainedContext {
    /// Turns this back into the context it was retained from.
    ///
    /// # Safety
    ///
    /// The acquisition this context was retained from must still be held by
    /// the current thread, its node must still be alive and unused, and the
    /// context must be restored at most once.
    pub(crate) const unsafe fn restore<'a>(self) -> Context<'a> {
        Context::new(self.node, self.successor, self.segment_end)
    }

    /// The successor and segment end addresses, for assertions.
    #[cfg(test)]
    pub(crate) fn addrs(&self) -> (Option<usize>, usize) {
        (self.successor.map(|succ| succ.as_ptr() as usize), self.segment_end as usize)
    }

    /// Whether the holder is the last member of its arrival segment.
    #[cfg(test)]
    pub(crate) fn is_collapsed(&self) -> bool {
        self.successor.is_none() && self.segment_end == HELD_EMPTY
    }
}

impl Debug for Context<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("successor", &self.successor)
            .field("segment_end", &self.segment_end)
            .finish_non_exhaustive()
    }
}

/// How a release handed the lock over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handoff {
    /// Wrote the segment end marker into a known successor.
    Successor,
    /// Nobody arrived, the lock is free.
    Uncontended,
    /// Detached the arrival segment and woke its most recent member.
    Detached,
}

/// A raw reciprocating lock, generic over the relax policy `R` its waiters
/// use.
///
/// This type protects no data, see [`Mutex`] for a data-protecting lock built
/// on top of it, and [`raw`] for aliases over the provided relax policies.
///
/// [`Mutex`]: crate::Mutex
/// [`raw`]: crate::raw
pub struct RawRecipLock<R> {
    tail: AtomicPtr<WaitNode>,
    relax: PhantomData<R>,
}

// SAFETY: The lock state is only ever accessed through atomic operations and
// the relax policy is instantiated per wait, on the waiting thread.
unsafe impl<R> Send for RawRecipLock<R> {}
// SAFETY: Same as above.
unsafe impl<R> Sync for RawRecipLock<R> {}

impl<R> RawRecipLock<R> {
    /// Creates a new, unlocked and core based lock (const).
    ///
    /// # Examples
    ///
    /// ```
    /// use reciplock::recip::RawRecipLock;
    /// use reciplock::relax::Spin;
    ///
    /// static LOCK: RawRecipLock<Spin> = RawRecipLock::new();
    /// ```
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn new() -> Self {
        let tail = AtomicPtr::new(ptr::null_mut());
        Self { tail, relax: PhantomData }
    }

    /// Creates a new, unlocked and Loom based lock (non-const).
    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    #[must_use]
    pub fn new() -> Self {
        let tail = AtomicPtr::new(ptr::null_mut());
        Self { tail, relax: PhantomData }
    }

    /// The raw tail word, for assertions.
    #[cfg(all(feature = "thread_local", not(loom), test))]
    pub(crate) fn tail_addr(&self) -> usize {
        self.tail.load(SeqCst) as usize
    }

    /// Releases the lock and reports how it was handed over.
    ///
    /// # Safety
    ///
    /// `ctx` must have been returned by [`RawLock::acquire`] on this lock and
    /// must not have been released before.
    pub(crate) unsafe fn release_with(&self, ctx: Context<'_>) -> Handoff {
        let Context { node, successor, segment_end, .. } = ctx;
        debug_assert!(!segment_end.is_null(), "segment end marker is never absent");
        debug_assert!(!self.tail.load(Relaxed).is_null(), "released a free lock");

        if let Some(successor) = successor {
            // SAFETY: The successor arrived before this thread and is spinning
            // on its node until this very store, so its node is still alive.
            let successor = unsafe { successor.as_ref() };
            debug_assert!(successor.next.load(Relaxed).is_null());
            successor.next.store(segment_end, Release);
            return Handoff::Successor;
        }

        debug_assert!(segment_end == HELD_EMPTY || segment_end == node.as_ptr());
        if self.tail.load(Relaxed) == segment_end
            && self.tail.compare_exchange(segment_end, ptr::null_mut(), SeqCst, SeqCst).is_ok()
        {
            return Handoff::Uncontended;
        }

        let tail = self.tail.swap(HELD_EMPTY, AcqRel);
        debug_assert!(!tail.is_null(), "detached an empty segment");
        debug_assert!(tail != HELD_EMPTY, "detached an empty segment");
        debug_assert!(tail != node.as_ptr(), "detached the releasing node");
        // SAFETY: `tail` is the most recent arrival. It swapped its node in
        // while this thread held the lock, so it is still spinning on it, and
        // this thread is the only one that will ever hand it the lock.
        let tail = unsafe { &*tail };
        debug_assert!(tail.next.load(Relaxed).is_null());
        tail.next.store(segment_end, Release);
        Handoff::Detached
    }
}

#[cfg(not(tarpaulin_include))]
impl<R> Default for RawRecipLock<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Debug for RawRecipLock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = State::decode(self.tail.load(Relaxed));
        f.debug_struct("RawRecipLock").field("state", &state).finish()
    }
}

// SAFETY: `tail` transitions are serialized by atomic read-modify-write
// operations, and exactly one thread is ever handed the lock by each release.
unsafe impl<R: Relax> RawLock for RawRecipLock<R> {
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
        let node = &node.inner;
        node.next.store(ptr::null_mut(), Relaxed);
        let node_ptr = NonNull::from(node);

        let prev = self.tail.swap(node_ptr.as_ptr(), AcqRel);
        debug_assert!(prev != node_ptr.as_ptr(), "node is already queued");
        let successor = match State::decode(prev) {
            State::Free => return Context::new(node_ptr, None, node_ptr.as_ptr()),
            State::HeldEmpty => None,
            State::HeldWithTail(pred) => Some(pred),
        };

        let handoff = relax::wait_until::<R, _>(|| NonNull::new(node.next.load(Acquire)));
        debug_assert!(handoff != node_ptr, "node was handed itself");
        if successor == Some(handoff) {
            Context::new(node_ptr, None, HELD_EMPTY)
        } else {
            Context::new(node_ptr, successor, handoff.as_ptr())
        }
    }

    #[inline]
    unsafe fn release(&self, ctx: Context<'_>) {
        // SAFETY: Caller guaranteed that `ctx` came from this lock and is
        // released only once.
        unsafe { self.release_with(ctx) };
    }

    #[inline]
    fn is_locked(&self) -> bool {
        !self.tail.load(Relaxed).is_null()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::format;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    use super::{Handoff, MutexNode, RawRecipLock, HELD_EMPTY};
    use crate::lock::RawLock;
    use crate::relax::{self, Yield};
    use crate::test::tests;

    type Lock = RawRecipLock<Yield>;

    #[test]
    fn single_thread_takes_fast_paths() {
        let lock = Lock::new();
        let mut node = MutexNode::new();
        for _ in 0..100 {
            let ctx = lock.acquire(&mut node);
            assert!(ctx.successor.is_none());
            assert_eq!(ctx.segment_end, ctx.node.as_ptr());
            // SAFETY: `ctx` was just acquired from `lock`.
            let handoff = unsafe { lock.release_with(ctx) };
            assert_eq!(handoff, Handoff::Uncontended);
            assert!(!lock.is_locked());
        }
    }

    #[test]
    fn nodes_are_reusable_across_locks() {
        let (a, b) = (Lock::new(), Lock::new());
        let mut node = MutexNode::new();
        for _ in 0..10 {
            let ctx = a.acquire(&mut node);
            // SAFETY: `ctx` was just acquired from `a`.
            unsafe { a.release(ctx) };
            let ctx = b.acquire(&mut node);
            // SAFETY: `ctx` was just acquired from `b`.
            unsafe { b.release(ctx) };
        }
        assert!(!a.is_locked() && !b.is_locked());
    }

    #[test]
    fn second_arrival_collapses_its_own_segment() {
        let lock = Lock::new();
        let entered = AtomicBool::new(false);
        let mut node1 = MutexNode::new();
        let ctx1 = lock.acquire(&mut node1);
        let node1_ptr = ctx1.node.as_ptr();
        assert!(ctx1.successor.is_none());
        assert_eq!(ctx1.segment_end, node1_ptr);

        thread::scope(|s| {
            let t2 = s.spawn(|| {
                let mut node2 = MutexNode::new();
                let ctx2 = lock.acquire(&mut node2);
                entered.store(true, SeqCst);
                let collapsed = ctx2.successor.is_none() && ctx2.segment_end == HELD_EMPTY;
                // SAFETY: `ctx2` was just acquired from `lock`.
                let handoff = unsafe { lock.release_with(ctx2) };
                (collapsed, handoff)
            });

            // T2 has arrived once the tail no longer points at T1's node.
            relax::wait_while::<Yield>(|| lock.tail.load(SeqCst) == node1_ptr);
            assert!(!entered.load(SeqCst));

            // SAFETY: `ctx1` was acquired from `lock` and is released once.
            let handoff = unsafe { lock.release_with(ctx1) };
            assert_eq!(handoff, Handoff::Detached);

            let (collapsed, handoff) = t2.join().unwrap();
            assert!(collapsed);
            assert_eq!(handoff, Handoff::Uncontended);
        });
        assert!(entered.load(SeqCst));
        assert!(!lock.is_locked());
    }

    #[test]
    fn arrival_after_detach_starts_a_new_segment() {
        let lock = Lock::new();
        let t2_holds = AtomicBool::new(false);
        let mut node1 = MutexNode::new();
        let ctx1 = lock.acquire(&mut node1);
        let node1_ptr = ctx1.node.as_ptr();

        thread::scope(|s| {
            let t2 = s.spawn(|| {
                let mut node = MutexNode::new();
                let ctx = lock.acquire(&mut node);
                t2_holds.store(true, SeqCst);
                // Hold on until T3 queues up behind the detached segment.
                relax::wait_while::<Yield>(|| lock.tail.load(SeqCst) == HELD_EMPTY);
                let collapsed = ctx.successor.is_none() && ctx.segment_end == HELD_EMPTY;
                // SAFETY: `ctx` was just acquired from `lock`.
                let handoff = unsafe { lock.release_with(ctx) };
                (collapsed, handoff)
            });

            relax::wait_while::<Yield>(|| lock.tail.load(SeqCst) == node1_ptr);
            // SAFETY: `ctx1` was acquired from `lock` and is released once.
            let handoff = unsafe { lock.release_with(ctx1) };
            assert_eq!(handoff, Handoff::Detached);
            relax::wait_while::<Yield>(|| !t2_holds.load(SeqCst));
            assert_eq!(lock.tail.load(SeqCst), HELD_EMPTY);

            let t3 = s.spawn(|| {
                let mut node = MutexNode::new();
                let ctx = lock.acquire(&mut node);
                let collapsed = ctx.successor.is_none() && ctx.segment_end == HELD_EMPTY;
                // SAFETY: `ctx` was just acquired from `lock`.
                let handoff = unsafe { lock.release_with(ctx) };
                (collapsed, handoff)
            });

            assert_eq!(t2.join().unwrap(), (true, Handoff::Detached));
            assert_eq!(t3.join().unwrap(), (true, Handoff::Uncontended));
        });
        assert!(!lock.is_locked());
    }

    #[test]
    fn detached_segment_passes_the_lock_to_known_successors() {
        let lock = Lock::new();
        let mut node1 = MutexNode::new();
        let ctx1 = lock.acquire(&mut node1);
        let node1_ptr = ctx1.node.as_ptr();

        thread::scope(|s| {
            let t2 = s.spawn(|| {
                let mut node = MutexNode::new();
                let ctx = lock.acquire(&mut node);
                let collapsed = ctx.successor.is_none() && ctx.segment_end == HELD_EMPTY;
                // SAFETY: `ctx` was just acquired from `lock`.
                let handoff = unsafe { lock.release_with(ctx) };
                (collapsed, handoff)
            });
            relax::wait_while::<Yield>(|| lock.tail.load(SeqCst) == node1_ptr);
            let node2_ptr = lock.tail.load(SeqCst);

            let t3 = s.spawn(|| {
                let mut node = MutexNode::new();
                let ctx = lock.acquire(&mut node);
                let successor = ctx.successor.map(|succ| succ.as_ptr() as usize);
                let segment_end = ctx.segment_end as usize;
                // SAFETY: `ctx` was just acquired from `lock`.
                let handoff = unsafe { lock.release_with(ctx) };
                (successor, segment_end, handoff)
            });
            relax::wait_while::<Yield>(|| lock.tail.load(SeqCst) == node2_ptr);

            // SAFETY: `ctx1` was acquired from `lock` and is released once.
            let handoff = unsafe { lock.release_with(ctx1) };
            assert_eq!(handoff, Handoff::Detached);

            // T3 arrived last, so it is woken first and hands over to T2.
            let (successor, segment_end, handoff) = t3.join().unwrap();
            assert_eq!(successor, Some(node2_ptr as usize));
            assert_eq!(segment_end, node1_ptr as usize);
            assert_eq!(handoff, Handoff::Successor);

            // T2 is handed T1's node, the end of its own segment.
            assert_eq!(t2.join().unwrap(), (true, Handoff::Uncontended));
        });
        assert!(!lock.is_locked());
    }

    #[test]
    fn blocked_segment_is_admitted_one_at_a_time() {
        const WAITERS: usize = 6;
        let lock = Lock::new();
        let arrived = AtomicUsize::new(0);
        let inside = AtomicBool::new(false);
        let admitted: Vec<AtomicUsize> = (0..WAITERS).map(|_| AtomicUsize::new(0)).collect();

        let mut node = MutexNode::new();
        let ctx = lock.acquire(&mut node);
        thread::scope(|s| {
            for slot in &admitted {
                let (lock, arrived, inside) = (&lock, &arrived, &inside);
                s.spawn(move || {
                    let mut node = MutexNode::new();
                    arrived.fetch_add(1, SeqCst);
                    let ctx = lock.acquire(&mut node);
                    assert!(!inside.swap(true, SeqCst), "critical sections overlap");
                    slot.fetch_add(1, SeqCst);
                    inside.store(false, SeqCst);
                    // SAFETY: `ctx` was just acquired from `lock`.
                    unsafe { lock.release(ctx) };
                });
            }
            relax::wait_while::<Yield>(|| arrived.load(SeqCst) < WAITERS);
            thread::sleep(Duration::from_millis(20));
            assert!(admitted.iter().all(|slot| slot.load(SeqCst) == 0));
            // SAFETY: `ctx` was acquired from `lock` and is released once.
            unsafe { lock.release(ctx) };
        });
        assert!(admitted.iter().all(|slot| slot.load(SeqCst) == 1));
        assert!(!lock.is_locked());
    }

    #[test]
    fn debug_shows_decoded_state() {
        let lock = Lock::new();
        assert_eq!(format!("{lock:?}"), "RawRecipLock { state: Free }");
        let mut node = MutexNode::new();
        let ctx = lock.acquire(&mut node);
        assert!(format!("{lock:?}").contains("HeldWithTail"));
        // SAFETY: `ctx` was just acquired from `lock`.
        unsafe { lock.release(ctx) };
        lock.tail.store(HELD_EMPTY, SeqCst);
        assert_eq!(format!("{lock:?}"), "RawRecipLock { state: HeldEmpty }");
        lock.tail.store(core::ptr::null_mut(), SeqCst);
    }

    #[test]
    fn raw_mutual_exclusion() {
        tests::raw_mutual_exclusion::<Lock>();
    }

    #[test]
    fn raw_lots_and_lots() {
        tests::raw_lots_and_lots::<Lock>();
    }
}
