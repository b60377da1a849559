//! Heap allocated queue nodes for the baseline queue locks.
//!
//! MCS, hemlock and CLH all publish the holder's node to other threads, and
//! those threads write to it until the holder releases. A holder can leak its
//! guard with [`core::mem::forget`] and then drop its node handle, so a node
//! that is still part of a queue must outlive the handle. [`NodeBox`] tracks
//! whether its allocation is queued and leaks it on drop if so.

use alloc::boxed::Box;

use core::ptr::NonNull;

/// An owning handle to a heap allocated queue node.
pub(crate) struct NodeBox<T> {
    ptr: NonNull<T>,
    queued: bool,
}

// SAFETY: The handle owns its allocation, other threads only ever get shared
// access to it through the queue.
unsafe impl<T: Send + Sync> Send for NodeBox<T> {}
// SAFETY: Same as above.
unsafe impl<T: Send + Sync> Sync for NodeBox<T> {}

impl<T> NodeBox<T> {
    /// Allocates `value` on the heap.
    pub(crate) fn new(value: T) -> Self {
        let ptr = Box::into_raw(Box::new(value));
        // SAFETY: `Box::into_raw` never returns null.
        Self { ptr: unsafe { NonNull::new_unchecked(ptr) }, queued: false }
    }

    /// Returns the address of the current allocation.
    pub(crate) const fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Returns a shared reference to the node.
    pub(crate) fn get(&self) -> &T {
        // SAFETY: The allocation is alive for as long as the handle owns it.
        unsafe { self.ptr.as_ref() }
    }

    /// Marks the allocation as published and returns its address.
    pub(crate) fn enqueue(&mut self) -> *mut T {
        self.queued = true;
        self.as_ptr()
    }

    /// Marks the allocation as no longer referenced by any queue.
    pub(crate) fn dequeue(&mut self) {
        self.queued = false;
    }

    /// Returns `true` if the allocation may still be referenced by a queue.
    pub(crate) const fn is_queued(&self) -> bool {
        self.queued
    }

    /// Takes ownership of `ptr`, giving up the current allocation to whoever
    /// references it now.
    ///
    /// # Safety
    ///
    /// `ptr` must have been allocated by [`NodeBox::new`], and the caller
    /// must be its single owner from now on.
    pub(crate) unsafe fn adopt(&mut self, ptr: NonNull<T>) {
        self.ptr = ptr;
        self.queued = false;
    }
}

impl<T> Drop for NodeBox<T> {
    fn drop(&mut self) {
        if self.queued {
            return;
        }
        // SAFETY: The allocation came from `Box::into_raw` and is not
        // referenced by any queue.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::AtomicUsize;
    use core::sync::atomic::Ordering::Relaxed;

    use alloc::boxed::Box;

    use super::NodeBox;

    #[test]
    fn queued_allocation_survives_the_handle() {
        let mut node = NodeBox::new(AtomicUsize::new(0));
        let ptr = node.enqueue();
        assert!(node.is_queued());
        drop(node);
        // SAFETY: The handle leaked its allocation because it was queued.
        let orphan = unsafe { &*ptr };
        orphan.store(7, Relaxed);
        assert_eq!(orphan.load(Relaxed), 7);
        // SAFETY: Nothing references the allocation any longer.
        drop(unsafe { Box::from_raw(ptr) });
    }

    #[test]
    fn dequeued_allocation_is_freed_with_the_handle() {
        let mut node = NodeBox::new(AtomicUsize::new(0));
        node.enqueue();
        node.dequeue();
        assert!(!node.is_queued());
        node.get().store(1, Relaxed);
        drop(node);
    }
}
