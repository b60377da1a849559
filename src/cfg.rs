//! Compile-time selection between `core` and Loom's primitives.
//!
//! All lock algorithms import their atomics, cells, hints and thread functions
//! from this module, so that the exact same code is model checked under
//! `--cfg loom`.

pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize};

    /// A trait for atomic types that can be read without synchronization when
    /// exclusively borrowed.
    pub trait UnsyncLoad {
        /// The type of the value stored by the atomic.
        type Target;

        /// Loads the current value without any synchronization.
        fn load_unsynced(&mut self) -> Self::Target;
    }

    #[cfg(not(all(loom, test)))]
    impl<T> UnsyncLoad for AtomicPtr<T> {
        type Target = *mut T;

        #[inline(always)]
        fn load_unsynced(&mut self) -> Self::Target {
            *self.get_mut()
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    impl<T> UnsyncLoad for AtomicPtr<T> {
        type Target = *mut T;

        fn load_unsynced(&mut self) -> Self::Target {
            self.with_mut(|ptr| *ptr)
        }
    }
}

pub mod cell {
    #[cfg(not(all(loom, test)))]
    pub use core::cell::UnsafeCell;

    #[cfg(all(loom, test))]
    pub use loom::cell::UnsafeCell;

    /// A trait that runs closures against the value of an `UnsafeCell`,
    /// regardless of it being Loom's or `core`'s.
    pub trait UnsafeCellWith<T: ?Sized> {
        /// Runs `f` against a shared reference to the inner value.
        ///
        /// # Safety
        ///
        /// Caller must guarantee that no exclusive reference to the inner
        /// value is live for the duration of the call.
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret;
    }

    #[cfg(not(all(loom, test)))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        #[inline(always)]
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            f(unsafe { &*self.get() })
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            self.with(|ptr| f(unsafe { &*ptr }))
        }
    }
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

#[cfg(any(feature = "yield", test))]
pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;
}
