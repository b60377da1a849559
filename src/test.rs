use core::ops::{Deref, DerefMut};

#[cfg(not(loom))]
use std::sync::Arc;

/// A trait for convertion from `&Self` to a type that implements the [`Deref`]
/// trait.
pub trait AsDeref {
    /// The type of the value that `Self::Deref` dereferences to.
    type Target: ?Sized;

    /// The type that implements [`Deref`] trait.
    type Deref<'a>: Deref<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Returns a instance of the type that implements the [`Deref`] trait.
    fn as_deref(&self) -> Self::Deref<'_>;
}

/// A trait for convertion from `&mut Self` to a type that implements the
/// [`DerefMut`] trait.
pub trait AsDerefMut: AsDeref {
    /// The type that implements [`DerefMut`] trait.
    type DerefMut<'a>: DerefMut<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Returns a instance of the type that implements the [`DerefMut`] trait.
    fn as_deref_mut(&mut self) -> Self::DerefMut<'_>;
}

/// A trait for lock types that can hold user defined values.
pub trait LockNew {
    /// The type of the value this lock holds.
    type Target: ?Sized;

    /// Creates a new mutex in an unlocked state ready for use.
    fn new(value: Self::Target) -> Self
    where
        Self::Target: Sized;
}

/// A trait for lock types that can run closures against the protected data.
pub trait LockWith: LockNew {
    /// A `guard` has access to a type that can can give shared and exclusive
    /// references to the protected data.
    #[cfg(not(loom))]
    type Guard<'a>: AsDerefMut<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// A `guard` that hands out Loom tracked pointers to the protected data.
    #[cfg(loom)]
    type Guard<'a>: crate::loom::Guard<Target = Self::Target>
    where
        Self: 'a,
        Self::Target: 'a;

    /// Acquires a mutex and then runs the closure against the protected data.
    fn lock_with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(Self::Guard<'_>) -> Ret;
}

/// A trait for lock types that can return a exclusive reference to the
/// underlying data.
#[cfg(not(loom))]
pub trait LockData: LockNew {
    /// Returns a mutable reference to the underlying data.
    fn get_mut(&mut self) -> &mut Self::Target;
}

// Trivial implementation of `AsDeref` for `T` where `T: Deref`.
impl<T: Deref> AsDeref for T {
    type Target = <Self as Deref>::Target;

    type Deref<'a>
        = &'a <Self as Deref>::Target
    where
        Self: 'a,
        Self::Target: 'a;

    fn as_deref(&self) -> Self::Deref<'_> {
        self
    }
}

// Trivial implementation of `AsDerefMut` for `T` where `T: DerefMut`.
impl<T: DerefMut> AsDerefMut for T {
    type DerefMut<'a>
        = &'a mut <Self as Deref>::Target
    where
        Self: 'a,
        Self::Target: 'a;

    fn as_deref_mut(&mut self) -> Self::DerefMut<'_> {
        self
    }
}

/// An arbitrary unsigned integer type.
#[cfg(not(loom))]
pub type Int = u32;

/// Get a copy of the mutex protected data.
#[cfg(not(loom))]
pub fn get<L>(mutex: &Arc<L>) -> L::Target
where
    L: LockWith<Target: Sized + Copy>,
{
    mutex.lock_with(|data| *data.as_deref())
}

/// Increments a shared integer.
#[cfg(not(loom))]
pub fn inc<L>(mutex: &Arc<L>)
where
    L: LockWith<Target = Int>,
{
    mutex.lock_with(|mut guard| *guard.as_deref_mut() += 1);
}

#[cfg(not(loom))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation with minor changes
    // since the API is not compatible with this crate implementation and some
    // new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use core::sync::atomic::Ordering::{Relaxed, SeqCst};
    use std::fmt::{Debug, Display};
    use std::format;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    use super::{get, inc, Int};
    use super::{AsDeref, AsDerefMut, LockData, LockWith};
    use crate::lock::{RawLock, RawTryLock};
    use crate::Mutex;

    #[derive(Eq, PartialEq, Debug)]
    pub struct NonCopy(u32);

    const ITERS: Int = 1000;
    const CONCURRENCY: Int = 3;
    const EXPECTED_VALUE: Int = ITERS * CONCURRENCY * 2;

    fn inc_for<L>(mutex: &Arc<L>)
    where
        L: LockWith<Target = Int>,
    {
        for _ in 0..ITERS {
            inc::<L>(mutex);
        }
    }

    fn lots_and_lots<L>(f: fn(&Arc<L>)) -> Int
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        let mutex = Arc::new(L::new(0));
        let (tx, rx) = channel();
        for _ in 0..CONCURRENCY {
            let mutex1 = Arc::clone(&mutex);
            let tx2 = tx.clone();
            thread::spawn(move || {
                f(&mutex1);
                tx2.send(()).unwrap();
            });
            let mutex2 = Arc::clone(&mutex);
            let tx2 = tx.clone();
            thread::spawn(move || {
                f(&mutex2);
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
        get(&mutex)
    }

    pub fn lots_and_lots_lock<L>()
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        let value = lots_and_lots(inc_for::<L>);
        assert_eq!(value, EXPECTED_VALUE);
    }

    /// Every thread reuses a single queue node for all of its acquisitions.
    pub fn lots_and_lots_reused_node<L>()
    where
        L: RawLock + Send + Sync + 'static,
    {
        let mutex = Arc::new(Mutex::<Int, L>::new(0));
        let handles: Vec<_> = (0..2 * CONCURRENCY)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    let mut node = L::Node::default();
                    for _ in 0..ITERS {
                        *mutex.lock(&mut node) += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_with(|guard| *guard), EXPECTED_VALUE);
    }

    /// Fails if two critical sections are ever observed to overlap.
    pub fn mutual_exclusion<L>()
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        let mutex = Arc::new(L::new(0));
        let inside = Arc::new(AtomicBool::new(false));
        let handles: Vec<_> = (0..2 * CONCURRENCY)
            .map(|_| {
                let (mutex, inside) = (Arc::clone(&mutex), Arc::clone(&inside));
                thread::spawn(move || {
                    for _ in 0..ITERS {
                        mutex.lock_with(|mut guard| {
                            assert!(!inside.swap(true, SeqCst), "critical sections overlap");
                            *guard.as_deref_mut() += 1;
                            inside.store(false, SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(get(&mutex), EXPECTED_VALUE);
    }

    /// Drives a raw lock directly, counting with unsynchronized load/store
    /// pairs that lose updates unless critical sections are serialized.
    pub fn raw_mutual_exclusion<L>()
    where
        L: RawLock + Sync,
    {
        let lock = L::new();
        let inside = AtomicBool::new(false);
        let counter = AtomicUsize::new(0);
        let threads = 2 * CONCURRENCY as usize;
        thread::scope(|s| {
            for _ in 0..threads {
                s.spawn(|| {
                    let mut node = L::Node::default();
                    for _ in 0..ITERS {
                        let ctx = lock.acquire(&mut node);
                        assert!(!inside.swap(true, SeqCst), "critical sections overlap");
                        let value = counter.load(Relaxed);
                        counter.store(value + 1, Relaxed);
                        inside.store(false, SeqCst);
                        // SAFETY: `ctx` was just acquired from `lock`.
                        unsafe { lock.release(ctx) };
                    }
                });
            }
        });
        assert_eq!(counter.into_inner(), threads * ITERS as usize);
        assert!(!lock.is_locked());
    }

    /// Many short lived threads, each acquisition with a fresh node.
    pub fn raw_lots_and_lots<L>()
    where
        L: RawLock + Sync,
    {
        const THREADS: usize = 16;
        const CYCLES: usize = 200;
        let lock = L::new();
        let counter = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..CYCLES {
                        let mut node = L::Node::default();
                        let ctx = lock.acquire(&mut node);
                        let value = counter.load(Relaxed);
                        counter.store(value + 1, Relaxed);
                        // SAFETY: `ctx` was just acquired from `lock`.
                        unsafe { lock.release(ctx) };
                    }
                });
            }
        });
        assert_eq!(counter.into_inner(), THREADS * CYCLES);
    }

    pub fn test_try_lock<L>()
    where
        L: RawTryLock,
    {
        let mutex = Mutex::<Int, L>::new(0);
        let mut node1 = L::Node::default();
        let mut node2 = L::Node::default();
        let mut guard = mutex.try_lock(&mut node1).expect("free lock must be acquired");
        *guard += 1;
        assert!(mutex.is_locked());
        assert!(mutex.try_lock(&mut node2).is_none());
        drop(guard);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.try_lock(&mut node2).map(|guard| *guard), Some(1));
    }

    /// Every thread spins on `try_lock` until it succeeds, `ITERS` times.
    pub fn lots_and_lots_try_lock<L>()
    where
        L: RawTryLock + Send + Sync + 'static,
    {
        let mutex = Arc::new(Mutex::<Int, L>::new(0));
        let handles: Vec<_> = (0..2 * CONCURRENCY)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    let mut node = L::Node::default();
                    let mut done = 0;
                    while done < ITERS {
                        if let Some(mut guard) = mutex.try_lock(&mut node) {
                            *guard += 1;
                            done += 1;
                        }
                        thread::yield_now();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.lock_with(|guard| *guard), EXPECTED_VALUE);
    }

    pub fn smoke<L>()
    where
        L: LockWith<Target = Int>,
    {
        let mutex = L::new(1);
        mutex.lock_with(|guard| drop(guard));
        mutex.lock_with(|guard| drop(guard));
    }

    pub fn test_guard_debug_display<L>()
    where
        L: LockWith<Target = Int>,
        for<'a> <L as LockWith>::Guard<'a>: Debug + Display,
    {
        let value = 42;
        let mutex = L::new(value);
        mutex.lock_with(|data| {
            assert_eq!(format!("{value:?}"), format!("{data:?}"));
            assert_eq!(format!("{value}"), format!("{data}"));
        });
    }

    pub fn test_mutex_debug<L>()
    where
        L: LockWith<Target = Int> + Debug + Send + Sync + 'static,
    {
        let value = 42;
        let mutex = Arc::new(L::new(value));
        let msg = format!("Mutex {{ data: {value:?} }}");
        assert_eq!(msg, format!("{mutex:?}"));
    }

    pub fn test_mutex_default<L>()
    where
        L: LockData<Target = Int> + Default,
    {
        let mut mutex: L = Default::default();
        assert_eq!(u32::default(), *mutex.get_mut());
    }

    pub fn test_mutex_from<L>()
    where
        L: LockData<Target = Int> + From<Int>,
    {
        let value = 42;
        let mut mutex = L::from(value);
        assert_eq!(value, *mutex.get_mut());
    }

    pub fn test_get_mut<M>()
    where
        M: LockData<Target = NonCopy>,
    {
        let mut mutex = M::new(NonCopy(10));
        *mutex.get_mut() = NonCopy(20);
        assert_eq!(*mutex.get_mut(), NonCopy(20));
    }

    pub fn test_lock_arc_nested<L1, L2>()
    where
        L1: LockWith<Target = Int>,
        L2: LockWith<Target = Arc<L1>> + Send + Sync + 'static,
    {
        // Tests nested locks and access
        // to underlying data.
        let arc = Arc::new(L1::new(1));
        let arc2 = Arc::new(L2::new(arc));
        let (tx, rx) = channel();
        let _t = thread::spawn(move || {
            let val = arc2.lock_with(|arc2| {
                let arc2 = arc2.as_deref();
                get(&arc2)
            });
            assert_eq!(val, 1);
            tx.send(()).unwrap();
        });
        rx.recv().unwrap();
    }

    pub fn test_acquire_more_than_one_lock<L>()
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        let arc = Arc::new(L::new(1));
        let (tx, rx) = channel();
        for _ in 0..4 {
            let tx2 = tx.clone();
            let c_arc = Arc::clone(&arc);
            let _t = thread::spawn(move || {
                c_arc.lock_with(|_d| {
                    let mutex = L::new(1);
                    mutex.lock_with(|_g| ());
                });
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..4 {
            rx.recv().unwrap();
        }
    }

    pub fn test_lock_arc_access_in_unwind<L>()
    where
        L: LockWith<Target = Int> + Send + Sync + 'static,
    {
        let arc = Arc::new(L::new(1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || {
            struct Unwinder<T: LockWith<Target = Int>> {
                i: Arc<T>,
            }
            impl<T: LockWith<Target = Int>> Drop for Unwinder<T> {
                fn drop(&mut self) {
                    inc(&self.i);
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let value = get(&arc);
        assert_eq!(value, 2);
    }

    pub fn test_lock_unsized<L>()
    where
        L: LockWith<Target = [Int; 3]>,
    {
        let mutex = Arc::new(L::new([1, 2, 3]));
        {
            mutex.lock_with(|mut d| {
                d.as_deref_mut()[0] = 4;
                d.as_deref_mut()[2] = 5;
            });
        }
        let comp: &[Int] = &[4, 2, 5];
        let data = get(&mutex);
        assert_eq!(comp, data);
    }
}
