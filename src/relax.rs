// Modified version of relax.rs from spin-rs to support Loom yielding and
// exponential backoff.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Policies that decide what a waiting thread does between two polls of the
//! memory location it is spinning on.
//!
//! The reciprocating lock protocol does not depend on the relax policy for
//! correctness: a waiter only has to eventually observe the hand-off write.
//! Policies only trade latency against power and fairness towards other
//! threads sharing the same core.

use crate::cfg::hint;

#[cfg(any(feature = "yield", test))]
use crate::cfg::thread;

/// A trait implemented by spinning relax policies.
///
/// # Example
///
/// ```
/// use reciplock::relax::Relax;
///
/// struct Spin;
///
/// impl Relax for Spin {
///     #[inline(always)]
///     fn new() -> Self {
///         Self
///     }
///
///     #[inline(always)]
///     fn relax(&mut self) {
///         core::hint::spin_loop();
///     }
/// }
/// ```
pub trait Relax {
    /// Returns the initial state of the policy, created once per wait.
    fn new() -> Self;

    /// Performs one relaxing step while the awaited condition does not hold.
    fn relax(&mut self);
}

/// A policy that busy-waits, hinting the processor with
/// [`core::hint::spin_loop`] that it is inside a spin loop.
///
/// Schedulers cannot tell spinning apart from useful work, so a spinning
/// waiter may keep the lock holder off the processor. This is known as
/// [priority inversion]. Prefer [`Yield`], or a scheduler-aware lock, when
/// threads outnumber the available cores.
///
/// [priority inversion]: https://matklad.github.io/2020/01/02/spinlocks-considered-harmful.html
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// A policy that gives the rest of the current time slice back to the OS
/// scheduler on every step.
///
/// Requires the standard library. Threads that are oversubscribed on their
/// cores make progress much faster with this policy than with [`Spin`].
#[cfg(any(feature = "yield", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub struct Yield;

#[cfg(any(feature = "yield", test))]
impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

/// A policy that does nothing between polls, not even a spin loop hint.
///
/// Only useful on targets whose spin loop hint is broken or missing. Use
/// [`Spin`] otherwise.
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

// Exponential backoff is based on the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// The counter type of [`Backoff`]; shift amounts and bounds share it.
type Uint = u32;

/// A policy like [`Spin`] that doubles the number of spin loop hints issued
/// on every step, up to `1 << 6` hints per step.
///
/// Backing off reduces traffic on the polled cache line when many threads
/// hand the lock around; measure before assuming it helps.
pub struct SpinBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl SpinBackoff {
    /// The largest shift the inner backoff counter can reach.
    const MAX: Uint = 6;
}

// Shifting by `Uint::BITS` or more overflows.
const _: () = assert!(SpinBackoff::MAX < Uint::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::default() }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.inner.saturating_spin();
        self.inner.saturating_step();
    }
}

/// A policy that backs off exponentially like [`SpinBackoff`] and, once the
/// backoff saturates, yields to the OS scheduler on every step.
///
/// Requires the standard library.
#[cfg(any(feature = "yield", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub struct YieldBackoff {
    inner: Backoff<{ Self::MAX }>,
}

#[cfg(any(feature = "yield", test))]
impl YieldBackoff {
    /// The largest shift the inner backoff counter can reach.
    const MAX: Uint = SpinBackoff::MAX;
}

// Shifting by `Uint::BITS` or more overflows.
#[cfg(any(feature = "yield", test))]
const _: () = assert!(YieldBackoff::MAX < Uint::BITS);

#[cfg(any(feature = "yield", test))]
impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::default() }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.inner.0 < Self::MAX {
            self.inner.saturating_spin();
        } else {
            thread::yield_now();
        }
        self.inner.saturating_step();
    }
}

/// Shift counter shared by the backoff policies, saturating at `MAX`.
#[derive(Default)]
struct Backoff<const MAX: Uint>(Uint);

impl<const MAX: Uint> Backoff<MAX> {
    /// Issues `1 << min(self.0, MAX)` spin loop hints.
    fn saturating_spin(&self) {
        let shifts = self.0.min(MAX);
        for _ in 0..(1 as Uint) << shifts {
            hint::spin_loop();
        }
    }

    /// Increments the shift counter unless it already reached `MAX`.
    fn saturating_step(&mut self) {
        if self.0 < MAX {
            self.0 += 1;
        }
    }
}

/// Polls `poll` until it returns `Some`, relaxing with a fresh `R` between
/// attempts, and returns the polled value.
#[inline]
pub(crate) fn wait_until<R: Relax, T>(mut poll: impl FnMut() -> Option<T>) -> T {
    let mut relax = R::new();
    loop {
        if let Some(value) = poll() {
            return value;
        }
        relax.relax();
    }
}

/// Relaxes with a fresh `R` for as long as `cond` returns `true`.
#[inline]
pub(crate) fn wait_while<R: Relax>(mut cond: impl FnMut() -> bool) {
    wait_until::<R, ()>(|| (!cond()).then_some(()));
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Backoff, Relax, Uint};

    fn returns<R: Relax, const MAX: Uint>() {
        let mut relax = R::new();
        for _ in 0..=MAX.saturating_mul(10) {
            relax.relax();
        }
    }

    #[test]
    fn spins() {
        returns::<super::Spin, 10>();
    }

    #[test]
    fn spins_backoff() {
        use super::SpinBackoff;
        const MAX: Uint = SpinBackoff::MAX;
        returns::<SpinBackoff, MAX>();
    }

    #[test]
    fn yields() {
        returns::<super::Yield, 10>();
    }

    #[test]
    fn yields_backoff() {
        use super::YieldBackoff;
        const MAX: Uint = YieldBackoff::MAX;
        returns::<YieldBackoff, MAX>();
    }

    #[test]
    fn loops() {
        returns::<super::Loop, 10>();
    }

    #[test]
    fn backoff_saturates_at_max() {
        let mut backoff = Backoff::<3>::default();
        for _ in 0..10 {
            backoff.saturating_step();
        }
        assert_eq!(backoff.0, 3);
    }

    #[test]
    fn wait_until_returns_polled_value() {
        let mut polls = 0;
        let value = super::wait_until::<super::SpinBackoff, _>(|| {
            polls += 1;
            (polls == 20).then_some(polls * 2)
        });
        assert_eq!(value, 40);
    }

    #[test]
    fn wait_while_stops_once_condition_clears() {
        let mut polls = 0;
        super::wait_while::<super::Yield>(|| {
            polls += 1;
            polls < 5
        });
        assert_eq!(polls, 5);
    }
}
