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

//! Strategies a [`Spinlock`] follows while another processor holds it.
//!
//! Every sleeping primitive in this crate guards its own small state with a
//! spinlock, so the policy chosen here only affects the few instructions it
//! takes to inspect a permit count or an owner field. Threads that actually
//! have to wait for a permit or a lock are put to sleep on a wait channel and
//! do not spin at all.
//!
//! [`Spinlock`]: crate::spinlock::Spinlock

use crate::cfg::hint;

#[cfg(any(feature = "yield", test))]
use crate::cfg::thread;

/// A trait implemented by spinning relax strategies.
///
/// # Example
///
/// ```
/// use ksynch::relax::Relax;
///
/// struct Pause;
///
/// impl Relax for Pause {
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
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// A strategy that rapidly spins while informing the CPU that it should power
/// down non-essential components via [`core::hint::spin_loop`].
///
/// This is what a kernel running on bare metal wants: spinlock critical
/// sections are a handful of instructions long and there is no scheduler
/// underneath to yield to.
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

/// A strategy that yields the current time slice to the host scheduler.
///
/// Useful when the kernel threads are simulated by host threads that may
/// outnumber the available processors, where a preempted spinlock holder
/// would otherwise make every contender burn its whole time slice.
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

/// A strategy that, as [`Spin`], runs a busy-wait loop, doubling the number
/// of spin hints issued after each failed attempt up to a fixed ceiling.
pub struct SpinBackoff {
    shifts: u32,
}

impl SpinBackoff {
    /// The largest shift the backoff counter can reach.
    const MAX: u32 = 6;
}

// The ceiling **must** be smaller than u32::BITS, or the shift overflows.
const _: () = assert!(SpinBackoff::MAX < u32::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { shifts: 0 }
    }

    #[inline(always)]
    fn relax(&mut self) {
        for _ in 0..1u32 << self.shifts {
            hint::spin_loop();
        }
        if self.shifts < Self::MAX {
            self.shifts += 1;
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::Relax;

    fn returns<R: Relax>(rounds: u32) {
        let mut relax = R::new();
        for _ in 0..rounds {
            relax.relax();
        }
    }

    #[test]
    fn spins() {
        returns::<super::Spin>(100);
    }

    #[test]
    fn spins_backoff() {
        returns::<super::SpinBackoff>(super::SpinBackoff::MAX * 10);
    }

    #[test]
    fn backoff_saturates() {
        let mut relax = super::SpinBackoff::new();
        for _ in 0..super::SpinBackoff::MAX * 3 {
            relax.relax();
        }
        assert_eq!(relax.shifts, super::SpinBackoff::MAX);
    }

    #[test]
    fn yields() {
        returns::<super::Yield>(100);
    }
}
