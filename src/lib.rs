//! Blocking synchronization primitives for a teaching kernel: counting
//! [semaphores], sleeping [locks] with owner tracking and [condition
//! variables].
//!
//! Every primitive is built from the same two pieces:
//!
//! - a [`Spinlock`], which guards the primitive's few words of state for a
//!   handful of instructions at a time; and
//! - a [`WaitChannel`], a named queue where threads sleep until another
//!   thread wakes them.
//!
//! The delicate part is going to sleep. A thread checks its condition under
//! the spinlock, decides it must wait, and has to give the spinlock up before
//! it sleeps, since the thread that will wake it needs that spinlock to
//! change the condition. If the wait channel were locked only after the
//! spinlock was released, a wakeup could slip in between and be lost. So the
//! wait channel is locked first and released only once the sleeper is
//! queued. [`WaitChannel::lock`] and [`WaitChannelGuard::sleep`] spell this
//! handoff out as two calls.
//!
//! ## Kernel threads
//!
//! The primitives do not know how threads are scheduled. Operations that may
//! sleep, or that care about ownership, take a [`Context`] describing the
//! calling kernel thread: its id, whether it is running an interrupt handler,
//! and how to block and unblock it. Sleeping from interrupt context is a
//! kernel bug and panics. With the `std` feature, [`HostThread`] implements
//! `Context` on top of an OS thread.
//!
//! ## Fairness
//!
//! No primitive is fair. A woken thread competes for the spinlock with every
//! other thread, and may find that a newcomer got there first. Callers always
//! re-check their condition after waking.
//!
//! ## Errors
//!
//! Creating a primitive allocates its name, and fails with [`CreateError`] if
//! the kernel heap is exhausted. Nothing else allocates: a sleeping thread is
//! queued through a node on its own stack. Everything else is infallible:
//! contract violations such as releasing a lock the caller does not own are
//! bugs and panic with the primitive's name.
//!
//! ## Logging
//!
//! Creation, destruction and every sleep and wakeup are traced through the
//! [`log`] facade at `trace` level, tagged with the primitive's name.
//! Destroying a lock that is still held logs a warning.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use ksynch::spins::{Cv, Lock, Spinlock};
//! use ksynch::thread::HostThread;
//!
//! // A one-slot mailbox. The spinlock makes each access to the slot safe;
//! // the lock makes checking it and going to sleep atomic.
//! struct Mailbox {
//!     lock: Lock,
//!     changed: Cv,
//!     slot: Spinlock<Option<u32>>,
//! }
//!
//! let mailbox = Arc::new(Mailbox {
//!     lock: Lock::create("mailbox").unwrap(),
//!     changed: Cv::create("mailbox").unwrap(),
//!     slot: Spinlock::new(None),
//! });
//!
//! let c_mailbox = Arc::clone(&mailbox);
//! thread::spawn(move || {
//!     let cx = HostThread::new();
//!     c_mailbox.lock.acquire(&cx);
//!     *c_mailbox.slot.lock() = Some(10);
//!     c_mailbox.changed.broadcast(&c_mailbox.lock);
//!     c_mailbox.lock.release(&cx);
//! });
//!
//! let cx = HostThread::new();
//! mailbox.lock.acquire(&cx);
//! let value = loop {
//!     if let Some(value) = mailbox.slot.lock().take() {
//!         break value;
//!     }
//!     mailbox.changed.wait(&mailbox.lock, &cx);
//! };
//! mailbox.lock.release(&cx);
//! assert_eq!(value, 10);
//! ```
//!
//! ## Features
//!
//! ### std
//!
//! Enabled by default. Links the standard library and provides
//! [`HostThread`]. Without it the crate is `no_std` and only needs `alloc`;
//! the embedding kernel implements [`Context`] for its own threads.
//!
//! ### yield
//!
//! Implies `std`. Provides [`relax::Yield`] and the [`yields`] aliases, whose
//! spinlocks give up the time slice to the OS scheduler through
//! [`std::thread::yield_now`] instead of busy-waiting with
//! [`core::hint::spin_loop`]. Useful when running the primitives on a host
//! with more threads than processors.
//!
//! [semaphores]: semaphore::Semaphore
//! [locks]: lock::Lock
//! [condition variables]: cv::Cv
//! [`Spinlock`]: spinlock::Spinlock
//! [`WaitChannel`]: wchan::WaitChannel
//! [`WaitChannel::lock`]: wchan::WaitChannel::lock
//! [`WaitChannelGuard::sleep`]: wchan::WaitChannelGuard::sleep
//! [`Context`]: thread::Context
//! [`HostThread`]: thread::HostThread
//! [`relax::Yield`]: relax::Yield

#![no_std]
#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

#[cfg(any(feature = "std", loom, test))]
extern crate std;

pub mod cv;
pub mod lock;
pub mod relax;
pub mod semaphore;
pub mod spinlock;
pub mod thread;
pub mod wchan;

mod error;
pub use error::CreateError;

pub(crate) mod cfg;

#[cfg(all(not(loom), test))]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;

/// Primitives whose spinlocks implement the [`Spin`] relax policy.
///
/// During spinlock contention, processors spin while signaling that they are
/// running a busy-wait spin-loop.
///
/// [`Spin`]: crate::relax::Spin
pub mod spins {
    use crate::relax::Spin;
    use crate::{cv, lock, semaphore, spinlock, wchan};

    /// A [`semaphore::Semaphore`] that implements the [`Spin`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use ksynch::spins::Semaphore;
    /// use ksynch::thread::HostThread;
    ///
    /// let cx = HostThread::new();
    /// let sem = Semaphore::create("slots", 1).unwrap();
    /// sem.p(&cx);
    /// assert_eq!(sem.count(), 0);
    /// sem.v();
    /// ```
    pub type Semaphore = semaphore::Semaphore<Spin>;

    /// A [`lock::Lock`] that implements the [`Spin`] relax policy.
    pub type Lock = lock::Lock<Spin>;

    /// A [`cv::Cv`] that implements the [`Spin`] relax policy.
    pub type Cv = cv::Cv<Spin>;

    /// A [`wchan::WaitChannel`] that implements the [`Spin`] relax policy.
    pub type WaitChannel = wchan::WaitChannel<Spin>;

    /// A [`spinlock::Spinlock`] that implements the [`Spin`] relax policy.
    ///
    /// # Example
    ///
    /// ```
    /// use ksynch::spins::Spinlock;
    ///
    /// let lock = Spinlock::new(0);
    /// *lock.lock() += 1;
    /// assert_eq!(*lock.lock(), 1);
    /// ```
    pub type Spinlock<T> = spinlock::Spinlock<T, Spin>;

    /// Primitives whose spinlocks implement the [`SpinBackoff`] relax policy.
    ///
    /// During spinlock contention, processors perform exponential backoff
    /// while spinning.
    ///
    /// [`SpinBackoff`]: crate::relax::SpinBackoff
    pub mod backoff {
        use crate::relax::SpinBackoff;
        use crate::{cv, lock, semaphore, spinlock, wchan};

        /// A [`semaphore::Semaphore`] that implements the [`SpinBackoff`]
        /// relax policy.
        pub type Semaphore = semaphore::Semaphore<SpinBackoff>;

        /// A [`lock::Lock`] that implements the [`SpinBackoff`] relax policy.
        pub type Lock = lock::Lock<SpinBackoff>;

        /// A [`cv::Cv`] that implements the [`SpinBackoff`] relax policy.
        pub type Cv = cv::Cv<SpinBackoff>;

        /// A [`wchan::WaitChannel`] that implements the [`SpinBackoff`] relax
        /// policy.
        pub type WaitChannel = wchan::WaitChannel<SpinBackoff>;

        /// A [`spinlock::Spinlock`] that implements the [`SpinBackoff`] relax
        /// policy.
        pub type Spinlock<T> = spinlock::Spinlock<T, SpinBackoff>;
    }
}

/// Primitives whose spinlocks implement the [`Yield`] relax policy.
///
/// During spinlock contention, threads yield the current time slice to the
/// OS scheduler.
///
/// [`Yield`]: crate::relax::Yield
#[cfg(any(feature = "yield", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "yield")))]
pub mod yields {
    use crate::relax::Yield;
    use crate::{cv, lock, semaphore, spinlock, wchan};

    /// A [`semaphore::Semaphore`] that implements the [`Yield`] relax policy.
    pub type Semaphore = semaphore::Semaphore<Yield>;

    /// A [`lock::Lock`] that implements the [`Yield`] relax policy.
    pub type Lock = lock::Lock<Yield>;

    /// A [`cv::Cv`] that implements the [`Yield`] relax policy.
    pub type Cv = cv::Cv<Yield>;

    /// A [`wchan::WaitChannel`] that implements the [`Yield`] relax policy.
    pub type WaitChannel = wchan::WaitChannel<Yield>;

    /// A [`spinlock::Spinlock`] that implements the [`Yield`] relax policy.
    pub type Spinlock<T> = spinlock::Spinlock<T, Yield>;
}
