//! Busy-waiting mutual exclusion for short critical sections.
//!
//! A [`Spinlock`] never puts the caller to sleep: a contending processor
//! polls the lock word until the holder releases it, following the [`Relax`]
//! policy between polls. It is the only kind of lock the sleeping primitives
//! of this crate hold while deciding whether to block, and it is held across
//! exactly one boundary: the handoff into a wait channel, where the channel is
//! locked before the spinlock guard is dropped.
//!
//! The lock is held for as long as its RAII guard is in scope. Dropping the
//! guard, including during unwinding, releases it.
//!
//! [`Relax`]: crate::relax::Relax

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};
use crate::relax::Relax;

/// A test-and-test-and-set spinlock protecting a value of type `T`.
///
/// # Examples
///
/// ```
/// use ksynch::relax::Spin;
/// use ksynch::spinlock::Spinlock;
///
/// let count = Spinlock::<_, Spin>::new(0usize);
/// {
///     let mut guard = count.lock();
///     *guard += 1;
/// }
/// assert_eq!(*count.lock(), 1);
/// ```
pub struct Spinlock<T, R> {
    locked: AtomicBool,
    relax: PhantomData<R>,
    data: UnsafeCell<T>,
}

// Same unsafe impls as `std::sync::Mutex`.
unsafe impl<T: Send, R> Send for Spinlock<T, R> {}
unsafe impl<T: Send, R> Sync for Spinlock<T, R> {}

impl<T, R> Spinlock<T, R> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub fn new(value: T) -> Self {
        let locked = AtomicBool::new(false);
        let data = UnsafeCell::new(value);
        Self { locked, relax: PhantomData, data }
    }

    /// Returns `true` if some processor currently holds the lock.
    ///
    /// The answer may be stale by the time the caller looks at it; it is
    /// meant for assertions and diagnostics.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }

    /// Runs `f` against the protected value without locking.
    ///
    /// The exclusive borrow of `self` statically guarantees that no guard
    /// exists.
    pub(crate) fn with_exclusive<F, Ret>(&mut self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        // SAFETY: We hold exclusive access to the spinlock.
        unsafe { self.data.with_mut_unchecked(f) }
    }
}

impl<T, R: Relax> Spinlock<T, R> {
    /// Acquires the spinlock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T, R> {
        let mut relax = R::new();
        while self.locked.compare_exchange_weak(false, true, Acquire, Relaxed).is_err() {
            // Poll with plain loads so contenders keep the line shared.
            while self.locked.load(Relaxed) {
                relax.relax();
            }
        }
        SpinlockGuard::new(self)
    }

    /// Attempts to acquire the spinlock without spinning.
    ///
    /// Returns `None` if the lock is currently held.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T, R>> {
        self.locked
            .compare_exchange(false, true, Acquire, Relaxed)
            .is_ok()
            .then(|| SpinlockGuard::new(self))
    }
}

impl<T: Default, R> Default for Spinlock<T, R> {
    /// Creates a `Spinlock<T, R>`, with the `Default` value for `T`.
    #[inline]
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T: Debug, R: Relax> Debug for Spinlock<T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Spinlock");
        match self.try_lock() {
            Some(guard) => guard.with(|data| {
                d.field("data", data);
            }),
            None => {
                d.field("data", &format_args!("<locked>"));
            }
        }
        d.finish()
    }
}

/// An RAII implementation of a "scoped lock" of a spinlock. When this
/// structure is dropped (falls out of scope), the lock will be released.
///
/// This structure is returned by the [`lock`] and [`try_lock`] methods on
/// [`Spinlock`].
///
/// [`lock`]: Spinlock::lock
/// [`try_lock`]: Spinlock::try_lock
#[must_use = "if unused the Spinlock will immediately unlock"]
pub struct SpinlockGuard<'a, T, R> {
    lock: &'a Spinlock<T, R>,
}

// Same unsafe Sync impl as `std::sync::MutexGuard`.
unsafe impl<T: Sync, R> Sync for SpinlockGuard<'_, T, R> {}

impl<'a, T, R> SpinlockGuard<'a, T, R> {
    /// Creates a new `SpinlockGuard` instance.
    const fn new(lock: &'a Spinlock<T, R>) -> Self {
        Self { lock }
    }

    /// Runs `f` against a shared reference to the protected value.
    pub fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { self.lock.data.with_unchecked(f) }
    }

    /// Runs `f` against an exclusive reference to the protected value.
    pub fn with_mut<F, Ret>(&mut self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        // SAFETY: A guard instance holds the lock locked, and the guard is
        // exclusively borrowed.
        unsafe { self.lock.data.with_mut_unchecked(f) }
    }
}

impl<T, R> Drop for SpinlockGuard<'_, T, R> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Release);
    }
}

impl<T: Debug, R> Debug for SpinlockGuard<'_, T, R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.with(|data| data.fmt(f))
    }
}

#[cfg(not(all(loom, test)))]
impl<T, R> core::ops::Deref for SpinlockGuard<'_, T, R> {
    type Target = T;

    /// Dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref(&self) -> &T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &*self.lock.data.get() }
    }
}

#[cfg(not(all(loom, test)))]
impl<T, R> core::ops::DerefMut for SpinlockGuard<'_, T, R> {
    /// Mutably dereferences the guard to access the underlying data.
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: A guard instance holds the lock locked.
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::format;
    use std::sync::Arc;
    use std::thread;

    use crate::relax::{Spin, SpinBackoff, Yield};
    use crate::test::tests;

    use super::Spinlock;

    #[test]
    fn lots_and_lots_spin() {
        tests::lots_and_lots_spinlock::<Spin>();
    }

    #[test]
    fn lots_and_lots_spin_backoff() {
        tests::lots_and_lots_spinlock::<SpinBackoff>();
    }

    #[test]
    fn lots_and_lots_yield() {
        tests::lots_and_lots_spinlock::<Yield>();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Spinlock::<_, Spin>::new(1);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(lock.try_lock().map(|guard| *guard), Some(1));
    }

    #[test]
    fn guard_released_on_unwind() {
        let lock = Arc::new(Spinlock::<_, Spin>::new(0));
        let c_lock = Arc::clone(&lock);
        let _ = thread::spawn(move || {
            let mut guard = c_lock.lock();
            *guard += 1;
            panic!();
        })
        .join();
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn debug_shows_locked() {
        let lock = Spinlock::<_, Spin>::new(42);
        assert_eq!(format!("{lock:?}"), "Spinlock { data: 42 }");
        let guard = lock.lock();
        assert_eq!(format!("{lock:?}"), "Spinlock { data: <locked> }");
        assert_eq!(format!("{guard:?}"), "42");
    }

    #[test]
    fn default_value() {
        let mut lock: Spinlock<u32, Spin> = Spinlock::default();
        assert_eq!(lock.with_exclusive(|data| *data), 0);
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn spinlock_join() {
        models::spinlock_join::<Yield>();
    }
}
