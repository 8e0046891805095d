//! Sleeping mutual exclusion locks with owner tracking.
//!
//! A [`Lock`] is held by at most one thread at a time, and it remembers which
//! one. Contending threads sleep on the lock's wait channel instead of
//! spinning, so a lock may be held across long operations. Because the owner
//! is recorded, misuse is caught on the spot: acquiring a lock the caller
//! already holds, or releasing one it does not hold, panics instead of
//! deadlocking or corrupting the lock.
//!
//! As with [`Semaphore`], a released lock is not handed over to the thread
//! that has been sleeping longest: whichever thread gets to the lock's
//! spinlock first takes it.
//!
//! [`Semaphore`]: crate::semaphore::Semaphore

use core::fmt::{self, Debug, Formatter};

use crate::error::CreateError;
use crate::relax::Relax;
use crate::spinlock::Spinlock;
use crate::thread::{Context, ThreadId};
use crate::wchan::WaitChannel;

/// Lock state, guarded by the lock's spinlock.
///
/// `owner` is `Some` exactly when `held` is `true`.
#[derive(Debug, Default)]
struct State {
    held: bool,
    owner: Option<ThreadId>,
}

impl State {
    fn is_owner(&self, me: ThreadId) -> bool {
        debug_assert_eq!(self.held, self.owner.is_some());
        self.owner == Some(me)
    }
}

/// A sleeping mutual exclusion lock.
///
/// The lock protects no data of its own: callers acquire it around whatever
/// state they share, and pass it to a [`Cv`] to wait for that state to
/// change.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::thread;
///
/// use ksynch::spins::Lock;
/// use ksynch::thread::HostThread;
///
/// let lock = Arc::new(Lock::create("counter").unwrap());
/// let counter = Arc::new(AtomicUsize::new(0));
///
/// let handles: Vec<_> = (0..4)
///     .map(|_| {
///         let (lock, counter) = (Arc::clone(&lock), Arc::clone(&counter));
///         thread::spawn(move || {
///             let cx = HostThread::new();
///             lock.acquire(&cx);
///             assert!(lock.is_held_by_caller(&cx));
///             // Read-modify-write made atomic by the lock.
///             let value = counter.load(Ordering::Relaxed);
///             counter.store(value + 1, Ordering::Relaxed);
///             lock.release(&cx);
///         })
///     })
///     .collect();
///
/// for handle in handles {
///     handle.join().unwrap();
/// }
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
///
/// [`Cv`]: crate::cv::Cv
pub struct Lock<R> {
    state: Spinlock<State, R>,
    wchan: WaitChannel<R>,
}

impl<R> Lock<R> {
    /// Creates an unheld lock named `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`] if the kernel heap is exhausted.
    pub fn create(name: &str) -> Result<Self, CreateError> {
        let wchan = WaitChannel::create(name)?;
        log::trace!("lock `{name}` created");
        Ok(Self { state: Spinlock::new(State::default()), wchan })
    }

    /// Returns the name this lock was created with.
    #[inline]
    pub fn name(&self) -> &str {
        self.wchan.name()
    }

    /// Destroys the lock.
    ///
    /// The owner record is cleared before anything else is torn down.
    ///
    /// # Panics
    ///
    /// Panics if a thread is sleeping in [`acquire`](Self::acquire).
    pub fn destroy(self) {
        let Self { mut state, wchan } = self;
        let owner = state.with_exclusive(|state| {
            state.held = false;
            state.owner.take()
        });
        if let Some(owner) = owner {
            log::warn!("lock `{}` destroyed while held by {owner}", wchan.name());
        }
        log::trace!("lock `{}` destroyed", wchan.name());
        drop(state);
        wchan.destroy();
    }
}

impl<R: Relax> Lock<R> {
    /// Acquires the lock, sleeping until it is available.
    ///
    /// # Panics
    ///
    /// Panics if the caller already holds the lock, or if called from
    /// interrupt context.
    pub fn acquire<C: Context + ?Sized>(&self, cx: &C) {
        let me = cx.thread_id();
        assert!(!cx.in_interrupt(), "lock `{}`: acquire in interrupt context", self.name());

        let mut state = self.state.lock();
        let reentrant = state.with(|state| state.is_owner(me));
        assert!(!reentrant, "lock `{}`: {me} acquires it again", self.name());
        while state.with(|state| state.held) {
            let wchan = self.wchan.lock();
            drop(state);
            wchan.sleep(cx);
            state = self.state.lock();
        }
        state.with_mut(|state| {
            state.held = true;
            state.owner = Some(me);
        });
    }

    /// Releases the lock, waking one thread sleeping in [`acquire`].
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold the lock.
    ///
    /// [`acquire`]: Lock::acquire
    pub fn release<C: Context + ?Sized>(&self, cx: &C) {
        let me = cx.thread_id();
        let mut state = self.state.lock();
        let owned = state.with(|state| state.is_owner(me));
        assert!(owned, "lock `{}`: released by non-owner {me}", self.name());
        state.with_mut(|state| {
            state.held = false;
            state.owner = None;
        });
        self.wchan.wake_one();
    }

    /// Returns `true` if the calling thread holds this lock.
    pub fn is_held_by_caller<C: Context + ?Sized>(&self, cx: &C) -> bool {
        let me = cx.thread_id();
        self.state.lock().with(|state| state.is_owner(me))
    }

    /// Acquires the lock, runs `f` and releases the lock again.
    ///
    /// The lock is released even if `f` panics.
    ///
    /// # Examples
    ///
    /// ```
    /// use ksynch::spins::Lock;
    /// use ksynch::thread::HostThread;
    ///
    /// let cx = HostThread::new();
    /// let lock = Lock::create("config").unwrap();
    /// let held = lock.lock_with(&cx, || lock.is_held_by_caller(&cx));
    /// assert!(held);
    /// assert!(!lock.is_held_by_caller(&cx));
    /// ```
    pub fn lock_with<C, F, Ret>(&self, cx: &C, f: F) -> Ret
    where
        C: Context + ?Sized,
        F: FnOnce() -> Ret,
    {
        struct Release<'a, R: Relax, C: Context + ?Sized> {
            lock: &'a Lock<R>,
            cx: &'a C,
        }

        impl<R: Relax, C: Context + ?Sized> Drop for Release<'_, R, C> {
            fn drop(&mut self) {
                self.lock.release(self.cx);
            }
        }

        self.acquire(cx);
        let _release = Release { lock: self, cx };
        f()
    }
}

impl<R: Relax> Debug for Lock<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (held, owner) = self.state.lock().with(|state| (state.held, state.owner));
        f.debug_struct("Lock")
            .field("name", &self.name())
            .field("held", &held)
            .field("owner", &owner)
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::format;
    use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
    use std::sync::Arc;

    use crate::error::CreateError;
    use crate::relax::{Spin, SpinBackoff, Yield};
    use crate::test::{allocations_in, out_of_memory, settle, spawn_kthread, tests};
    use crate::thread::HostThread;

    type Lock = super::Lock<Yield>;

    #[test]
    fn lots_and_lots_spin() {
        tests::lots_and_lots_lock::<Spin>();
    }

    #[test]
    fn lots_and_lots_spin_backoff() {
        tests::lots_and_lots_lock::<SpinBackoff>();
    }

    #[test]
    fn lots_and_lots_yield() {
        tests::lots_and_lots_lock::<Yield>();
    }

    #[test]
    fn smoke() {
        let cx = HostThread::new();
        let lock = Lock::create("smoke").unwrap();
        assert!(!lock.is_held_by_caller(&cx));
        lock.acquire(&cx);
        assert!(lock.is_held_by_caller(&cx));
        lock.release(&cx);
        assert!(!lock.is_held_by_caller(&cx));
        lock.acquire(&cx);
        lock.release(&cx);
        lock.destroy();
    }

    #[test]
    fn ownership_is_per_thread() {
        let (a, b) = (HostThread::new(), HostThread::new());
        let lock = Lock::create("owned").unwrap();
        lock.acquire(&a);
        assert!(lock.is_held_by_caller(&a));
        assert!(!lock.is_held_by_caller(&b));
        lock.release(&a);
    }

    #[test]
    fn release_hands_over_to_blocked_acquirer() {
        let a = HostThread::new();
        let lock = Arc::new(Lock::create("handover").unwrap());
        lock.acquire(&a);

        let acquired = Arc::new(AtomicBool::new(false));
        let release = Arc::new(AtomicBool::new(false));
        let (c_lock, c_acquired, c_release) = (lock.clone(), acquired.clone(), release.clone());
        let handle = spawn_kthread(move |b| {
            c_lock.acquire(b);
            assert!(c_lock.is_held_by_caller(b));
            c_acquired.store(true, SeqCst);
            while !c_release.load(SeqCst) {
                settle();
            }
            c_lock.release(b);
        });

        settle();
        assert!(!acquired.load(SeqCst));
        lock.release(&a);
        while !acquired.load(SeqCst) {
            settle();
        }
        assert!(!lock.is_held_by_caller(&a));
        release.store(true, SeqCst);
        handle.join().unwrap();
        assert_eq!(format!("{lock:?}"), r#"Lock { name: "handover", held: false, owner: None }"#);
    }

    #[test]
    fn lock_with_returns_closure_value() {
        let cx = HostThread::new();
        let lock = Lock::create("with").unwrap();
        assert_eq!(lock.lock_with(&cx, || 7), 7);
        assert!(!lock.is_held_by_caller(&cx));
    }

    #[test]
    fn lock_with_releases_on_unwind() {
        let lock = Arc::new(Lock::create("unwind").unwrap());
        let c_lock = lock.clone();
        let _ = spawn_kthread(move |cx| c_lock.lock_with(cx, || panic!())).join();
        let cx = HostThread::new();
        lock.acquire(&cx);
        lock.release(&cx);
    }

    #[test]
    fn destroy_clears_owner() {
        let cx = HostThread::new();
        let lock = Lock::create("teardown").unwrap();
        lock.acquire(&cx);
        lock.destroy();
    }

    #[test]
    fn contended_acquire_does_not_allocate() {
        let a = HostThread::new();
        let lock = Arc::new(Lock::create("no alloc").unwrap());
        lock.acquire(&a);
        let c_lock = lock.clone();
        let handle = spawn_kthread(move |b| {
            allocations_in(|| {
                c_lock.acquire(b);
                c_lock.release(b);
            })
        });
        while lock.wchan.is_empty() {
            settle();
        }
        assert_eq!(allocations_in(|| lock.release(&a)), 0);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn create_out_of_memory_is_reported() {
        let err = out_of_memory(|| Lock::create("oom")).unwrap_err();
        assert!(matches!(err, CreateError::Name(_)));
    }

    #[test]
    #[should_panic(expected = "acquires it again")]
    fn reacquire_panics() {
        let cx = HostThread::new();
        let lock = Lock::create("reentrant").unwrap();
        lock.acquire(&cx);
        lock.acquire(&cx);
    }

    #[test]
    #[should_panic(expected = "released by non-owner")]
    fn release_by_non_owner_panics() {
        let (a, b) = (HostThread::new(), HostThread::new());
        let lock = Lock::create("stolen").unwrap();
        lock.acquire(&a);
        lock.release(&b);
    }

    #[test]
    #[should_panic(expected = "released by non-owner")]
    fn release_unheld_panics() {
        let cx = HostThread::new();
        let lock = Lock::create("unheld").unwrap();
        lock.release(&cx);
    }

    #[test]
    #[should_panic(expected = "acquire in interrupt context")]
    fn acquire_in_interrupt_panics() {
        let cx = HostThread::new();
        let lock = Lock::create("irq").unwrap();
        cx.interrupt(|| lock.acquire(&cx));
    }

    #[test]
    #[should_panic(expected = "destroyed with 1 sleeper(s)")]
    fn destroy_with_sleeper_panics() {
        let cx = HostThread::new();
        let lock = Lock::create("busy").unwrap();
        lock.wchan.lock().enqueue_stray(&cx);
        lock.destroy();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn lock_exclusion() {
        models::lock_exclusion::<Yield>();
    }
}
