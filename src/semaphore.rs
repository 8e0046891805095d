//! Counting semaphores.
//!
//! A [`Semaphore`] holds a number of permits. [`p`] takes one, sleeping until
//! one is available; [`v`] returns one and wakes a sleeper. A semaphore
//! created with zero permits is an event: one thread sleeps in `p` until
//! another announces completion with `v`.
//!
//! Permits are not handed to sleepers in arrival order. A thread that calls
//! `p` right after a `v` may take the permit before a thread that has been
//! sleeping for a while gets to run; the sleeper then finds the count at zero
//! and goes back to sleep.
//!
//! [`p`]: Semaphore::p
//! [`v`]: Semaphore::v

use core::fmt::{self, Debug, Formatter};

use crate::error::CreateError;
use crate::relax::Relax;
use crate::spinlock::Spinlock;
use crate::thread::Context;
use crate::wchan::WaitChannel;

/// A counting semaphore.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use ksynch::spins::Semaphore;
/// use ksynch::thread::HostThread;
///
/// const WORKERS: usize = 4;
///
/// // Counts finished workers; the main thread waits for all of them.
/// let done = Arc::new(Semaphore::create("workers done", 0).unwrap());
///
/// for _ in 0..WORKERS {
///     let done = Arc::clone(&done);
///     thread::spawn(move || {
///         // ... work ...
///         done.v();
///     });
/// }
///
/// let cx = HostThread::new();
/// for _ in 0..WORKERS {
///     done.p(&cx);
/// }
/// assert_eq!(done.count(), 0);
/// ```
pub struct Semaphore<R> {
    count: Spinlock<usize, R>,
    wchan: WaitChannel<R>,
}

impl<R> Semaphore<R> {
    /// Creates a semaphore named `name` holding `initial` permits.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`] if the kernel heap is exhausted.
    pub fn create(name: &str, initial: usize) -> Result<Self, CreateError> {
        let wchan = WaitChannel::create(name)?;
        log::trace!("semaphore `{name}` created with {initial} permit(s)");
        Ok(Self { count: Spinlock::new(initial), wchan })
    }

    /// Returns the name this semaphore was created with.
    #[inline]
    pub fn name(&self) -> &str {
        self.wchan.name()
    }

    /// Destroys the semaphore.
    ///
    /// # Panics
    ///
    /// Panics if a thread is sleeping in [`p`](Self::p).
    pub fn destroy(self) {
        log::trace!("semaphore `{}` destroyed", self.name());
        let Self { count, wchan } = self;
        drop(count);
        wchan.destroy();
    }
}

impl<R: Relax> Semaphore<R> {
    /// Takes a permit, sleeping until one is available.
    ///
    /// # Panics
    ///
    /// Panics if called from interrupt context, even when a permit is
    /// available and the call would not sleep.
    pub fn p<C: Context + ?Sized>(&self, cx: &C) {
        assert!(!cx.in_interrupt(), "semaphore `{}`: P in interrupt context", self.name());

        let mut count = self.count.lock();
        while count.with(|count| *count == 0) {
            let wchan = self.wchan.lock();
            drop(count);
            wchan.sleep(cx);
            count = self.count.lock();
        }
        count.with_mut(|count| self.take_permit(count));
    }

    /// Takes one permit out of `count`, which must be guarded by the
    /// semaphore's spinlock.
    fn take_permit(&self, count: &mut usize) {
        assert!(*count > 0, "semaphore `{}`: P with no permit", self.name());
        *count -= 1;
    }

    /// Returns a permit, waking one sleeper if there is any.
    ///
    /// # Panics
    ///
    /// Panics if the permit count overflows.
    pub fn v(&self) {
        let mut count = self.count.lock();
        count.with_mut(|count| {
            let Some(next) = count.checked_add(1) else {
                panic!("semaphore `{}`: permit count overflow", self.name());
            };
            *count = next;
        });
        self.wchan.wake_one();
    }

    /// Returns the number of available permits.
    ///
    /// The value is a snapshot and may be out of date as soon as it is
    /// returned.
    pub fn count(&self) -> usize {
        self.count.lock().with(|count| *count)
    }
}

impl<R: Relax> Debug for Semaphore<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.name())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::format;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;
    use std::vec::Vec;

    use crate::error::CreateError;
    use crate::relax::{Spin, SpinBackoff, Yield};
    use crate::test::{allocations_in, out_of_memory, settle, spawn_kthread, tests};
    use crate::thread::HostThread;

    type Semaphore = super::Semaphore<Yield>;

    #[test]
    fn lots_and_lots_spin() {
        tests::lots_and_lots_semaphore::<Spin>();
    }

    #[test]
    fn lots_and_lots_spin_backoff() {
        tests::lots_and_lots_semaphore::<SpinBackoff>();
    }

    #[test]
    fn lots_and_lots_yield() {
        tests::lots_and_lots_semaphore::<Yield>();
    }

    #[test]
    fn balanced_sequence_restores_count() {
        let cx = HostThread::new();
        let sem = Semaphore::create("balanced", 3).unwrap();
        for _ in 0..3 {
            sem.p(&cx);
        }
        assert_eq!(sem.count(), 0);
        for _ in 0..3 {
            sem.v();
        }
        sem.p(&cx);
        sem.v();
        assert_eq!(sem.count(), 3);
        sem.destroy();
    }

    #[test]
    fn initial_count_bounds_concurrent_p() {
        const PERMITS: usize = 3;
        let cx = HostThread::new();
        let sem = Arc::new(Semaphore::create("bounded", PERMITS).unwrap());
        for _ in 0..PERMITS {
            sem.p(&cx);
        }
        let passed = Arc::new(AtomicBool::new(false));
        let (c_sem, c_passed) = (sem.clone(), passed.clone());
        let handle = spawn_kthread(move |cx| {
            c_sem.p(cx);
            c_passed.store(true, SeqCst);
        });
        settle();
        assert!(!passed.load(SeqCst));
        sem.v();
        handle.join().unwrap();
        assert!(passed.load(SeqCst));
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn binary_semaphore_blocks_second_p() {
        let sem = Arc::new(Semaphore::create("binary", 1).unwrap());
        let entered = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (sem, entered) = (sem.clone(), entered.clone());
                spawn_kthread(move |cx| {
                    sem.p(cx);
                    entered.fetch_add(1, SeqCst);
                })
            })
            .collect();
        while entered.load(SeqCst) < 1 {
            settle();
        }
        settle();
        assert_eq!(entered.load(SeqCst), 1);
        sem.v();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(entered.load(SeqCst), 2);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn name_and_debug() {
        let sem = Semaphore::create("tty", 2).unwrap();
        assert_eq!(sem.name(), "tty");
        assert_eq!(format!("{sem:?}"), r#"Semaphore { name: "tty", count: 2 }"#);
    }

    #[test]
    #[should_panic(expected = "P in interrupt context")]
    fn p_in_interrupt_panics() {
        let cx = HostThread::new();
        let sem = Semaphore::create("irq", 1).unwrap();
        cx.interrupt(|| sem.p(&cx));
    }

    #[test]
    #[should_panic(expected = "semaphore `empty`: P with no permit")]
    fn taking_missing_permit_panics() {
        let sem = Semaphore::create("empty", 0).unwrap();
        let mut count = 0;
        sem.take_permit(&mut count);
    }

    #[test]
    fn blocking_p_does_not_allocate() {
        let sem = Arc::new(Semaphore::create("no alloc", 0).unwrap());
        let c_sem = sem.clone();
        let handle = spawn_kthread(move |cx| allocations_in(|| c_sem.p(cx)));
        while sem.wchan.is_empty() {
            settle();
        }
        assert_eq!(allocations_in(|| sem.v()), 0);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn create_out_of_memory_is_reported() {
        let err = out_of_memory(|| Semaphore::create("oom", 1)).unwrap_err();
        assert!(matches!(err, CreateError::Name(_)));
    }

    #[test]
    #[should_panic(expected = "permit count overflow")]
    fn v_overflow_panics() {
        let sem = Semaphore::create("full", usize::MAX).unwrap();
        sem.v();
    }

    #[test]
    #[should_panic(expected = "destroyed with 1 sleeper(s)")]
    fn destroy_with_sleeper_panics() {
        let cx = HostThread::new();
        let sem = Semaphore::create("busy", 0).unwrap();
        sem.wchan.lock().enqueue_stray(&cx);
        sem.destroy();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn semaphore_handoff() {
        models::semaphore_handoff::<Yield>();
    }
}
