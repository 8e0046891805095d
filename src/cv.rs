//! Condition variables.
//!
//! A [`Cv`] lets a thread holding a [`Lock`] sleep until another thread
//! reports that the state protected by that lock has changed. The CV keeps
//! no state of its own besides its sleepers: it does not remember signals
//! sent while nobody was waiting, and it is not tied to any particular lock.
//! The lock is supplied on every call, so one CV may be used with different
//! locks at different times.
//!
//! The usual pattern re-checks the condition in a loop, since a woken thread
//! has to compete for the lock again and may find the condition false by the
//! time it gets it:
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::thread;
//!
//! use ksynch::spins::{Cv, Lock};
//! use ksynch::thread::HostThread;
//!
//! let pair = Arc::new((Lock::create("ready").unwrap(), Cv::create("ready").unwrap()));
//! let ready = Arc::new(AtomicBool::new(false));
//!
//! let (c_pair, c_ready) = (Arc::clone(&pair), Arc::clone(&ready));
//! thread::spawn(move || {
//!     let cx = HostThread::new();
//!     let (lock, cv) = &*c_pair;
//!     lock.acquire(&cx);
//!     c_ready.store(true, Ordering::Relaxed);
//!     cv.signal(lock);
//!     lock.release(&cx);
//! });
//!
//! let cx = HostThread::new();
//! let (lock, cv) = &*pair;
//! lock.acquire(&cx);
//! while !ready.load(Ordering::Relaxed) {
//!     cv.wait(lock, &cx);
//! }
//! lock.release(&cx);
//! ```
//!
//! [`Lock`]: crate::lock::Lock

use core::fmt::{self, Debug, Formatter};

use crate::error::CreateError;
use crate::lock::Lock;
use crate::relax::Relax;
use crate::thread::Context;
use crate::wchan::WaitChannel;

/// A condition variable.
pub struct Cv<R> {
    wchan: WaitChannel<R>,
}

impl<R> Cv<R> {
    /// Creates a condition variable named `name` with no waiters.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`] if the kernel heap is exhausted.
    pub fn create(name: &str) -> Result<Self, CreateError> {
        let wchan = WaitChannel::create(name)?;
        log::trace!("cv `{name}` created");
        Ok(Self { wchan })
    }

    /// Returns the name this condition variable was created with.
    #[inline]
    pub fn name(&self) -> &str {
        self.wchan.name()
    }

    /// Destroys the condition variable.
    ///
    /// # Panics
    ///
    /// Panics if a thread is sleeping in [`wait`](Self::wait).
    pub fn destroy(self) {
        log::trace!("cv `{}` destroyed", self.name());
        self.wchan.destroy();
    }
}

impl<R: Relax> Cv<R> {
    /// Releases `lock`, sleeps until signaled, then reacquires `lock`.
    ///
    /// The CV's wait channel is locked before `lock` is released, so a
    /// signal sent by a thread that acquires `lock` after this call gave it
    /// up always finds the caller queued. Returns with `lock` held, whatever
    /// woke the caller.
    ///
    /// # Panics
    ///
    /// Panics if the caller does not hold `lock`, or if called from
    /// interrupt context.
    pub fn wait<L, C>(&self, lock: &Lock<L>, cx: &C)
    where
        L: Relax,
        C: Context + ?Sized,
    {
        assert!(!cx.in_interrupt(), "cv `{}`: wait in interrupt context", self.name());
        let held = lock.is_held_by_caller(cx);
        assert!(held, "cv `{}`: wait without holding lock `{}`", self.name(), lock.name());

        let wchan = self.wchan.lock();
        lock.release(cx);
        wchan.sleep(cx);
        lock.acquire(cx);
    }

    /// Wakes one thread waiting on this CV, if any.
    ///
    /// `lock` is the lock the waiters use; the caller is expected, but not
    /// required, to hold it. A signal with no waiters is lost.
    pub fn signal<L: Relax>(&self, lock: &Lock<L>) {
        log::trace!("cv `{}`: signal (lock `{}`)", self.name(), lock.name());
        self.wchan.wake_one();
    }

    /// Wakes every thread waiting on this CV at the time of the call.
    ///
    /// Same contract as [`signal`](Self::signal).
    pub fn broadcast<L: Relax>(&self, lock: &Lock<L>) {
        log::trace!("cv `{}`: broadcast (lock `{}`)", self.name(), lock.name());
        self.wchan.wake_all();
    }
}

impl<R> Debug for Cv<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cv").field("name", &self.name()).finish()
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

    type Cv = super::Cv<Yield>;
    type Lock = crate::lock::Lock<Yield>;

    #[test]
    fn ping_pong_spin() {
        tests::ping_pong_cv::<Spin>();
    }

    #[test]
    fn ping_pong_spin_backoff() {
        tests::ping_pong_cv::<SpinBackoff>();
    }

    #[test]
    fn ping_pong_yield() {
        tests::ping_pong_cv::<Yield>();
    }

    #[test]
    fn wait_returns_with_lock_held() {
        let pair = Arc::new((Lock::create("held").unwrap(), Cv::create("held").unwrap()));
        let waiting = Arc::new(AtomicBool::new(false));
        let (c_pair, c_waiting) = (pair.clone(), waiting.clone());
        let handle = spawn_kthread(move |cx| {
            let (lock, cv) = &*c_pair;
            lock.acquire(cx);
            c_waiting.store(true, SeqCst);
            cv.wait(lock, cx);
            let held = lock.is_held_by_caller(cx);
            lock.release(cx);
            held
        });

        let cx = HostThread::new();
        let (lock, cv) = &*pair;
        while !waiting.load(SeqCst) {
            settle();
        }
        // The waiter is queued once it has given the lock up.
        lock.acquire(&cx);
        cv.signal(lock);
        lock.release(&cx);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn signal_without_waiters_is_forgotten() {
        let pair = Arc::new((Lock::create("forget").unwrap(), Cv::create("forget").unwrap()));
        let (lock, cv) = &*pair;
        cv.signal(lock);
        cv.broadcast(lock);

        let waiting = Arc::new(AtomicBool::new(false));
        let returned = Arc::new(AtomicBool::new(false));
        let (c_pair, c_waiting, c_returned) = (pair.clone(), waiting.clone(), returned.clone());
        let handle = spawn_kthread(move |cx| {
            let (lock, cv) = &*c_pair;
            lock.acquire(cx);
            c_waiting.store(true, SeqCst);
            cv.wait(lock, cx);
            c_returned.store(true, SeqCst);
            lock.release(cx);
        });

        let cx = HostThread::new();
        while !waiting.load(SeqCst) {
            settle();
        }
        lock.acquire(&cx);
        lock.release(&cx);
        settle();
        assert!(!returned.load(SeqCst));

        lock.acquire(&cx);
        cv.signal(lock);
        lock.release(&cx);
        handle.join().unwrap();
        assert!(returned.load(SeqCst));
    }

    #[test]
    fn broadcast_wakes_every_waiter() {
        const WAITERS: usize = 5;
        let pair = Arc::new((Lock::create("crowd").unwrap(), Cv::create("crowd").unwrap()));
        let waiting = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let (pair, waiting) = (pair.clone(), waiting.clone());
                spawn_kthread(move |cx| {
                    let (lock, cv) = &*pair;
                    lock.acquire(cx);
                    waiting.fetch_add(1, SeqCst);
                    cv.wait(lock, cx);
                    lock.release(cx);
                })
            })
            .collect();

        let cx = HostThread::new();
        let (lock, cv) = &*pair;
        loop {
            lock.acquire(&cx);
            if waiting.load(SeqCst) == WAITERS {
                break;
            }
            lock.release(&cx);
            settle();
        }
        cv.broadcast(lock);
        lock.release(&cx);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn one_cv_serves_different_locks() {
        let cv = Arc::new(Cv::create("shared").unwrap());
        let locks = Arc::new([Lock::create("first").unwrap(), Lock::create("second").unwrap()]);
        for index in 0..2 {
            let waiting = Arc::new(AtomicBool::new(false));
            let (c_cv, c_locks, c_waiting) = (cv.clone(), locks.clone(), waiting.clone());
            let handle = spawn_kthread(move |cx| {
                let lock = &c_locks[index];
                lock.acquire(cx);
                c_waiting.store(true, SeqCst);
                c_cv.wait(lock, cx);
                lock.release(cx);
            });
            let cx = HostThread::new();
            while !waiting.load(SeqCst) {
                settle();
            }
            locks[index].acquire(&cx);
            cv.signal(&locks[index]);
            locks[index].release(&cx);
            handle.join().unwrap();
        }
    }

    #[test]
    fn name_and_debug() {
        let cv = Cv::create("disk io").unwrap();
        assert_eq!(cv.name(), "disk io");
        assert_eq!(format!("{cv:?}"), r#"Cv { name: "disk io" }"#);
        cv.destroy();
    }

    #[test]
    fn wait_does_not_allocate() {
        let pair = Arc::new((Lock::create("no alloc").unwrap(), Cv::create("no alloc").unwrap()));
        let c_pair = pair.clone();
        let handle = spawn_kthread(move |cx| {
            let (lock, cv) = &*c_pair;
            lock.acquire(cx);
            let allocations = allocations_in(|| cv.wait(lock, cx));
            lock.release(cx);
            allocations
        });

        let cx = HostThread::new();
        let (lock, cv) = &*pair;
        while cv.wchan.is_empty() {
            settle();
        }
        lock.acquire(&cx);
        assert_eq!(allocations_in(|| cv.signal(lock)), 0);
        lock.release(&cx);
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn create_out_of_memory_is_reported() {
        let err = out_of_memory(|| Cv::create("oom")).unwrap_err();
        assert!(matches!(err, CreateError::Name(_)));
    }

    #[test]
    #[should_panic(expected = "wait without holding lock")]
    fn wait_without_lock_panics() {
        let cx = HostThread::new();
        let lock = Lock::create("free").unwrap();
        let cv = Cv::create("free").unwrap();
        cv.wait(&lock, &cx);
    }

    #[test]
    #[should_panic(expected = "wait in interrupt context")]
    fn wait_in_interrupt_panics() {
        let cx = HostThread::new();
        let lock = Lock::create("irq").unwrap();
        let cv = Cv::create("irq").unwrap();
        lock.acquire(&cx);
        cx.interrupt(|| cv.wait(&lock, &cx));
    }

    #[test]
    #[should_panic(expected = "destroyed with 1 sleeper(s)")]
    fn destroy_with_sleeper_panics() {
        let cx = HostThread::new();
        let cv = Cv::create("busy").unwrap();
        cv.wchan.lock().enqueue_stray(&cx);
        cv.destroy();
    }
}

#[cfg(all(loom, test))]
mod model {
    use crate::loom::models;
    use crate::relax::Yield;

    #[test]
    fn cv_signal() {
        models::cv_signal::<Yield>();
    }
}
