pub mod models {
    use core::array;

    use loom::cell::UnsafeCell;
    use loom::model::Builder;
    use loom::sync::atomic::AtomicBool;
    use loom::sync::Arc;
    use loom::thread;

    use core::sync::atomic::Ordering::{Acquire, Release};

    use crate::cv::Cv;
    use crate::lock::Lock;
    use crate::relax::Relax;
    use crate::semaphore::Semaphore;
    use crate::spinlock::Spinlock;
    use crate::thread::HostThread;

    const RUNS: usize = 2;

    /// Preemptions explored per execution unless `LOOM_MAX_PREEMPTIONS` says
    /// otherwise. Sleeping primitives spin on two spinlocks per operation, so
    /// an unbounded search does not finish in reasonable time.
    const PREEMPTIONS: usize = 3;

    fn check<F>(f: F)
    where
        F: Fn() + Sync + Send + 'static,
    {
        let mut builder = Builder::new();
        builder.preemption_bound.get_or_insert(PREEMPTIONS);
        builder.check(f);
    }

    /// Evaluates that concurrent `lock` calls serialize all mutations
    /// against the protected data.
    pub fn spinlock_join<R: Relax + 'static>() {
        check(|| {
            let data = Arc::new(Spinlock::<usize, R>::new(0));
            let handles: [_; RUNS] = array::from_fn(|_| {
                let data = Arc::clone(&data);
                thread::spawn(move || data.lock().with_mut(|data| *data += 1))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(data.lock().with(|data| *data), RUNS);
        });
    }

    /// Evaluates that a `v` racing with a sleeping `p` always lets the
    /// sleeper through.
    pub fn semaphore_handoff<R: Relax + Send + Sync + 'static>() {
        check(|| {
            let sem = Arc::new(Semaphore::<R>::create("handoff", 0).unwrap());
            let c_sem = Arc::clone(&sem);
            let handle = thread::spawn(move || c_sem.v());
            let cx = HostThread::new();
            sem.p(&cx);
            handle.join().unwrap();
            assert_eq!(sem.count(), 0);
        });
    }

    /// A value that Loom checks for unsynchronized access.
    struct Guarded<R> {
        lock: Lock<R>,
        value: UnsafeCell<usize>,
    }

    // SAFETY: `value` is only accessed with `lock` held.
    unsafe impl<R> Sync for Guarded<R> {}

    /// Evaluates that a lock admits one thread at a time, including threads
    /// that had to sleep for it.
    pub fn lock_exclusion<R: Relax + Send + Sync + 'static>() {
        check(|| {
            let lock = Lock::<R>::create("exclusion").unwrap();
            let shared = Arc::new(Guarded { lock, value: UnsafeCell::new(0) });
            let handles: [_; RUNS] = array::from_fn(|_| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || {
                    let cx = HostThread::new();
                    shared.lock.acquire(&cx);
                    // SAFETY: The lock is held.
                    shared.value.with_mut(|value| unsafe { *value += 1 });
                    shared.lock.release(&cx);
                })
            });
            for handle in handles {
                handle.join().unwrap();
            }
            // SAFETY: Every other thread has exited.
            assert_eq!(shared.value.with(|value| unsafe { *value }), RUNS);
        });
    }

    /// Evaluates that a signal sent after the waiter has seen the condition
    /// false is never lost.
    pub fn cv_signal<R: Relax + Send + Sync + 'static>() {
        check(|| {
            let lock = Lock::<R>::create("ready").unwrap();
            let cv = Cv::<R>::create("ready").unwrap();
            let shared = Arc::new((lock, cv, AtomicBool::new(false)));

            let c_shared = Arc::clone(&shared);
            let handle = thread::spawn(move || {
                let cx = HostThread::new();
                let (lock, cv, ready) = &*c_shared;
                lock.acquire(&cx);
                ready.store(true, Release);
                cv.signal(lock);
                lock.release(&cx);
            });

            let cx = HostThread::new();
            let (lock, cv, ready) = &*shared;
            lock.acquire(&cx);
            while !ready.load(Acquire) {
                cv.wait(lock, &cx);
            }
            lock.release(&cx);
            handle.join().unwrap();
        });
    }
}
