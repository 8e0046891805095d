//! Helpers shared by the test suites of every primitive.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::ptr;

use std::alloc::System;
use std::thread::{self, JoinHandle};
use std::thread_local;
use std::time::Duration;

use crate::thread::HostThread;

thread_local! {
    /// Heap allocations made by this thread so far.
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
    /// Whether allocations made by this thread fail.
    static OUT_OF_MEMORY: Cell<bool> = const { Cell::new(false) };
}

/// The system allocator, with per-thread counting and failure injection.
struct TestAlloc;

// SAFETY: Every request is forwarded to `System` unchanged, or refused with
// a null pointer.
unsafe impl GlobalAlloc for TestAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if OUT_OF_MEMORY.try_with(Cell::get).unwrap_or(false) {
            return ptr::null_mut();
        }
        let _ = ALLOCATIONS.try_with(|count| count.set(count.get() + 1));
        // SAFETY: Caller upholds the `GlobalAlloc::alloc` contract.
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: `ptr` was handed out by `System` through `alloc`.
        unsafe { System.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static GLOBAL: TestAlloc = TestAlloc;

/// Returns how many heap allocations the calling thread made while running
/// `f`.
pub fn allocations_in<F: FnOnce()>(f: F) -> usize {
    let before = ALLOCATIONS.with(Cell::get);
    f();
    ALLOCATIONS.with(Cell::get) - before
}

/// Runs `f` with every heap allocation of the calling thread failing.
///
/// `f` must not panic: unwinding needs the heap.
pub fn out_of_memory<F: FnOnce() -> Ret, Ret>(f: F) -> Ret {
    OUT_OF_MEMORY.with(|oom| oom.set(true));
    let ret = f();
    OUT_OF_MEMORY.with(|oom| oom.set(false));
    ret
}

/// How long a test waits for other threads to reach a blocking point.
const SETTLE: Duration = Duration::from_millis(20);

/// Spawns an OS thread that runs `f` as a fresh kernel thread.
pub fn spawn_kthread<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce(&HostThread) -> T + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(move || f(&HostThread::new()))
}

/// Gives other threads time to make progress.
pub fn settle() {
    thread::sleep(SETTLE);
}

pub mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::vec::Vec;

    use super::spawn_kthread;
    use crate::cv::Cv;
    use crate::lock::Lock;
    use crate::relax::Relax;
    use crate::semaphore::Semaphore;
    use crate::spinlock::Spinlock;

    const ITERS: usize = 1000;
    const CONCURRENCY: usize = 3;
    const EXPECTED_VALUE: usize = ITERS * CONCURRENCY * 2;

    /// Runs `f` on `2 * CONCURRENCY` kernel threads and waits for all of them.
    fn lots_and_lots<S, F>(shared: &Arc<S>, f: F)
    where
        S: Send + Sync + 'static,
        F: Fn(&S, &crate::thread::HostThread) + Copy + Send + 'static,
    {
        let (tx, rx) = channel();
        for _ in 0..2 * CONCURRENCY {
            let (shared, tx) = (Arc::clone(shared), tx.clone());
            spawn_kthread(move |cx| {
                f(&shared, cx);
                tx.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
    }

    pub fn lots_and_lots_spinlock<R: Relax + 'static>() {
        let lock = Arc::new(Spinlock::<usize, R>::new(0));
        lots_and_lots(&lock, |lock, _| {
            for _ in 0..ITERS {
                *lock.lock() += 1;
            }
        });
        assert_eq!(*lock.lock(), EXPECTED_VALUE);
    }

    /// A counter whose read-modify-write is only atomic under `lock`.
    struct Guarded<R> {
        lock: Lock<R>,
        counter: AtomicUsize,
    }

    pub fn lots_and_lots_lock<R: Relax + Send + Sync + 'static>() {
        let lock = Lock::<R>::create("lots").unwrap();
        let guarded = Arc::new(Guarded { lock, counter: AtomicUsize::new(0) });
        lots_and_lots(&guarded, |guarded, cx| {
            for _ in 0..ITERS {
                guarded.lock.acquire(cx);
                assert!(guarded.lock.is_held_by_caller(cx));
                let value = guarded.counter.load(Relaxed);
                guarded.counter.store(value + 1, Relaxed);
                guarded.lock.release(cx);
            }
        });
        assert_eq!(guarded.counter.load(Relaxed), EXPECTED_VALUE);
    }

    /// A semaphore used as a mutex, plus a gauge of how many threads are
    /// inside the critical section at once.
    struct Gate<R> {
        sem: Semaphore<R>,
        inside: AtomicUsize,
        passes: AtomicUsize,
    }

    pub fn lots_and_lots_semaphore<R: Relax + Send + Sync + 'static>() {
        const PERMITS: usize = 2;
        let gate = Gate {
            sem: Semaphore::<R>::create("lots", PERMITS).unwrap(),
            inside: AtomicUsize::new(0),
            passes: AtomicUsize::new(0),
        };
        let gate = Arc::new(gate);
        lots_and_lots(&gate, |gate, cx| {
            for _ in 0..ITERS {
                gate.sem.p(cx);
                let inside = gate.inside.fetch_add(1, Relaxed) + 1;
                assert!(inside <= PERMITS);
                gate.passes.fetch_add(1, Relaxed);
                gate.inside.fetch_sub(1, Relaxed);
                gate.sem.v();
            }
        });
        assert_eq!(gate.passes.load(Relaxed), EXPECTED_VALUE);
        assert_eq!(gate.sem.count(), PERMITS);
    }

    /// Two threads alternating turns through one lock and one CV.
    struct Turns<R> {
        lock: Lock<R>,
        cv: Cv<R>,
        turn: AtomicUsize,
    }

    pub fn ping_pong_cv<R: Relax + Send + Sync + 'static>() {
        const ROUNDS: usize = 200;
        let turns = Arc::new(Turns {
            lock: Lock::<R>::create("turns").unwrap(),
            cv: Cv::<R>::create("turns").unwrap(),
            turn: AtomicUsize::new(0),
        });
        let handles: Vec<_> = (0..2)
            .map(|player| {
                let turns = Arc::clone(&turns);
                spawn_kthread(move |cx| {
                    for _ in 0..ROUNDS {
                        turns.lock.acquire(cx);
                        while turns.turn.load(Relaxed) % 2 != player {
                            turns.cv.wait(&turns.lock, cx);
                        }
                        turns.turn.fetch_add(1, Relaxed);
                        turns.cv.signal(&turns.lock);
                        turns.lock.release(cx);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(turns.turn.load(Relaxed), 2 * ROUNDS);
    }
}
