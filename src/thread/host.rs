use core::cell::Cell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, Ordering::Relaxed};

use super::{Context, ThreadId, Unpark};
use crate::cfg::thread::{self, Thread};

/// Source of fresh ids; zero is never handed out.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A [`Context`] backed by the OS thread that created it.
///
/// Each instance is a distinct kernel thread identity, so a thread that needs
/// to act as one kernel thread must create a single `HostThread` and pass it
/// to every call. Parking blocks the OS thread; unparking wakes it.
///
/// The interrupt flag is plain state on the instance, which lets tests run
/// code "in interrupt context" with [`interrupt`].
///
/// `HostThread` is neither [`Send`] nor [`Sync`]: it describes the thread it
/// was created on and is useless anywhere else.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use ksynch::spins::Semaphore;
/// use ksynch::thread::HostThread;
///
/// let sem = Arc::new(Semaphore::create("done", 0).unwrap());
/// let c_sem = Arc::clone(&sem);
///
/// thread::spawn(move || {
///     let _cx = HostThread::new();
///     c_sem.v();
/// });
///
/// let cx = HostThread::new();
/// sem.p(&cx);
/// ```
///
/// [`interrupt`]: HostThread::interrupt
#[derive(Debug)]
pub struct HostThread {
    id: ThreadId,
    handle: Thread,
    in_interrupt: Cell<bool>,
    not_send: PhantomData<*const ()>,
}

impl HostThread {
    /// Creates a new kernel thread identity bound to the calling OS thread.
    #[must_use]
    pub fn new() -> Self {
        let raw = NEXT_ID.fetch_add(1, Relaxed);
        let Some(id) = ThreadId::new(raw) else {
            panic!("thread id space exhausted");
        };
        let handle = thread::current();
        Self { id, handle, in_interrupt: Cell::new(false), not_send: PhantomData }
    }

    /// Marks this thread as running (or not) an interrupt handler.
    pub fn set_in_interrupt(&self, in_interrupt: bool) {
        self.in_interrupt.set(in_interrupt);
    }

    /// Runs `f` as if it were an interrupt handler of this thread.
    ///
    /// The previous state of the flag is restored when `f` returns or
    /// unwinds.
    pub fn interrupt<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce() -> Ret,
    {
        struct Restore<'a>(&'a Cell<bool>, bool);

        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.0.set(self.1);
            }
        }

        let _restore = Restore(&self.in_interrupt, self.in_interrupt.replace(true));
        f()
    }
}

#[cfg(not(tarpaulin_include))]
impl Default for HostThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Context for HostThread {
    #[inline]
    fn thread_id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    fn in_interrupt(&self) -> bool {
        self.in_interrupt.get()
    }

    #[inline]
    fn unparker(&self) -> &dyn Unpark {
        &self.handle
    }

    fn park(&self) {
        thread::park();
    }
}

impl Unpark for Thread {
    #[inline]
    fn unpark(&self) {
        Thread::unpark(self);
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use crate::thread::{Context, HostThread};

    #[test]
    fn ids_are_unique() {
        let (a, b) = (HostThread::new(), HostThread::new());
        assert_ne!(a.thread_id(), b.thread_id());
    }

    #[test]
    fn interrupt_flag_is_scoped() {
        let cx = HostThread::new();
        assert!(cx.interrupt(|| cx.in_interrupt()));
        assert!(!cx.in_interrupt());
        cx.set_in_interrupt(true);
        cx.interrupt(|| ());
        assert!(cx.in_interrupt());
    }

    #[test]
    fn unpark_before_park_is_kept() {
        let cx = HostThread::new();
        cx.unparker().unpark();
        // Returns immediately thanks to the pending token.
        cx.park();
    }
}
