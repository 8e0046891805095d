//! Named queues of sleeping threads.
//!
//! A [`WaitChannel`] is the blocking building block beneath every sleeping
//! primitive of this crate. It does not know what its sleepers are waiting
//! for; it only queues them and wakes them on request.
//!
//! Going to sleep is a two step protocol. A thread that has just decided,
//! under some other lock, that it must wait first locks the channel with
//! [`WaitChannel::lock`], then releases that other lock, and only then calls
//! [`WaitChannelGuard::sleep`], which enqueues the caller and unlocks the
//! channel before blocking. Any waker has to lock the channel to dequeue a
//! sleeper, so a wakeup issued after the decision to sleep finds the sleeper
//! already queued and cannot be lost.
//!
//! Wakeups carry no promise beyond "you were dequeued": a woken thread must
//! re-check whatever condition it slept on.

use alloc::string::String;

use core::cell::Cell;
use core::fmt::{self, Debug, Formatter};
use core::ptr::NonNull;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::AtomicBool;
use crate::error::CreateError;
use crate::relax::Relax;
use crate::spinlock::{Spinlock, SpinlockGuard};
use crate::thread::{Context, Unpark};

/// Duplicates `name` into a freshly allocated string.
pub(crate) fn dup_name(name: &str) -> Result<String, CreateError> {
    let mut owned = String::new();
    owned.try_reserve_exact(name.len()).map_err(CreateError::Name)?;
    owned.push_str(name);
    Ok(owned)
}

/// A link to a queued waiter. The lifetime is erased: a waiter only stays
/// linked while the frame that owns it is blocked in [`Queued::block`].
type Link = Option<NonNull<Waiter<'static>>>;

/// A sleeping thread.
///
/// Lives on the sleeper's stack for the whole sleep, and is linked into the
/// channel's queue by address, so going to sleep never allocates. `woken`
/// and `next` are only written with the channel locked.
struct Waiter<'a> {
    woken: AtomicBool,
    thread: &'a dyn Unpark,
    next: Cell<Link>,
}

impl<'a> Waiter<'a> {
    fn new(thread: &'a dyn Unpark) -> Self {
        Self { woken: AtomicBool::new(false), thread, next: Cell::new(None) }
    }

    /// Makes the sleeper runnable. Must be called with the channel locked,
    /// right after dequeuing the waiter.
    fn wake(&self) {
        self.woken.store(true, Release);
        self.thread.unpark();
    }

    fn link(&self) -> NonNull<Waiter<'static>> {
        NonNull::from(self).cast()
    }
}

/// An intrusive FIFO of waiters.
#[derive(Default)]
struct Queue {
    head: Link,
    tail: Link,
    len: usize,
}

// SAFETY: The queue is only reached through the channel spinlock, and every
// waiter it links is kept alive by its blocked owner until unlinked.
unsafe impl Send for Queue {}

impl Queue {
    /// Links `waiter` at the back of the queue.
    ///
    /// # Safety
    ///
    /// `waiter` must stay valid, and must not move, until it is unlinked by
    /// [`pop_front`] or [`remove`].
    ///
    /// [`pop_front`]: Queue::pop_front
    /// [`remove`]: Queue::remove
    unsafe fn push_back(&mut self, waiter: NonNull<Waiter<'static>>) {
        // SAFETY: Caller guarantees `waiter` is valid.
        unsafe { waiter.as_ref() }.next.set(None);
        match self.tail {
            // SAFETY: Linked waiters are valid.
            Some(tail) => unsafe { tail.as_ref() }.next.set(Some(waiter)),
            None => self.head = Some(waiter),
        }
        self.tail = Some(waiter);
        self.len += 1;
    }

    /// Unlinks the waiter at the front of the queue.
    fn pop_front(&mut self) -> Link {
        let head = self.head?;
        // SAFETY: Linked waiters are valid.
        self.head = unsafe { head.as_ref() }.next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }

    /// Unlinks `waiter` wherever it is. Returns `false` if it was not linked.
    fn remove(&mut self, waiter: NonNull<Waiter<'static>>) -> bool {
        let mut prev: Link = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // SAFETY: Linked waiters are valid.
            let next = unsafe { node.as_ref() }.next.get();
            if node == waiter {
                match prev {
                    // SAFETY: Linked waiters are valid.
                    Some(prev) => unsafe { prev.as_ref() }.next.set(next),
                    None => self.head = next,
                }
                if self.tail == Some(node) {
                    self.tail = prev;
                }
                self.len -= 1;
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    const fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// A named queue of sleeping threads.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::thread;
///
/// use ksynch::relax::Spin;
/// use ksynch::thread::HostThread;
/// use ksynch::wchan::WaitChannel;
///
/// let wchan = Arc::new(WaitChannel::<Spin>::create("event").unwrap());
/// let ready = Arc::new(AtomicBool::new(false));
///
/// let (c_wchan, c_ready) = (Arc::clone(&wchan), Arc::clone(&ready));
/// let sleeper = thread::spawn(move || {
///     let cx = HostThread::new();
///     loop {
///         let guard = c_wchan.lock();
///         if c_ready.load(Ordering::Acquire) {
///             break;
///         }
///         guard.sleep(&cx);
///     }
/// });
///
/// let guard = wchan.lock();
/// ready.store(true, Ordering::Release);
/// drop(guard);
/// wchan.wake_all();
/// sleeper.join().unwrap();
/// ```
pub struct WaitChannel<R> {
    name: String,
    queue: Spinlock<Queue, R>,
}

impl<R> WaitChannel<R> {
    /// Creates an empty wait channel named `name`.
    ///
    /// The name is the only allocation a channel ever makes.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError`] if the name could not be allocated.
    pub fn create(name: &str) -> Result<Self, CreateError> {
        let name = dup_name(name)?;
        log::trace!("wchan `{name}` created");
        Ok(Self { name, queue: Spinlock::new(Queue::default()) })
    }

    /// Returns the name this channel was created with.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destroys the channel.
    ///
    /// # Panics
    ///
    /// Panics if any thread is still sleeping on it.
    pub fn destroy(self) {
        log::trace!("wchan `{}` destroyed", self.name);
        drop(self);
    }
}

impl<R: Relax> WaitChannel<R> {
    /// Locks the channel, announcing the caller's intent to sleep on it.
    ///
    /// While the returned guard is alive, no thread can be woken from this
    /// channel. Release whatever lock guards the sleep condition only after
    /// this call, then call [`WaitChannelGuard::sleep`].
    #[inline]
    pub fn lock(&self) -> WaitChannelGuard<'_, R> {
        WaitChannelGuard { wchan: self, queue: self.queue.lock() }
    }

    /// Wakes one sleeper, if any.
    ///
    /// Sleepers are dequeued in arrival order, but a woken thread still has
    /// to compete for whatever it slept on.
    pub fn wake_one(&self) {
        self.queue.lock().with_mut(|queue| {
            if let Some(waiter) = queue.pop_front() {
                // SAFETY: The sleeper cannot leave `sleep` before it takes the
                // channel lock, which we hold.
                unsafe { waiter.as_ref() }.wake();
            }
        });
    }

    /// Wakes every thread sleeping on this channel at the time of the call.
    pub fn wake_all(&self) {
        self.queue.lock().with_mut(|queue| {
            while let Some(waiter) = queue.pop_front() {
                // SAFETY: Same as in `wake_one`.
                unsafe { waiter.as_ref() }.wake();
            }
        });
    }

    /// Returns `true` if no thread is sleeping on this channel.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().with(Queue::is_empty)
    }
}

impl<R> Drop for WaitChannel<R> {
    fn drop(&mut self) {
        let sleepers = self.queue.with_exclusive(|queue| queue.len);
        assert!(sleepers == 0, "wchan `{}` destroyed with {} sleeper(s)", self.name, sleepers);
    }
}

impl<R> Debug for WaitChannel<R> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitChannel").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A locked [`WaitChannel`], returned by [`WaitChannel::lock`].
///
/// Dropping the guard unlocks the channel without sleeping.
#[must_use = "if unused the WaitChannel will immediately unlock"]
pub struct WaitChannelGuard<'a, R> {
    wchan: &'a WaitChannel<R>,
    queue: SpinlockGuard<'a, Queue, R>,
}

impl<R: Relax> WaitChannelGuard<'_, R> {
    /// Enqueues the calling thread, unlocks the channel and blocks until
    /// another thread wakes it through [`wake_one`] or [`wake_all`].
    ///
    /// Does not allocate.
    ///
    /// # Panics
    ///
    /// Panics if called from interrupt context.
    ///
    /// [`wake_one`]: WaitChannel::wake_one
    /// [`wake_all`]: WaitChannel::wake_all
    pub fn sleep<C: Context + ?Sized>(mut self, cx: &C) {
        let wchan = self.wchan;
        let name = wchan.name();
        assert!(!cx.in_interrupt(), "wchan `{name}`: sleep in interrupt context");
        let waiter = Waiter::new(cx.unparker());
        // SAFETY: `waiter` stays in this frame until `queued` is dropped, and
        // dropping `queued` unlinks it if no waker did.
        unsafe { self.enqueue(&waiter) };
        let queued = Queued { wchan, waiter: &waiter };
        drop(self);
        log::trace!("wchan `{name}`: {} sleeping", cx.thread_id());
        queued.block(cx);
        log::trace!("wchan `{name}`: {} woken", cx.thread_id());
    }

    /// Links `waiter` into the queue without blocking.
    ///
    /// # Safety
    ///
    /// Same as [`Queue::push_back`].
    unsafe fn enqueue(&mut self, waiter: &Waiter<'_>) {
        let link = waiter.link();
        // SAFETY: Guaranteed by the caller.
        self.queue.with_mut(|queue| unsafe { queue.push_back(link) });
    }

    /// Queues a waiter that never blocks nor gets unlinked, leaving the
    /// channel with a sleeper for good.
    #[cfg(all(not(loom), test))]
    pub(crate) fn enqueue_stray<C: Context + ?Sized>(mut self, cx: &C) {
        let waiter = alloc::boxed::Box::leak(alloc::boxed::Box::new(Waiter::new(cx.unparker())));
        // SAFETY: The waiter is leaked, so it never moves nor goes away.
        unsafe { self.enqueue(waiter) };
    }
}

/// A waiter linked into its channel's queue.
///
/// Dropping it takes the channel lock, which waits out a waker that is still
/// touching the waiter, and unlinks the waiter if nobody woke it (the sleep
/// was cut short by a panic).
struct Queued<'a, R: Relax> {
    wchan: &'a WaitChannel<R>,
    waiter: &'a Waiter<'a>,
}

impl<R: Relax> Queued<'_, R> {
    /// Parks the caller until a waker dequeues the waiter.
    fn block<C: Context + ?Sized>(&self, cx: &C) {
        while !self.waiter.woken.load(Acquire) {
            cx.park();
        }
    }
}

impl<R: Relax> Drop for Queued<'_, R> {
    fn drop(&mut self) {
        let mut queue = self.wchan.queue.lock();
        if !self.waiter.woken.load(Relaxed) {
            let link = self.waiter.link();
            queue.with_mut(|queue| queue.remove(link));
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::Arc;
    use std::vec::Vec;

    use super::{dup_name, Queue, WaitChannel, Waiter};
    use crate::error::CreateError;
    use crate::test::{allocations_in, out_of_memory, settle, spawn_kthread};
    use crate::thread::{Context, HostThread};

    type Wchan = WaitChannel<crate::relax::Yield>;

    /// Sleeps once on `wchan`, counting the caller in `asleep` first.
    fn sleep_once(wchan: &Wchan, cx: &HostThread, asleep: &AtomicUsize) {
        let guard = wchan.lock();
        asleep.fetch_add(1, SeqCst);
        guard.sleep(cx);
    }

    fn wait_for_sleepers(wchan: &Wchan, asleep: &AtomicUsize, n: usize) {
        // A thread counted in `asleep` is queued once the channel lock it
        // held while counting is released.
        while asleep.load(SeqCst) < n {
            settle();
        }
        drop(wchan.lock());
    }

    #[test]
    fn create_names_channel() {
        let wchan = Wchan::create("disk").unwrap();
        assert_eq!(wchan.name(), "disk");
        assert!(wchan.is_empty());
        wchan.destroy();
    }

    #[test]
    fn create_out_of_memory_is_reported() {
        let err = out_of_memory(|| Wchan::create("oom")).unwrap_err();
        assert!(matches!(err, CreateError::Name(_)));
    }

    #[test]
    fn name_is_duplicated() {
        let name = std::string::String::from("console");
        let owned = dup_name(&name).unwrap();
        drop(name);
        assert_eq!(owned, "console");
    }

    #[test]
    fn queue_links_in_order_and_removes_anywhere() {
        let cx = HostThread::new();
        let waiters: [Waiter<'_>; 3] = core::array::from_fn(|_| Waiter::new(cx.unparker()));
        let mut queue = Queue::default();
        for waiter in &waiters {
            // SAFETY: `waiters` outlives `queue`'s use below.
            unsafe { queue.push_back(waiter.link()) };
        }
        assert_eq!(queue.len, 3);
        assert!(queue.remove(waiters[1].link()));
        assert!(!queue.remove(waiters[1].link()));
        assert!(queue.remove(waiters[2].link()));
        assert_eq!(queue.tail, Some(waiters[0].link()));
        // SAFETY: `waiters[2]` was unlinked above.
        unsafe { queue.push_back(waiters[2].link()) };
        assert_eq!(queue.pop_front(), Some(waiters[0].link()));
        assert_eq!(queue.pop_front(), Some(waiters[2].link()));
        assert_eq!(queue.pop_front(), None);
        assert!(queue.is_empty());
        assert_eq!(queue.len, 0);
    }

    #[test]
    fn wake_one_with_no_sleepers_is_noop() {
        let wchan = Wchan::create("idle").unwrap();
        wchan.wake_one();
        wchan.wake_all();
        assert!(wchan.is_empty());
    }

    #[test]
    fn wake_one_wakes_single_sleeper() {
        let wchan = Arc::new(Wchan::create("one").unwrap());
        let asleep = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (wchan, asleep, done) = (wchan.clone(), asleep.clone(), done.clone());
                spawn_kthread(move |cx| {
                    sleep_once(&wchan, cx, &asleep);
                    done.fetch_add(1, SeqCst);
                })
            })
            .collect();
        wait_for_sleepers(&wchan, &asleep, 2);
        wchan.wake_one();
        while done.load(SeqCst) < 1 {
            settle();
        }
        settle();
        assert_eq!(done.load(SeqCst), 1);
        assert!(!wchan.is_empty());
        wchan.wake_one();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(wchan.is_empty());
    }

    #[test]
    fn wake_all_wakes_every_sleeper() {
        const SLEEPERS: usize = 4;
        let wchan = Arc::new(Wchan::create("all").unwrap());
        let asleep = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..SLEEPERS)
            .map(|_| {
                let (wchan, asleep) = (wchan.clone(), asleep.clone());
                spawn_kthread(move |cx| sleep_once(&wchan, cx, &asleep))
            })
            .collect();
        wait_for_sleepers(&wchan, &asleep, SLEEPERS);
        wchan.wake_all();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(wchan.is_empty());
    }

    #[test]
    fn sleeping_and_waking_do_not_allocate() {
        const SLEEPERS: usize = 6;
        let wchan = Arc::new(Wchan::create("no alloc").unwrap());
        let asleep = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..SLEEPERS)
            .map(|_| {
                let (wchan, asleep) = (wchan.clone(), asleep.clone());
                spawn_kthread(move |cx| allocations_in(|| sleep_once(&wchan, cx, &asleep)))
            })
            .collect();
        wait_for_sleepers(&wchan, &asleep, SLEEPERS);
        let woke = allocations_in(|| {
            wchan.wake_one();
            wchan.wake_all();
        });
        assert_eq!(woke, 0);
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
    }

    #[test]
    #[should_panic(expected = "sleep in interrupt context")]
    fn sleep_in_interrupt_panics() {
        let wchan = Wchan::create("irq").unwrap();
        let cx = HostThread::new();
        cx.interrupt(|| wchan.lock().sleep(&cx));
    }

    #[test]
    #[should_panic(expected = "destroyed with 1 sleeper(s)")]
    fn destroy_with_sleeper_panics() {
        let wchan = Wchan::create("busy").unwrap();
        let cx = HostThread::new();
        wchan.lock().enqueue_stray(&cx);
        wchan.destroy();
    }
}
