//! The calling thread, as seen by the synchronization primitives.
//!
//! The primitives never consult an ambient "current thread". Every operation
//! that blocks, or that depends on who the caller is, takes a [`Context`]
//! describing the calling thread: its [`ThreadId`], whether it is running an
//! interrupt handler, and how to put it to sleep and wake it up again. A
//! kernel implements [`Context`] on top of its scheduler; on a host, the
//! [`HostThread`] type implements it with OS threads.

use core::fmt::{self, Display, Formatter};
use core::num::NonZeroU64;

#[cfg(any(feature = "std", test))]
mod host;

#[cfg(any(feature = "std", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub use host::HostThread;

/// An opaque token identifying a kernel thread.
///
/// Lock ownership is recorded and compared as a `ThreadId`; no reference to
/// the thread itself is ever kept by a primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    /// Creates a thread id from its raw value, returning `None` for zero.
    #[must_use]
    #[inline]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the raw value of this id.
    #[must_use]
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// A handle that makes a parked thread runnable again.
pub trait Unpark: Send + Sync {
    /// Wakes the thread this handle refers to.
    ///
    /// An `unpark` that happens before the matching [`Context::park`] must not
    /// be lost: that `park` has to return immediately.
    fn unpark(&self);
}

/// The scheduler's view of the calling thread.
///
/// # Example
///
/// ```
/// use ksynch::thread::{Context, HostThread};
///
/// let cx = HostThread::new();
/// assert!(!cx.in_interrupt());
/// assert_eq!(cx.thread_id(), cx.thread_id());
/// ```
pub trait Context {
    /// Returns the identity of the calling thread.
    fn thread_id(&self) -> ThreadId;

    /// Returns `true` while the calling thread runs an interrupt handler.
    fn in_interrupt(&self) -> bool;

    /// Returns the handle that wakes the calling thread.
    ///
    /// A sleeping thread lends this handle to its wait channel for the whole
    /// sleep, so it must live as long as the context and cost nothing to
    /// hand out: blocking never allocates.
    fn unparker(&self) -> &dyn Unpark;

    /// Deschedules the calling thread until it is unparked.
    ///
    /// May return spuriously; callers re-check their wake condition.
    fn park(&self);
}

#[cfg(all(not(loom), test))]
mod test {
    use std::format;

    use super::ThreadId;

    #[test]
    fn zero_is_not_an_id() {
        assert_eq!(ThreadId::new(0), None);
        assert_eq!(ThreadId::new(7).map(ThreadId::as_u64), Some(7));
    }

    #[test]
    fn display() {
        let id = ThreadId::new(3).unwrap();
        assert_eq!(format!("{id}"), "thread#3");
    }
}
