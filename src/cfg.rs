//! Selects between `core`/`std` and Loom backed primitives.
//!
//! Everything that Loom needs to observe (atomics, cells, spin hints, thread
//! parking) is imported through this module, so the rest of the crate is
//! written once for both configurations.

pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::AtomicBool;

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::AtomicBool;
}

pub mod cell {
    #[cfg(not(all(loom, test)))]
    pub use core::cell::UnsafeCell;

    #[cfg(all(loom, test))]
    pub use loom::cell::UnsafeCell;

    /// Closure based access to the contents of an [`UnsafeCell`], which is the
    /// only access Loom's cell allows.
    pub trait UnsafeCellWith<T> {
        /// Runs `f` against a shared reference to the cell contents.
        ///
        /// # Safety
        ///
        /// Caller must guarantee that no exclusive reference to the contents
        /// is alive for the duration of the call.
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret;

        /// Runs `f` against an exclusive reference to the cell contents.
        ///
        /// # Safety
        ///
        /// Caller must guarantee that no other reference to the contents is
        /// alive for the duration of the call.
        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret;
    }

    #[cfg(not(all(loom, test)))]
    impl<T> UnsafeCellWith<T> for UnsafeCell<T> {
        #[inline(always)]
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no exclusive alias.
            f(unsafe { &*self.get() })
        }

        #[inline(always)]
        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no other alias.
            f(unsafe { &mut *self.get() })
        }
    }

    #[cfg(all(loom, test))]
    #[cfg(not(tarpaulin_include))]
    impl<T> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no exclusive alias.
            self.with(|ptr| f(unsafe { &*ptr }))
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed there is no other alias.
            self.with_mut(|ptr| f(unsafe { &mut *ptr }))
        }
    }
}

pub mod hint {
    #[cfg(not(all(loom, test)))]
    pub use core::hint::spin_loop;

    #[cfg(all(loom, test))]
    pub use loom::hint::spin_loop;
}

#[cfg(any(feature = "std", test))]
pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::{current, park, Thread};

    #[cfg(all(not(loom), any(feature = "yield", test)))]
    pub use std::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread::{current, park, yield_now, Thread};
}
