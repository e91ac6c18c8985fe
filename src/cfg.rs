//! Switches between `std` and Loom provided primitives.
//!
//! Every module of this crate must import atomics, cells, hints and thread
//! APIs from here, so that building with `--cfg loom` instruments all shared
//! state accesses.

pub mod atomic {
    #[cfg(not(all(loom, test)))]
    pub use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32};

    #[cfg(all(loom, test))]
    pub use loom::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32};
}

#[cfg(test)]
pub mod cell {
    #[cfg(not(loom))]
    pub use core::cell::UnsafeCell;

    #[cfg(loom)]
    pub use loom::cell::UnsafeCell;

    /// A trait that extends [`UnsafeCell`] to allow running closures against
    /// its underlying data.
    pub trait UnsafeCellWith<T: ?Sized> {
        /// Runs `f` against a shared reference borrowed from a [`UnsafeCell`].
        ///
        /// # Safety
        ///
        /// Caller must guarantee there are no mutable aliases to the
        /// underlying data.
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret;

        /// Runs `f` against a mutable reference borrowed from a [`UnsafeCell`].
        ///
        /// # Safety
        ///
        /// Caller must guarantee there are no other aliases to the underlying
        /// data.
        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret;
    }

    #[cfg(not(loom))]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            f(unsafe { &*self.get() })
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no other aliases.
            f(unsafe { &mut *self.get() })
        }
    }

    #[cfg(loom)]
    impl<T: ?Sized> UnsafeCellWith<T> for UnsafeCell<T> {
        unsafe fn with_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no mutable aliases.
            self.with(|ptr| f(unsafe { &*ptr }))
        }

        unsafe fn with_mut_unchecked<F, Ret>(&self, f: F) -> Ret
        where
            F: FnOnce(&mut T) -> Ret,
        {
            // SAFETY: Caller guaranteed that there are no other aliases.
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

#[cfg(test)]
pub mod sync {
    #[cfg(not(loom))]
    pub use std::sync::Arc;

    #[cfg(loom)]
    pub use loom::sync::Arc;
}

pub mod thread {
    #[cfg(not(all(loom, test)))]
    pub use std::thread::yield_now;

    #[cfg(not(all(loom, test)))]
    pub use std::thread_local;

    #[cfg(all(loom, test))]
    pub use loom::thread::yield_now;

    #[cfg(all(loom, test))]
    pub use loom::thread_local;
}
