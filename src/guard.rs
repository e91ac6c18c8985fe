//! RAII guards over the raw locks.
//!
//! A guard acquires its lock on construction and releases it when dropped,
//! including when the scope is left by unwinding. Guards only borrow the lock,
//! they never own it or any data it may protect.
//!
//! Exclusive guards are not [`Send`]: the locks record their owner, and
//! releasing them from any other thread terminates the process.

use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;

use crate::raw::{Mutex, RwLock};
use crate::sys::{Futex, Sys};

/// Marks a guard that must be dropped by the thread that created it.
type NotSend = PhantomData<*const ()>;

/// An RAII guard that holds a [`Mutex`] locked until dropped.
///
/// This structure is returned by [`Mutex::guard`], and may also be created
/// with [`MutexGuard::new`].
///
/// # Examples
///
/// ```
/// use futexlock::{Mutex, MutexGuard};
///
/// let mutex = Mutex::recursive();
/// let outer = MutexGuard::new(&mutex);
/// let inner = MutexGuard::new(&mutex);
/// drop(inner);
/// assert!(outer.mutex().is_held_by_current_thread());
/// drop(outer);
/// assert!(!mutex.is_locked());
/// ```
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, F: Futex = Sys> {
    mutex: &'a Mutex<F>,
    marker: NotSend,
}

// SAFETY: Sharing a guard only gives access to `&Mutex`, which is `Sync`.
unsafe impl<F: Futex> Sync for MutexGuard<'_, F> {}

impl<'a, F: Futex> MutexGuard<'a, F> {
    /// Locks `mutex`, blocking the current thread until it is able to do so.
    #[inline]
    pub fn new(mutex: &'a Mutex<F>) -> Self {
        mutex.lock();
        Self { mutex, marker: PhantomData }
    }

    /// Returns the locked mutex.
    #[must_use]
    #[inline]
    pub fn mutex(&self) -> &'a Mutex<F> {
        self.mutex
    }
}

impl<F: Futex> Drop for MutexGuard<'_, F> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<F: Futex> Debug for MutexGuard<'_, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard").field("mutex", self.mutex).finish()
    }
}

/// An RAII guard that holds a [`RwLock`] read-locked until dropped.
///
/// Readers have no owner, so unlike the exclusive guards this one may be
/// dropped by a different thread.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct ReadGuard<'a, F: Futex = Sys> {
    lock: &'a RwLock<F>,
}

impl<'a, F: Futex> ReadGuard<'a, F> {
    /// Read-locks `lock`, blocking the current thread while it is
    /// write-locked.
    #[inline]
    pub fn new(lock: &'a RwLock<F>) -> Self {
        lock.read_lock();
        Self { lock }
    }
}

impl<F: Futex> Drop for ReadGuard<'_, F> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl<F: Futex> Debug for ReadGuard<'_, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard").field("lock", self.lock).finish()
    }
}

/// An RAII guard that holds a [`RwLock`] write-locked until dropped.
#[must_use = "if unused the RwLock will immediately unlock"]
pub struct WriteGuard<'a, F: Futex = Sys> {
    lock: &'a RwLock<F>,
    marker: NotSend,
}

// SAFETY: Sharing a guard only gives access to `&RwLock`, which is `Sync`.
unsafe impl<F: Futex> Sync for WriteGuard<'_, F> {}

impl<'a, F: Futex> WriteGuard<'a, F> {
    /// Write-locks `lock`, blocking the current thread until no other thread
    /// holds it.
    #[inline]
    pub fn new(lock: &'a RwLock<F>) -> Self {
        lock.write_lock();
        Self { lock, marker: PhantomData }
    }
}

impl<F: Futex> Drop for WriteGuard<'_, F> {
    #[inline]
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

impl<F: Futex> Debug for WriteGuard<'_, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard").field("lock", self.lock).finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc::channel;
    use std::thread;

    use super::{MutexGuard, ReadGuard, WriteGuard};
    use crate::raw::{Mutex, RwLock};

    #[test]
    fn mutex_guard_unlocks_on_drop() {
        let mutex = Mutex::new();
        let guard = MutexGuard::new(&mutex);
        assert!(guard.mutex().is_held_by_current_thread());
        drop(guard);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn mutex_guard_unlocks_on_early_return() {
        fn locked_then_return(mutex: &Mutex, early: bool) -> bool {
            let _guard = mutex.guard();
            if early {
                return true;
            }
            false
        }
        let mutex = Mutex::new();
        assert!(locked_then_return(&mutex, true));
        assert!(!mutex.is_locked());
        assert!(!locked_then_return(&mutex, false));
        assert!(!mutex.is_locked());
    }

    #[test]
    fn mutex_guard_unlocks_on_unwind() {
        let mutex = Mutex::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = mutex.guard();
            panic!("unwinding with the mutex locked");
        }));
        assert!(result.is_err());
        assert!(!mutex.is_locked());
    }

    #[test]
    fn read_guard_moves_across_threads() {
        let lock = RwLock::new();
        let (tx, rx) = channel();
        thread::scope(|s| {
            let lock = &lock;
            s.spawn(move || tx.send(lock.read()).unwrap());
            let guard: ReadGuard<'_> = rx.recv().unwrap();
            assert_eq!(lock.readers(), 1);
            drop(guard);
        });
        assert_eq!(lock.readers(), 0);
    }

    #[test]
    fn write_guard_excludes_readers() {
        let lock = RwLock::new();
        let guard = WriteGuard::new(&lock);
        thread::scope(|s| {
            s.spawn(|| assert!(!lock.try_read_lock()));
        });
        drop(guard);
        assert!(lock.try_read_lock());
        lock.unlock();
    }

    #[test]
    fn guard_debug() {
        let mutex = Mutex::new();
        let guard = mutex.guard();
        let debug = format!("{guard:?}");
        assert!(debug.starts_with("MutexGuard { mutex: Mutex { locked: true"));
    }
}
