use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, SeqCst};

use crate::cfg::atomic::{AtomicI32, AtomicU32};
use crate::diag::{fatal, trace};
use crate::guard::{ReadGuard, WriteGuard};
use crate::relax;
use crate::sys::{Futex, Sys, WAKE_ALL};
use crate::thread::ThreadId;

#[cfg(test)]
use crate::test::RawLock;

/// The lock word of an unlocked lock.
const UNLOCKED: i32 = 0;

/// The lock word of a write-locked lock. Positive values count readers.
const WRITE_LOCKED: i32 = -1;

#[inline(always)]
const fn is_readable(state: i32) -> bool {
    state >= UNLOCKED
}

#[inline(always)]
const fn is_unlocked(state: i32) -> bool {
    state == UNLOCKED
}

/// A readers-writer lock.
///
/// Any number of readers, or a single writer, may hold the lock at a time.
/// The lock word is `-1` while write-locked and the number of readers
/// otherwise. Blocked threads register themselves in a separate waiter
/// counter.
///
/// Releasing the last reader or the writer wakes every blocked thread: an
/// arbitrary mix of readers and writers may be eligible to proceed, and the
/// unlocker has no cheap way to tell them apart. The lock provides no
/// fairness guarantees, neither readers nor writers are preferred. The lack
/// of writer preference is deliberate, not a missing feature: a steady stream
/// of readers may starve a writer.
///
/// # Examples
///
/// ```
/// use std::thread;
///
/// use futexlock::RwLock;
///
/// let lock = RwLock::new();
/// lock.read_lock();
/// thread::scope(|s| {
///     s.spawn(|| {
///         assert!(lock.try_read_lock());
///         lock.unlock();
///         assert!(!lock.try_write_lock());
///     });
/// });
/// lock.unlock();
/// assert!(lock.try_write_lock());
/// lock.unlock();
/// ```
pub struct RwLock<F = Sys> {
    state: AtomicI32,
    owner: AtomicU32,
    waiters: AtomicU32,
    futex: PhantomData<fn() -> F>,
}

impl RwLock {
    /// Creates a new readers-writer lock in an unlocked state ready for use.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::with_backend()
    }
}

impl<F> RwLock<F> {
    /// Creates a new readers-writer lock backed by the futex backend `F`
    /// (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn with_backend() -> Self {
        Self {
            state: AtomicI32::new(UNLOCKED),
            owner: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            futex: PhantomData,
        }
    }

    /// Creates a new, Loom based readers-writer lock (non-const).
    #[cfg(all(loom, test))]
    #[must_use]
    pub fn with_backend() -> Self {
        Self {
            state: AtomicI32::new(UNLOCKED),
            owner: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            futex: PhantomData,
        }
    }

    /// Returns `true` if some thread holds this lock for writing.
    #[must_use]
    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Relaxed) == WRITE_LOCKED
    }

    /// Returns the number of threads holding this lock for reading.
    ///
    /// The result is only a snapshot, it may be stale as soon as it returns.
    #[must_use]
    #[inline]
    pub fn readers(&self) -> u32 {
        u32::try_from(self.state.load(Relaxed)).unwrap_or(0)
    }

    fn owner(&self) -> Option<ThreadId> {
        ThreadId::new(self.owner.load(Relaxed))
    }
}

impl<F: Futex> RwLock<F> {
    /// Acquires this lock for reading, blocking the current thread while it
    /// is write-locked.
    pub fn read_lock(&self) {
        let mut state = self.state.load(Relaxed);
        loop {
            if is_readable(state) {
                if state == i32::MAX {
                    fatal!("rwlock read lock failed, too many readers");
                }
                match self.state.compare_exchange_weak(state, state + 1, Acquire, Relaxed) {
                    Ok(_) => return,
                    Err(actual) => state = actual,
                }
            } else {
                self.lock_contended(is_readable);
                state = self.state.load(Relaxed);
            }
        }
    }

    /// Acquires this lock for writing, blocking the current thread until no
    /// other thread holds it.
    pub fn write_lock(&self) {
        let current = ThreadId::current();
        debug_assert_ne!(self.owner(), Some(current), "relocking a write-locked rwlock");
        loop {
            match self.state.compare_exchange_weak(UNLOCKED, WRITE_LOCKED, Acquire, Relaxed) {
                Ok(_) => break,
                Err(state) if is_unlocked(state) => {}
                Err(_) => self.lock_contended(is_unlocked),
            }
        }
        self.set_owner(current);
    }

    /// Waits until `ready` holds for the lock word, first spinning and then
    /// blocking as a registered waiter.
    #[cold]
    fn lock_contended(&self, ready: fn(i32) -> bool) {
        if relax::spin_wait(&self.state, ready) {
            return;
        }
        trace!("rwlock {:p} contended, blocking", self);
        self.waiters.fetch_add(1, SeqCst);
        let mut state = self.state.load(SeqCst);
        while !ready(state) {
            super::wait::<F>(&self.state, state);
            state = self.state.load(Relaxed);
        }
        self.waiters.fetch_sub(1, Relaxed);
    }

    /// Attempts to acquire this lock for reading without blocking.
    ///
    /// Returns `false` if the lock is write-locked.
    pub fn try_read_lock(&self) -> bool {
        let mut state = self.state.load(Relaxed);
        while is_readable(state) {
            if state == i32::MAX {
                fatal!("rwlock read lock failed, too many readers");
            }
            match self.state.compare_exchange_weak(state, state + 1, Acquire, Relaxed) {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
        false
    }

    /// Attempts to acquire this lock for writing without blocking.
    ///
    /// Returns `false` if any thread holds the lock.
    pub fn try_write_lock(&self) -> bool {
        let current = ThreadId::current();
        loop {
            match self.state.compare_exchange_weak(UNLOCKED, WRITE_LOCKED, Acquire, Relaxed) {
                Ok(_) => break,
                Err(state) if is_unlocked(state) => {}
                Err(_) => return false,
            }
        }
        self.set_owner(current);
        true
    }

    /// Releases this lock, from whichever mode the calling thread holds it
    /// in.
    ///
    /// # Aborts
    ///
    /// Terminates the process if the lock is write-locked by another thread,
    /// or if it is not locked at all.
    pub fn unlock(&self) {
        match self.owner() {
            None => self.read_unlock(),
            Some(owner) if owner == ThreadId::current() => self.write_unlock(),
            Some(owner) => {
                fatal!("trying to unlock a rwlock which is write-locked by thread {owner}");
            }
        }
    }

    fn read_unlock(&self) {
        let mut state = self.state.load(Relaxed);
        loop {
            if state <= UNLOCKED {
                fatal!("rwlock read unlock got unexpected state {state}, is the rwlock read-locked?");
            }
            let new = state - 1;
            // The waiter count must not be read before the lock word is
            // updated, otherwise a thread registering in between sleeps
            // through its wake up.
            match self.state.compare_exchange_weak(state, new, SeqCst, Relaxed) {
                Ok(_) => {
                    if is_unlocked(new) && self.waiters.load(SeqCst) > 0 {
                        super::wake::<F>(&self.state, WAKE_ALL);
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }

    fn write_unlock(&self) {
        let state = self.state.load(Relaxed);
        if state != WRITE_LOCKED {
            fatal!("rwlock write unlock got unexpected state {state}, is the rwlock write-locked?");
        }
        self.owner.store(0, Relaxed);
        if let Err(state) = self.state.compare_exchange(WRITE_LOCKED, UNLOCKED, SeqCst, Relaxed) {
            fatal!("rwlock write unlock got unexpected state {state} while unlocking");
        }
        if self.waiters.load(SeqCst) > 0 {
            super::wake::<F>(&self.state, WAKE_ALL);
        }
    }

    fn set_owner(&self, thread: ThreadId) {
        debug_assert_eq!(self.owner.load(Relaxed), 0);
        self.owner.store(thread.get(), Relaxed);
    }

    /// Acquires this lock for reading and returns an RAII guard that releases
    /// it when dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::RwLock;
    ///
    /// let lock = RwLock::new();
    /// let first = lock.read();
    /// let second = lock.read();
    /// assert_eq!(lock.readers(), 2);
    /// drop((first, second));
    /// assert_eq!(lock.readers(), 0);
    /// ```
    #[inline]
    pub fn read(&self) -> ReadGuard<'_, F> {
        ReadGuard::new(self)
    }

    /// Acquires this lock for writing and returns an RAII guard that releases
    /// it when dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::RwLock;
    ///
    /// let lock = RwLock::new();
    /// {
    ///     let _guard = lock.write();
    ///     assert!(lock.is_write_locked());
    /// }
    /// assert!(!lock.is_write_locked());
    /// ```
    #[inline]
    pub fn write(&self) -> WriteGuard<'_, F> {
        WriteGuard::new(self)
    }
}

impl<F> Drop for RwLock<F> {
    fn drop(&mut self) {
        let state = self.state.load(Relaxed);
        if state != UNLOCKED {
            fatal!("rwlock destruction failed, state is non zero: {state}");
        }
        if let Some(owner) = self.owner() {
            fatal!("rwlock destruction failed, rwlock is owned by thread {owner}");
        }
        let waiters = self.waiters.load(Relaxed);
        if waiters != 0 {
            fatal!("rwlock destruction failed, waiters is non zero: {waiters}");
        }
    }
}

impl Default for RwLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Debug for RwLock<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("state", &self.state.load(Relaxed))
            .field("owner", &self.owner())
            .field("waiters", &self.waiters.load(Relaxed))
            .finish()
    }
}

#[cfg(test)]
impl<F: Futex> RawLock for RwLock<F> {
    type Guard<'a> = WriteGuard<'a, F>
    where
        Self: 'a;

    fn guard(&self) -> Self::Guard<'_> {
        self.write()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;

    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use super::{RwLock, UNLOCKED, WRITE_LOCKED};
    use crate::sys::emulated;
    use crate::test::tests;

    fn new() -> RwLock {
        RwLock::new()
    }

    fn emulated() -> RwLock<emulated::Futex> {
        RwLock::with_backend()
    }

    fn leaked(lock: RwLock) -> &'static RwLock {
        Box::leak(Box::new(lock))
    }

    #[test]
    fn smoke() {
        tests::smoke(new);
        tests::smoke(emulated);
    }

    #[test]
    fn lots_and_lots_write_lock() {
        tests::lots_and_lots_lock(new);
    }

    #[test]
    fn lots_and_lots_write_lock_emulated() {
        tests::lots_and_lots_lock(emulated);
    }

    #[test]
    fn writers_are_mutually_exclusive() {
        tests::mutual_exclusion(new);
        tests::mutual_exclusion(emulated);
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind(new);
    }

    #[test]
    fn read_lock_counts_readers() {
        let lock = RwLock::new();
        lock.read_lock();
        lock.read_lock();
        assert_eq!(lock.state.load(Relaxed), 2);
        assert_eq!(lock.readers(), 2);
        assert!(!lock.try_write_lock());
        lock.unlock();
        lock.unlock();
        assert_eq!(lock.state.load(Relaxed), UNLOCKED);
    }

    #[test]
    fn write_lock_sets_owner() {
        let lock = RwLock::new();
        lock.write_lock();
        assert_eq!(lock.state.load(Relaxed), WRITE_LOCKED);
        assert!(lock.is_write_locked());
        assert_eq!(lock.readers(), 0);
        assert!(!lock.try_read_lock());
        assert!(!lock.try_write_lock());
        lock.unlock();
        assert_eq!(lock.state.load(Relaxed), UNLOCKED);
        assert_eq!(lock.owner.load(Relaxed), 0);
    }

    #[test]
    fn readers_block_writer() {
        const READERS: usize = 4;
        let lock = RwLock::new();
        let locked = Barrier::new(READERS + 1);
        let release = Barrier::new(READERS + 1);
        let released = AtomicU32::new(0);
        let written = AtomicBool::new(false);
        thread::scope(|s| {
            for _ in 0..READERS {
                s.spawn(|| {
                    lock.read_lock();
                    locked.wait();
                    release.wait();
                    released.fetch_add(1, Relaxed);
                    lock.unlock();
                });
            }
            locked.wait();
            assert_eq!(lock.readers(), READERS as u32);
            s.spawn(|| {
                lock.write_lock();
                // Every reader counts itself out before unlocking.
                assert_eq!(released.load(Relaxed), READERS as u32);
                written.store(true, Relaxed);
                lock.unlock();
            });
            // Long enough for the writer to block.
            thread::sleep(Duration::from_millis(50));
            assert!(!written.load(Relaxed));
            release.wait();
        });
        assert!(written.load(Relaxed));
        assert_eq!(lock.state.load(Relaxed), UNLOCKED);
        assert_eq!(lock.waiters.load(Relaxed), 0);
    }

    #[test]
    fn writer_blocks_readers() {
        const READERS: usize = 3;
        let lock = Arc::new(RwLock::new());
        lock.write_lock();
        let handles: Vec<_> = (0..READERS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    lock.read_lock();
                    assert!(!lock.is_write_locked());
                    lock.unlock();
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        assert!(lock.is_write_locked());
        lock.unlock();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lock.state.load(Relaxed), UNLOCKED);
    }

    #[test]
    fn reader_count_never_negative() {
        const THREADS: usize = 4;
        const ITERS: usize = 500;
        let lock = RwLock::new();
        thread::scope(|s| {
            for i in 0..THREADS {
                let lock = &lock;
                s.spawn(move || {
                    for _ in 0..ITERS {
                        if i % 2 == 0 {
                            lock.read_lock();
                            assert!(lock.state.load(Relaxed) > 0);
                        } else {
                            lock.write_lock();
                            assert_eq!(lock.state.load(Relaxed), WRITE_LOCKED);
                        }
                        lock.unlock();
                    }
                });
            }
        });
        assert_eq!(lock.state.load(Relaxed), UNLOCKED);
    }

    #[test]
    fn debug_shows_state() {
        let lock = RwLock::new();
        lock.read_lock();
        let msg = "RwLock { state: 1, owner: None, waiters: 0 }";
        assert_eq!(format!("{lock:?}"), msg);
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "is the rwlock read-locked?")]
    fn unlock_unlocked_is_fatal() {
        let lock = RwLock::new();
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "write-locked by thread")]
    fn unlock_from_other_thread_is_fatal() {
        let lock = leaked(RwLock::new());
        thread::spawn(move || lock.write_lock()).join().unwrap();
        lock.unlock();
    }

    #[test]
    #[should_panic(expected = "rwlock destruction failed")]
    fn drop_read_locked_is_fatal() {
        let lock = RwLock::new();
        lock.read_lock();
        drop(lock);
    }

    #[test]
    #[should_panic(expected = "waiters is non zero")]
    fn drop_with_waiters_is_fatal() {
        let lock = RwLock::new();
        lock.waiters.store(1, Relaxed);
        drop(lock);
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
mod model {
    use loom::sync::Arc;
    use loom::{model, thread};

    use crate::loom::models;
    use crate::raw::RwLock;

    #[test]
    fn write_lock_join() {
        models::lock_join(RwLock::new);
    }

    #[test]
    fn readers_exclude_writer() {
        model(|| {
            let lock = Arc::new(RwLock::new());
            let c_lock = Arc::clone(&lock);
            let reader = thread::spawn(move || {
                c_lock.read_lock();
                assert!(!c_lock.is_write_locked());
                c_lock.unlock();
            });
            lock.write_lock();
            assert_eq!(lock.readers(), 0);
            lock.unlock();
            lock.read_lock();
            assert!(!lock.is_write_locked());
            lock.unlock();
            reader.join().unwrap();
            assert_eq!(lock.readers(), 0);
        });
    }
}
