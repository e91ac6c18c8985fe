use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crate::cfg::atomic::{AtomicI32, AtomicU32};
use crate::diag::{fatal, trace};
use crate::guard::MutexGuard;
use crate::relax;
use crate::sys::{Futex, Sys, WAKE_ONE};
use crate::thread::ThreadId;

#[cfg(test)]
use crate::test::RawLock;

/// The lowest bit of the lock word: set while the mutex is held.
const HELD_MASK: i32 = 1;

/// The remaining bits of the lock word count the waiters.
const WAITER_SHIFT: u32 = 1;

/// The amount added to the lock word per registered waiter.
const WAITER_INCREMENT: i32 = 1 << WAITER_SHIFT;

/// The number of `try_lock` attempts made by [`Mutex::try_lock_with_spinning`].
const TRY_LOCK_ATTEMPTS: u32 = 10;

/// Returns `true` if the lock word has the held bit clear.
#[inline(always)]
const fn is_unlocked(state: i32) -> bool {
    state & HELD_MASK == 0
}

/// A mutual exclusion primitive, optionally recursive.
///
/// The whole lock state lives in a single 32-bit word: the lowest bit is the
/// held flag, the remaining bits count the threads blocked on it. Keeping both
/// in the same word lets [`unlock`] decide whether a wake up is needed from the
/// result of the very CAS that releases the lock.
///
/// The mutex records its owner, so it must be unlocked by the thread that
/// locked it. A recursive mutex may be locked again by its owner and is only
/// released once every [`lock`] has been matched by an [`unlock`]. Relocking a
/// non-recursive mutex from its owner is a bug, it deadlocks in release builds.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::thread;
///
/// use futexlock::Mutex;
///
/// let mutex = Arc::new(Mutex::new());
/// let c_mutex = Arc::clone(&mutex);
///
/// thread::spawn(move || {
///     c_mutex.lock();
///     // Critical section.
///     c_mutex.unlock();
/// })
/// .join().expect("thread::spawn failed");
///
/// assert!(mutex.try_lock());
/// mutex.unlock();
/// ```
/// [`lock`]: Mutex::lock
/// [`unlock`]: Mutex::unlock
pub struct Mutex<F = Sys> {
    pub(super) state: AtomicI32,
    owner: AtomicU32,
    // Only ever accessed by the owner.
    pub(super) recursion: AtomicU32,
    recursive: bool,
    futex: PhantomData<fn() -> F>,
}

impl Mutex {
    /// Creates a new, non-recursive mutex in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// assert!(!mutex.is_recursive());
    /// ```
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::with_backend(false)
    }

    /// Creates a new, recursive mutex in an unlocked state ready for use.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::Mutex;
    ///
    /// let mutex = Mutex::recursive();
    /// mutex.lock();
    /// mutex.lock();
    /// mutex.unlock();
    /// assert!(mutex.is_held_by_current_thread());
    /// mutex.unlock();
    /// assert!(!mutex.is_locked());
    /// ```
    #[must_use]
    #[inline]
    pub fn recursive() -> Self {
        Self::with_backend(true)
    }
}

impl<F> Mutex<F> {
    /// Creates a new mutex backed by the futex backend `F` (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn with_backend(recursive: bool) -> Self {
        Self {
            state: AtomicI32::new(0),
            owner: AtomicU32::new(0),
            recursion: AtomicU32::new(0),
            recursive,
            futex: PhantomData,
        }
    }

    /// Creates a new, Loom based mutex (non-const).
    #[cfg(all(loom, test))]
    #[must_use]
    pub fn with_backend(recursive: bool) -> Self {
        Self {
            state: AtomicI32::new(0),
            owner: AtomicU32::new(0),
            recursion: AtomicU32::new(0),
            recursive,
            futex: PhantomData,
        }
    }

    /// Returns `true` if this mutex was created recursive.
    #[must_use]
    #[inline]
    pub fn is_recursive(&self) -> bool {
        self.recursive
    }

    /// Returns `true` if some thread holds this mutex.
    ///
    /// The result is only a snapshot, it may be stale as soon as it returns.
    #[must_use]
    #[inline]
    pub fn is_locked(&self) -> bool {
        !is_unlocked(self.state.load(Relaxed))
    }

    /// Returns `true` if the calling thread holds this mutex.
    #[must_use]
    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.is_held(ThreadId::current())
    }

    /// Returns the thread that holds this mutex, if any.
    #[must_use]
    #[inline]
    pub fn owner(&self) -> Option<ThreadId> {
        ThreadId::new(self.owner.load(Relaxed))
    }

    /// Returns `true` if `thread` is the exclusive owner.
    #[inline(always)]
    pub(super) fn is_held(&self, thread: ThreadId) -> bool {
        self.owner.load(Relaxed) == thread.get()
    }

    /// Returns the number of threads registered as waiters.
    #[inline]
    pub(super) fn waiters(&self) -> u32 {
        // The word is reinterpreted as unsigned, so that the waiter count
        // never sign extends.
        (self.state.load(Relaxed) as u32) >> WAITER_SHIFT
    }

    #[inline]
    pub(super) fn increment_waiters(&self) {
        self.state.fetch_add(WAITER_INCREMENT, Relaxed);
    }

    #[inline]
    pub(super) fn decrement_waiters(&self) {
        self.state.fetch_sub(WAITER_INCREMENT, Relaxed);
    }

    /// Records `thread` as the owner, right after winning the held bit.
    #[inline]
    fn set_owner(&self, thread: ThreadId) {
        debug_assert!(!is_unlocked(self.state.load(Relaxed)));
        debug_assert_eq!(self.owner.load(Relaxed), 0);
        self.owner.store(thread.get(), Relaxed);
        let count = self.recursion.fetch_add(1, Relaxed);
        // Reentrant acquisitions take a separate path.
        debug_assert_eq!(count, 0);
    }

    /// Takes the recursive path if `thread` already holds this mutex.
    #[inline]
    fn try_relock(&self, thread: ThreadId) -> bool {
        let relock = self.recursive && self.is_held(thread);
        if relock {
            self.recursion.fetch_add(1, Relaxed);
        }
        relock
    }
}

impl<F: Futex> Mutex<F> {
    /// Acquires this mutex, blocking the current thread until it is able to do
    /// so.
    ///
    /// If the mutex is recursive and already held by the calling thread, this
    /// only increments the recursion count.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// mutex.lock();
    /// assert!(mutex.is_held_by_current_thread());
    /// mutex.unlock();
    /// ```
    pub fn lock(&self) {
        let current = ThreadId::current();
        if self.try_relock(current) {
            return;
        }
        debug_assert!(!self.is_held(current), "relocking a non-recursive mutex");
        let mut state = self.state.load(Relaxed);
        loop {
            if is_unlocked(state) {
                let new = state | HELD_MASK;
                match self.state.compare_exchange_weak(state, new, Acquire, Relaxed) {
                    Ok(_) => break,
                    Err(actual) => state = actual,
                }
            } else {
                self.lock_contended(state);
                state = self.state.load(Relaxed);
            }
        }
        self.set_owner(current);
    }

    /// Waits until the held bit is observed clear, first spinning and then
    /// blocking as a registered waiter.
    #[cold]
    fn lock_contended(&self, state: i32) {
        if relax::spin_wait(&self.state, is_unlocked) {
            return;
        }
        trace!("mutex {:p} contended, blocking", self);
        self.increment_waiters();
        // Expect our own registration, the futex reports a mismatch otherwise.
        let mut state = state.wrapping_add(WAITER_INCREMENT);
        // Under heavy contention the comparison may fail repeatedly as other
        // waiters come and go, keep waiting until the held bit clears.
        while !is_unlocked(state) {
            super::wait::<F>(&self.state, state);
            state = self.state.load(Relaxed);
        }
        self.decrement_waiters();
    }

    /// Attempts to acquire this mutex without blocking.
    ///
    /// Returns `false` if some other thread holds it.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::thread;
    ///
    /// use futexlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// assert!(mutex.try_lock());
    /// thread::scope(|s| {
    ///     s.spawn(|| assert!(!mutex.try_lock()));
    /// });
    /// mutex.unlock();
    /// ```
    pub fn try_lock(&self) -> bool {
        let current = ThreadId::current();
        if self.try_relock(current) {
            return true;
        }
        debug_assert!(!self.is_held(current), "relocking a non-recursive mutex");
        let mut state = self.state.load(Relaxed);
        loop {
            if !is_unlocked(state) {
                return false;
            }
            let new = state | HELD_MASK;
            match self.state.compare_exchange_weak(state, new, Acquire, Relaxed) {
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }
        self.set_owner(current);
        true
    }

    /// Attempts to acquire this mutex, spinning for a bounded amount of time
    /// in between attempts, but never blocking.
    ///
    /// Returns `false` if the mutex is still held once the spin budget is
    /// exhausted.
    pub fn try_lock_with_spinning(&self) -> bool {
        for _ in 0..TRY_LOCK_ATTEMPTS {
            if self.try_lock() {
                return true;
            }
            if !relax::spin_wait(&self.state, is_unlocked) {
                return false;
            }
        }
        false
    }

    /// Releases this mutex.
    ///
    /// A recursive mutex is only released once its recursion count drops to
    /// zero. If other threads are blocked on the mutex, one of them is woken
    /// up.
    ///
    /// # Aborts
    ///
    /// Terminates the process if the calling thread does not hold this mutex.
    pub fn unlock(&self) {
        let current = ThreadId::current();
        if !self.is_held(current) {
            fatal!("trying to unlock a mutex which is not held by the current thread {current}");
        }
        let count = self.recursion.fetch_sub(1, Relaxed).saturating_sub(1);
        if self.recursive && count > 0 {
            return;
        }
        debug_assert_eq!(count, 0);
        let mut state = self.state.load(Relaxed);
        loop {
            if is_unlocked(state) {
                fatal!("mutex unlock got unexpected state {state:#x}, is the mutex unlocked?");
            }
            // Clear the owner first, so that nobody observes the mutex
            // unlocked while still owned.
            self.owner.store(0, Relaxed);
            let new = state & !HELD_MASK;
            match self.state.compare_exchange_weak(state, new, Release, Relaxed) {
                Ok(_) => {
                    // Any remaining bits are registered waiters.
                    if new != 0 {
                        super::wake::<F>(&self.state, WAKE_ONE);
                    }
                    return;
                }
                Err(actual) => state = actual,
            }
        }
    }

    /// Acquires this mutex and returns an RAII guard that releases it when
    /// dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// {
    ///     let _guard = mutex.guard();
    ///     assert!(mutex.is_locked());
    /// }
    /// assert!(!mutex.is_locked());
    /// ```
    #[inline]
    pub fn guard(&self) -> MutexGuard<'_, F> {
        MutexGuard::new(self)
    }
}

impl<F> Mutex<F> {
    /// Marks this mutex as held by `thread`, without `thread` running the
    /// acquire protocol.
    ///
    /// This is a hand off for freshly created mutexes, for example when a
    /// lightweight object lock is inflated into this mutex on behalf of its
    /// current holder. The mutex must not be in use by any other thread yet,
    /// this is not checked.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::thread::ThreadId;
    /// use futexlock::Mutex;
    ///
    /// let mutex = Mutex::new();
    /// let thread = ThreadId::new(42).unwrap();
    /// mutex.lock_for_other(thread);
    /// assert_eq!(mutex.owner(), Some(thread));
    /// mutex.unlock_for_other(thread);
    /// assert!(!mutex.is_locked());
    /// ```
    pub fn lock_for_other(&self, thread: ThreadId) {
        debug_assert_eq!(self.state.load(Relaxed), 0, "handing off a mutex in use");
        self.state.store(HELD_MASK, Relaxed);
        self.recursion.store(1, Relaxed);
        self.owner.store(thread.get(), Relaxed);
    }

    /// Releases a mutex previously handed off to `thread` with
    /// [`lock_for_other`], without `thread` running the release protocol.
    ///
    /// # Aborts
    ///
    /// Terminates the process if `thread` does not own this mutex.
    ///
    /// [`lock_for_other`]: Mutex::lock_for_other
    pub fn unlock_for_other(&self, thread: ThreadId) {
        if !self.is_held(thread) {
            fatal!("unlocking a mutex for thread {thread}, which does not own it");
        }
        debug_assert_eq!(self.state.load(Relaxed), HELD_MASK, "mutex has waiters");
        self.state.store(0, Relaxed);
        self.recursion.store(0, Relaxed);
        self.owner.store(0, Relaxed);
    }
}

impl<F> Drop for Mutex<F> {
    fn drop(&mut self) {
        let state = self.state.load(Relaxed);
        if state != 0 {
            fatal!("mutex destruction failed, state and waiters is non zero: {state:#x}");
        }
        if let Some(owner) = self.owner() {
            fatal!("mutex destruction failed, mutex is owned by thread {owner}");
        }
    }
}

impl Default for Mutex {
    /// Creates a new, non-recursive `Mutex`.
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Debug for Mutex<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner())
            .field("waiters", &self.waiters())
            .field("recursive", &self.recursive)
            .finish()
    }
}

#[cfg(test)]
impl<F: Futex> RawLock for Mutex<F> {
    type Guard<'a> = MutexGuard<'a, F>
    where
        Self: 'a;

    fn guard(&self) -> Self::Guard<'_> {
        Mutex::guard(self)
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;

    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::{Mutex, HELD_MASK, WAITER_INCREMENT};
    use crate::sys::emulated;
    use crate::test::tests;
    use crate::thread::ThreadId;

    type EmulatedMutex = Mutex<emulated::Futex>;

    fn new() -> Mutex {
        Mutex::new()
    }

    fn recursive() -> Mutex {
        Mutex::recursive()
    }

    fn emulated() -> EmulatedMutex {
        Mutex::with_backend(false)
    }

    /// Leaks a mutex, misuse tests must not run its destructor checks while
    /// unwinding.
    fn leaked(mutex: Mutex) -> &'static Mutex {
        Box::leak(Box::new(mutex))
    }

    #[test]
    fn smoke() {
        tests::smoke(new);
        tests::smoke(recursive);
        tests::smoke(emulated);
    }

    #[test]
    fn lots_and_lots_lock() {
        tests::lots_and_lots_lock(new);
    }

    #[test]
    fn lots_and_lots_lock_recursive() {
        tests::lots_and_lots_lock(recursive);
    }

    #[test]
    fn lots_and_lots_lock_emulated() {
        tests::lots_and_lots_lock(emulated);
    }

    #[test]
    fn mutual_exclusion() {
        tests::mutual_exclusion(new);
        tests::mutual_exclusion(emulated);
    }

    #[test]
    fn test_acquire_more_than_one_lock() {
        tests::test_acquire_more_than_one_lock(new);
    }

    #[test]
    fn test_lock_arc_access_in_unwind() {
        tests::test_lock_arc_access_in_unwind(new);
    }

    #[test]
    fn lock_sets_owner_and_held_bit() {
        let mutex = Mutex::new();
        mutex.lock();
        assert_eq!(mutex.state.load(Relaxed), HELD_MASK);
        assert_eq!(mutex.owner(), Some(ThreadId::current()));
        assert_eq!(mutex.recursion.load(Relaxed), 1);
        mutex.unlock();
        assert_eq!(mutex.state.load(Relaxed), 0);
        assert_eq!(mutex.owner(), None);
        assert_eq!(mutex.recursion.load(Relaxed), 0);
    }

    #[test]
    fn waiters_do_not_clobber_held_bit() {
        let mutex = Mutex::new();
        mutex.increment_waiters();
        mutex.increment_waiters();
        assert_eq!(mutex.waiters(), 2);
        assert!(!mutex.is_locked());
        mutex.lock();
        assert_eq!(mutex.state.load(Relaxed), 2 * WAITER_INCREMENT | HELD_MASK);
        mutex.decrement_waiters();
        mutex.decrement_waiters();
        mutex.unlock();
    }

    #[test]
    fn recursive_balance() {
        const DEPTH: usize = 5;
        let mutex = Mutex::recursive();
        for _ in 0..DEPTH {
            mutex.lock();
        }
        assert_eq!(mutex.recursion.load(Relaxed), DEPTH as u32);
        for _ in 0..DEPTH - 1 {
            mutex.unlock();
        }
        // One level is still held.
        thread::scope(|s| {
            s.spawn(|| assert!(!mutex.try_lock()));
        });
        mutex.unlock();
        thread::scope(|s| {
            s.spawn(|| {
                assert!(mutex.try_lock());
                mutex.unlock();
            });
        });
        assert!(!mutex.is_locked());
    }

    #[test]
    fn recursive_try_lock_reenters() {
        let mutex = Mutex::recursive();
        assert!(mutex.try_lock());
        assert!(mutex.try_lock());
        mutex.lock();
        assert_eq!(mutex.recursion.load(Relaxed), 3);
        for _ in 0..3 {
            mutex.unlock();
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn try_lock_with_spinning_free() {
        let mutex = Mutex::new();
        assert!(mutex.try_lock_with_spinning());
        mutex.unlock();
    }

    #[test]
    fn try_lock_with_spinning_held() {
        let mutex = Mutex::new();
        mutex.lock();
        thread::scope(|s| {
            s.spawn(|| assert!(!mutex.try_lock_with_spinning()));
        });
        mutex.unlock();
    }

    #[test]
    fn try_lock_until_release() {
        const HOLD: Duration = Duration::from_millis(50);
        let mutex = Mutex::new();
        let released = AtomicBool::new(false);
        let barrier = Barrier::new(2);
        thread::scope(|s| {
            s.spawn(|| {
                mutex.lock();
                barrier.wait();
                thread::sleep(HOLD);
                released.store(true, Relaxed);
                mutex.unlock();
            });
            s.spawn(|| {
                barrier.wait();
                // `released` is set before the unlock, a successful attempt
                // can only follow it.
                while !mutex.try_lock() {
                    assert!(!mutex.is_held_by_current_thread());
                }
                assert!(released.load(Relaxed));
                mutex.unlock();
            });
        });
    }

    #[test]
    fn blocked_lock_acquires_after_release() {
        const HOLD: Duration = Duration::from_millis(50);
        let mutex = Mutex::new();
        let (tx, rx) = channel();
        thread::scope(|s| {
            s.spawn(|| {
                mutex.lock();
                tx.send(()).unwrap();
                thread::sleep(HOLD);
                mutex.unlock();
            });
            rx.recv().unwrap();
            assert!(!mutex.try_lock());
            let start = Instant::now();
            mutex.lock();
            // Blocked for about as long as the other thread held the mutex.
            assert!(start.elapsed() >= HOLD / 2);
            assert!(start.elapsed() < HOLD + Duration::from_secs(5));
            mutex.unlock();
        });
    }

    #[test]
    fn contended_waiters_are_woken() {
        const THREADS: usize = 4;
        let mutex = Arc::new(Mutex::new());
        mutex.lock();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                thread::spawn(move || {
                    mutex.lock();
                    mutex.unlock();
                })
            })
            .collect();
        // Long enough for every thread to exhaust its spin budget and block.
        thread::sleep(Duration::from_millis(50));
        mutex.unlock();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(mutex.waiters(), 0);
        assert!(!mutex.is_locked());
    }

    #[test]
    fn hand_off_round_trip() {
        let mutex = Mutex::new();
        let thread = ThreadId::new(u32::MAX).unwrap();
        mutex.lock_for_other(thread);
        assert!(mutex.is_locked());
        assert_eq!(mutex.owner(), Some(thread));
        assert!(!mutex.is_held_by_current_thread());
        assert!(!mutex.try_lock());
        mutex.unlock_for_other(thread);
        assert_eq!(mutex.state.load(Relaxed), 0);
        assert_eq!(mutex.owner.load(Relaxed), 0);
        assert_eq!(mutex.recursion.load(Relaxed), 0);
    }

    #[test]
    fn hand_off_to_current_thread() {
        let mutex = Mutex::new();
        mutex.lock_for_other(ThreadId::current());
        assert!(mutex.is_held_by_current_thread());
        mutex.unlock();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn debug_shows_state() {
        let mutex = Mutex::recursive();
        let msg = "Mutex { locked: false, owner: None, waiters: 0, recursive: true }";
        assert_eq!(format!("{mutex:?}"), msg);
    }

    #[test]
    #[should_panic(expected = "not held by the current thread")]
    fn unlock_unlocked_is_fatal() {
        let mutex = Mutex::new();
        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "not held by the current thread")]
    fn unlock_from_other_thread_is_fatal() {
        let mutex = leaked(Mutex::new());
        thread::spawn(move || mutex.lock()).join().unwrap();
        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "does not own it")]
    fn unlock_for_wrong_thread_is_fatal() {
        let mutex = leaked(Mutex::new());
        mutex.lock_for_other(ThreadId::new(1).unwrap());
        mutex.unlock_for_other(ThreadId::new(2).unwrap());
    }

    #[test]
    #[should_panic(expected = "mutex destruction failed")]
    fn drop_locked_is_fatal() {
        let mutex = Mutex::new();
        mutex.lock();
        drop(mutex);
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
mod model {
    use crate::loom::models;
    use crate::raw::Mutex;

    #[test]
    fn lock_join() {
        models::lock_join(Mutex::new);
    }

    #[test]
    fn lock_join_recursive() {
        models::lock_join(Mutex::recursive);
    }
}
