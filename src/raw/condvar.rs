use core::fmt::{self, Debug, Formatter};
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering::Relaxed;

use crate::cfg::atomic::{AtomicI32, AtomicPtr};
use crate::diag::{fatal, trace};
use crate::raw::Mutex;
use crate::sys::{Error, Futex, Sys, Timeout, WAKE_ALL, WAKE_ONE};
use crate::thread::ThreadId;

/// A condition variable, used together with a [`Mutex`].
///
/// Waiting threads block on a generation counter, which every signal
/// increments. A signal issued by a thread holding the mutex the waiters are
/// bound to moves them straight into the wait queue of that mutex, instead of
/// waking them only to have them block again on the mutex.
///
/// All threads waiting at the same time must wait with the same mutex. Once
/// the last of them returns, a different mutex may be used.
///
/// Waits may return spuriously, callers must recheck their condition in a
/// loop.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::AtomicBool;
/// use std::sync::atomic::Ordering::Relaxed;
/// use std::thread;
///
/// use futexlock::{ConditionVariable, Mutex};
///
/// let mutex = Mutex::new();
/// let cond = ConditionVariable::new();
/// let ready = AtomicBool::new(false);
///
/// thread::scope(|s| {
///     s.spawn(|| {
///         mutex.lock();
///         ready.store(true, Relaxed);
///         cond.signal();
///         mutex.unlock();
///     });
///     mutex.lock();
///     while !ready.load(Relaxed) {
///         cond.wait(&mutex);
///     }
///     mutex.unlock();
/// });
/// ```
///
/// # Pairing with a mutex
///
/// The `'m` lifetime ties the condition variable to the mutexes it waits
/// with, so a struct can not own a `Mutex` together with a
/// `ConditionVariable` that waits on it. Keep the mutex in storage that
/// outlives the condition variable: a `static`, or an `Arc` or local that is
/// created before the condition variable and dropped after it.
///
/// ```
/// use futexlock::{ConditionVariable, Mutex};
///
/// static MUTEX: Mutex = Mutex::with_backend(false);
///
/// struct Event {
///     cond: ConditionVariable<'static>,
/// }
///
/// let event = Event { cond: ConditionVariable::new() };
/// MUTEX.lock();
/// while !event.cond.timed_wait(&MUTEX, 1, 0, false) {}
/// MUTEX.unlock();
/// ```
///
/// ```
/// use std::sync::Arc;
///
/// use futexlock::{ConditionVariable, Mutex};
///
/// let mutex = Arc::new(Mutex::new());
/// // Borrows from `mutex`, which is dropped last.
/// let cond = ConditionVariable::new();
/// mutex.lock();
/// while !cond.timed_wait(&mutex, 1, 0, false) {}
/// mutex.unlock();
/// ```
pub struct ConditionVariable<'m, F = Sys> {
    // Null outside of a waiting epoch.
    mutex: AtomicPtr<Mutex<F>>,
    cond: AtomicI32,
    waiters: AtomicI32,
    marker: PhantomData<&'m Mutex<F>>,
}

impl ConditionVariable<'_> {
    /// Creates a new condition variable with no waiters.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::with_backend()
    }
}

impl<'m, F> ConditionVariable<'m, F> {
    /// Creates a new condition variable backed by the futex backend `F`
    /// (const).
    #[cfg(not(all(loom, test)))]
    #[must_use]
    pub const fn with_backend() -> Self {
        Self {
            mutex: AtomicPtr::new(ptr::null_mut()),
            cond: AtomicI32::new(0),
            waiters: AtomicI32::new(0),
            marker: PhantomData,
        }
    }

    /// Creates a new, Loom based condition variable (non-const).
    #[cfg(all(loom, test))]
    #[must_use]
    pub fn with_backend() -> Self {
        Self {
            mutex: AtomicPtr::new(ptr::null_mut()),
            cond: AtomicI32::new(0),
            waiters: AtomicI32::new(0),
            marker: PhantomData,
        }
    }

    /// Returns `true` if any thread is waiting on this condition variable.
    #[must_use]
    #[inline]
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Relaxed) > 0
    }
}

impl<'m, F: Futex> ConditionVariable<'m, F> {
    /// Releases `mutex` and blocks the current thread until this condition
    /// variable is signaled, then reacquires `mutex`.
    ///
    /// A recursive `mutex` is released completely, no matter how many times
    /// the current thread locked it, and is restored to the same recursion
    /// depth before returning.
    ///
    /// # Aborts
    ///
    /// Terminates the process if the current thread does not hold `mutex`, or
    /// if other threads are waiting with a different mutex.
    pub fn wait(&self, mutex: &'m Mutex<F>) {
        self.wait_inner(mutex, None);
    }

    /// Like [`wait`], but gives up once the deadline passes.
    ///
    /// The deadline is `millis` milliseconds plus `nanos` nanoseconds, either
    /// relative to now or, if `absolute` is set, since the UNIX epoch as
    /// measured by the realtime clock. Returns `true` if the wait timed out.
    /// `mutex` is held again on return in either case.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::{ConditionVariable, Mutex};
    ///
    /// let mutex = Mutex::new();
    /// let cond = ConditionVariable::new();
    /// mutex.lock();
    /// // Waits may return early without a signal.
    /// while !cond.timed_wait(&mutex, 10, 0, false) {}
    /// assert!(mutex.is_held_by_current_thread());
    /// mutex.unlock();
    /// ```
    ///
    /// [`wait`]: ConditionVariable::wait
    pub fn timed_wait(&self, mutex: &'m Mutex<F>, millis: u64, nanos: u64, absolute: bool) -> bool {
        let timeout = Timeout::from_millis_nanos(millis, nanos, absolute);
        self.wait_inner(mutex, Some(timeout))
    }

    fn wait_inner(&self, mutex: &'m Mutex<F>, timeout: Option<Timeout>) -> bool {
        let current = ThreadId::current();
        if !mutex.is_held(current) {
            fatal!("cond var wait failed, mutex is not held by the current thread {current}");
        }
        let this = mutex as *const Mutex<F> as *mut Mutex<F>;
        if let Err(bound) = self.mutex.compare_exchange(ptr::null_mut(), this, Relaxed, Relaxed) {
            if bound != this {
                fatal!("cond var wait failed, mutex ptr mismatch: bound {bound:p}, got {this:p}");
            }
        }
        self.waiters.fetch_add(1, Relaxed);
        // Makes the unlocks of `mutex` wake a requeued waiter.
        mutex.increment_waiters();
        // A single unlock must release a recursive mutex.
        let recursion = mutex.recursion.swap(1, Relaxed);
        let cond = self.cond.load(Relaxed);
        mutex.unlock();

        trace!("cond var {:p} waiting with mutex {:p}", self, mutex);
        let timed_out = match F::wait(&self.cond, cond, timeout) {
            Ok(()) | Err(Error::Interrupted) => false,
            Err(Error::TimedOut) => true,
            Err(err) => fatal!("cond var wait failed: {err}"),
        };

        mutex.lock();
        mutex.recursion.store(recursion, Relaxed);
        mutex.decrement_waiters();
        // The last waiter of the epoch unbinds the mutex, still holding it.
        if self.waiters.load(Relaxed) == 1 {
            self.mutex.store(ptr::null_mut(), Relaxed);
        }
        self.waiters.fetch_sub(1, Relaxed);
        timed_out
    }

    /// Wakes up one thread blocked on this condition variable.
    ///
    /// Does nothing if no thread is waiting.
    #[inline]
    pub fn signal(&self) {
        self.signal_count(WAKE_ONE);
    }

    /// Wakes up every thread blocked on this condition variable.
    ///
    /// Does nothing if no thread is waiting.
    #[inline]
    pub fn signal_all(&self) {
        self.signal_count(WAKE_ALL);
    }

    fn signal_count(&self, count: i32) {
        if self.waiters.load(Relaxed) == 0 {
            return;
        }
        let mutex = self.mutex.load(Relaxed);
        // Fails the comparison of any wait that has not blocked yet.
        self.cond.fetch_add(1, Relaxed);

        // SAFETY: A non-null pointer was stored by `wait_inner` from a
        // `&'m Mutex<F>` and `'m` outlives `self`, so it still points to a
        // live mutex. Only shared references are ever created from it.
        let bound = unsafe { mutex.as_ref() };
        match bound {
            Some(mutex) if mutex.is_held_by_current_thread() => {
                trace!("cond var {:p} requeueing waiters to mutex {:p}", self, mutex);
                if let Err(err) = F::requeue(&self.cond, count, &mutex.state) {
                    fatal!("cond var signal failed, futex requeue: {err}");
                }
            }
            _ => super::wake::<F>(&self.cond, count),
        }
    }
}

impl<F> Drop for ConditionVariable<'_, F> {
    fn drop(&mut self) {
        let waiters = self.waiters.load(Relaxed);
        if waiters != 0 {
            fatal!("cond var destruction failed, waiters is non zero: {waiters}");
        }
    }
}

impl Default for ConditionVariable<'_> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Debug for ConditionVariable<'_, F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("mutex", &self.mutex.load(Relaxed))
            .field("cond", &self.cond.load(Relaxed))
            .field("waiters", &self.waiters.load(Relaxed))
            .finish()
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;

    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::thread;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use super::ConditionVariable;
    use crate::raw::Mutex;
    use crate::sys::{emulated, Futex};

    /// Waits for `ready` holding `mutex`, while another thread sets it.
    ///
    /// With `requeue` the notifier signals while holding the mutex.
    fn no_lost_wakeup<F: Futex>(requeue: bool) {
        let mutex = Mutex::<F>::with_backend(false);
        let cond = ConditionVariable::<F>::with_backend();
        let ready = AtomicBool::new(false);
        thread::scope(|s| {
            mutex.lock();
            s.spawn(|| {
                // Runs once the main thread released the mutex in `wait`.
                mutex.lock();
                ready.store(true, Relaxed);
                if requeue {
                    cond.signal();
                    mutex.unlock();
                } else {
                    mutex.unlock();
                    cond.signal();
                }
            });
            while !ready.load(Relaxed) {
                cond.wait(&mutex);
            }
            assert!(mutex.is_held_by_current_thread());
            mutex.unlock();
        });
        assert!(mutex.try_lock());
        mutex.unlock();
        assert!(!cond.has_waiters());
    }

    #[test]
    fn no_lost_wakeup_requeue() {
        no_lost_wakeup::<crate::sys::Sys>(true);
    }

    #[test]
    fn no_lost_wakeup_wake() {
        no_lost_wakeup::<crate::sys::Sys>(false);
    }

    #[test]
    fn no_lost_wakeup_emulated() {
        no_lost_wakeup::<emulated::Futex>(true);
        no_lost_wakeup::<emulated::Futex>(false);
    }

    #[test]
    fn signal_all_wakes_every_waiter() {
        const WAITERS: u32 = 3;
        let mutex = Mutex::new();
        let cond = ConditionVariable::new();
        let waiting = AtomicU32::new(0);
        let go = AtomicBool::new(false);
        let inside = AtomicU32::new(0);
        let woken = AtomicU32::new(0);
        thread::scope(|s| {
            for _ in 0..WAITERS {
                s.spawn(|| {
                    mutex.lock();
                    waiting.fetch_add(1, Relaxed);
                    while !go.load(Relaxed) {
                        cond.wait(&mutex);
                    }
                    // Every waiter returns holding the mutex, one at a time.
                    assert_eq!(inside.fetch_add(1, Relaxed), 0);
                    woken.fetch_add(1, Relaxed);
                    inside.fetch_sub(1, Relaxed);
                    mutex.unlock();
                });
            }
            s.spawn(|| loop {
                mutex.lock();
                if waiting.load(Relaxed) == WAITERS {
                    go.store(true, Relaxed);
                    cond.signal_all();
                    mutex.unlock();
                    break;
                }
                mutex.unlock();
                thread::yield_now();
            });
        });
        assert_eq!(woken.load(Relaxed), WAITERS);
        assert!(!cond.has_waiters());
        assert!(!mutex.is_locked());
    }

    #[test]
    fn timed_wait_relative_timeout() {
        const TIMEOUT: Duration = Duration::from_millis(20);
        let mutex = Mutex::new();
        let cond = ConditionVariable::new();
        mutex.lock();
        let start = Instant::now();
        // Spurious wake ups return early without a timeout.
        while !cond.timed_wait(&mutex, 20, 0, false) {}
        assert!(start.elapsed() >= TIMEOUT);
        assert!(mutex.is_held_by_current_thread());
        mutex.unlock();
    }

    #[test]
    fn timed_wait_absolute_timeout() {
        let mutex = Mutex::new();
        let cond = ConditionVariable::new();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let deadline = now + Duration::from_millis(20);
        let millis = u64::try_from(deadline.as_millis()).unwrap();
        mutex.lock();
        while !cond.timed_wait(&mutex, millis, 0, true) {}
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        assert!(now >= Duration::from_millis(millis));
        mutex.unlock();
    }

    #[test]
    fn timed_wait_signaled() {
        let mutex = Mutex::new();
        let cond = ConditionVariable::new();
        let ready = AtomicBool::new(false);
        thread::scope(|s| {
            mutex.lock();
            s.spawn(|| {
                mutex.lock();
                ready.store(true, Relaxed);
                cond.signal();
                mutex.unlock();
            });
            while !ready.load(Relaxed) {
                let timed_out = cond.timed_wait(&mutex, 10_000, 0, false);
                assert!(!timed_out);
            }
            mutex.unlock();
        });
    }

    #[test]
    fn wait_restores_recursion() {
        let mutex = Mutex::recursive();
        let cond = ConditionVariable::new();
        mutex.lock();
        mutex.lock();
        mutex.lock();
        cond.timed_wait(&mutex, 1, 0, false);
        assert!(mutex.is_held_by_current_thread());
        assert_eq!(mutex.recursion.load(Relaxed), 3);
        // Released while waiting, so other threads could take it.
        for _ in 0..3 {
            mutex.unlock();
        }
        assert!(!mutex.is_locked());
    }

    #[test]
    fn rebind_after_epoch() {
        let first = Mutex::new();
        let second = Mutex::new();
        let cond = ConditionVariable::new();
        first.lock();
        cond.timed_wait(&first, 1, 0, false);
        first.unlock();
        assert!(cond.mutex.load(Relaxed).is_null());
        second.lock();
        cond.timed_wait(&second, 1, 0, false);
        second.unlock();
        assert!(!cond.has_waiters());
    }

    #[test]
    fn signal_without_waiters_is_noop() {
        let cond = ConditionVariable::new();
        cond.signal();
        cond.signal_all();
        assert_eq!(cond.cond.load(Relaxed), 0);
    }

    #[test]
    fn debug_shows_state() {
        let cond = ConditionVariable::new();
        let msg = "ConditionVariable { mutex: 0x0, cond: 0, waiters: 0 }";
        assert_eq!(format!("{cond:?}"), msg);
    }

    #[test]
    #[should_panic(expected = "mutex is not held by the current thread")]
    fn wait_without_mutex_is_fatal() {
        let mutex = Mutex::new();
        let cond = ConditionVariable::new();
        cond.wait(&mutex);
    }

    #[test]
    #[should_panic(expected = "mutex ptr mismatch")]
    fn wait_with_other_mutex_is_fatal() {
        // Leaked, the first waiter never returns.
        let first: &'static Mutex = Box::leak(Box::new(Mutex::new()));
        let second: &'static Mutex = Box::leak(Box::new(Mutex::new()));
        let cond: &'static ConditionVariable<'static> =
            Box::leak(Box::new(ConditionVariable::new()));
        thread::spawn(move || {
            first.lock();
            loop {
                cond.wait(first);
            }
        });
        while !cond.has_waiters() {
            thread::sleep(Duration::from_millis(1));
        }
        second.lock();
        cond.wait(second);
    }

    #[test]
    #[should_panic(expected = "cond var destruction failed")]
    fn drop_with_waiters_is_fatal() {
        let cond = ConditionVariable::new();
        cond.waiters.store(1, Relaxed);
        drop(cond);
    }
}

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
mod model {
    use crate::loom::models;

    #[test]
    fn wait_signal() {
        models::wait_signal(false);
    }

    #[test]
    fn wait_signal_recursive() {
        models::wait_signal(true);
    }
}
