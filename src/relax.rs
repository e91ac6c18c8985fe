//! Bounded busy waiting, run before a thread pays for a blocking syscall.
//!
//! Locks call [`spin_wait`] once their fast path fails. Only if the predicate
//! still does not hold after the spin budget is exhausted, the thread
//! registers itself as a waiter and blocks on the futex.

use crate::cfg::atomic::AtomicI32;
use crate::cfg::{hint, thread};

use core::sync::atomic::Ordering::Relaxed;

/// An unsigned integer type used as the backoff step counter.
///
/// All backoff related arithmetic operations should only use this same type
/// as the right-hand and left-hand side types.
type Uint = u32;

/// Steps up to this value spin, greater steps yield to the OS scheduler.
const SPIN_MAX: Uint = 10;

/// Number of spin loop iterations executed per backoff step.
// Models explore every interleaving of every load, keep them small.
#[cfg(not(all(loom, test)))]
const SPIN_FACTOR: Uint = 10;

#[cfg(all(loom, test))]
const SPIN_FACTOR: Uint = 1;

/// The largest step [`spin_wait`] will back off with.
const MAX_BACK_OFF: Uint = SPIN_MAX;

/// The number of predicate evaluations performed by [`spin_wait`].
#[cfg(not(all(loom, test)))]
const MAX_ITER: Uint = 50;

#[cfg(all(loom, test))]
const MAX_ITER: Uint = 2;

// `spin_wait` must never reach the yielding branch of `backoff`.
const _: () = assert!(MAX_BACK_OFF <= SPIN_MAX);

/// Spins `10 * step` times for steps up to `10`, yields the current time
/// slice to the OS scheduler for longer ones.
#[inline]
pub fn backoff(step: Uint) {
    if step <= SPIN_MAX {
        for _ in 0..SPIN_FACTOR.saturating_mul(step) {
            hint::spin_loop();
        }
    } else {
        thread::yield_now();
    }
}

/// A backoff step counter, saturating at `MAX`.
#[derive(Debug, Default)]
pub struct Backoff<const MAX: Uint = MAX_BACK_OFF>(Uint);

impl<const MAX: Uint> Backoff<MAX> {
    /// Creates a new backoff counter at its initial step.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Increments the step counter, saturating it at `MAX`, and then backs
    /// off for the new step.
    pub fn snooze(&mut self) {
        self.saturating_step();
        backoff(self.0);
    }

    /// Returns the current step.
    #[must_use]
    pub const fn step(&self) -> Uint {
        self.0
    }

    /// Increments one to the inner counter, saturating the counter at `MAX`.
    fn saturating_step(&mut self) {
        (self.0 < MAX).then(|| self.0 += 1);
    }
}

/// Busy waits until `pred` holds for the value of `atomic`, or until the spin
/// budget is exhausted.
///
/// Returns `true` if the predicate was satisfied and `false` on timeout. This
/// function never issues a syscall.
pub fn spin_wait<P>(atomic: &AtomicI32, pred: P) -> bool
where
    P: Fn(i32) -> bool,
{
    let mut backoff = Backoff::<MAX_BACK_OFF>::new();
    for _ in 0..MAX_ITER {
        backoff.snooze();
        if pred(atomic.load(Relaxed)) {
            return true;
        }
    }
    false
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::AtomicI32;
    use core::sync::atomic::Ordering::Relaxed;

    use std::sync::Arc;
    use std::thread;

    use super::{backoff, spin_wait, Backoff, Uint, MAX_BACK_OFF, SPIN_MAX};

    #[test]
    fn backoff_returns_for_every_step() {
        for step in 0..=SPIN_MAX + 2 {
            backoff(step);
        }
    }

    #[test]
    fn backoff_saturates() {
        const MAX: Uint = 3;
        let mut backoff = Backoff::<MAX>::new();
        for _ in 0..=MAX.saturating_mul(10) {
            backoff.snooze();
        }
        assert_eq!(backoff.step(), MAX);
    }

    #[test]
    fn default_backoff_never_yields() {
        let mut backoff = Backoff::<MAX_BACK_OFF>::default();
        for _ in 0..100 {
            backoff.snooze();
            assert!(backoff.step() <= SPIN_MAX);
        }
    }

    #[test]
    fn spin_wait_satisfied() {
        let atomic = AtomicI32::new(0);
        assert!(spin_wait(&atomic, |value| value == 0));
    }

    #[test]
    fn spin_wait_exhausted() {
        let atomic = AtomicI32::new(1);
        assert!(!spin_wait(&atomic, |value| value == 0));
    }

    #[test]
    fn spin_wait_observes_other_thread() {
        let atomic = Arc::new(AtomicI32::new(1));
        let c_atomic = Arc::clone(&atomic);
        let handle = thread::spawn(move || c_atomic.store(0, Relaxed));
        handle.join().unwrap();
        assert!(spin_wait(&atomic, |value| value == 0));
    }
}
