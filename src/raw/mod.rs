//! Futex based lock state machines.
//!
//! These locks do not own the data they protect, they only provide mutual
//! exclusion and the visibility guarantees that come with it. Every lock
//! follows the same escalation:
//!
//! 1. a single CAS on the lock word (the fast path, no syscall);
//! 2. a bounded spin, see [`spin_wait`];
//! 3. registering as a waiter and blocking on the lock word through the
//!    [`Futex`] backend.
//!
//! Unlocking only issues a wake up syscall when waiters are registered.
//!
//! Misuse, such as unlocking a lock the calling thread does not hold or
//! dropping a lock that is still held, terminates the process.
//!
//! [`spin_wait`]: crate::relax::spin_wait
//! [`Futex`]: crate::sys::Futex

mod condvar;
mod mutex;
mod rwlock;

pub use condvar::ConditionVariable;
pub use mutex::Mutex;
pub use rwlock::RwLock;

use crate::cfg::atomic::AtomicI32;
use crate::diag::fatal;
use crate::sys::{Error, Futex};

/// Blocks on `atomic` while it holds `expected`, without a deadline.
///
/// Mismatches and interruptions are spurious wake ups, the caller reloads the
/// word. Any other failure is fatal.
fn wait<F: Futex>(atomic: &AtomicI32, expected: i32) {
    match F::wait(atomic, expected, None) {
        Ok(()) | Err(Error::Interrupted) => {}
        Err(err) => fatal!("futex wait failed: {err}"),
    }
}

/// Wakes up to `count` threads blocked on `atomic`.
///
/// The wake up is the last step of a release, so a failure leaves waiters
/// asleep on a free lock and is fatal.
fn wake<F: Futex>(atomic: &AtomicI32, count: i32) {
    match F::wake(atomic, count) {
        Ok(()) | Err(Error::Interrupted) => {}
        Err(err) => fatal!("futex wake failed: {err}"),
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::Ordering::Relaxed;

    use super::Mutex;
    use crate::cfg::atomic::AtomicI32;
    use crate::sys::{Error, Futex, Timeout, WAKE_ONE};

    /// A backend whose wake up always fails with `EFAULT`.
    struct FailingWake;

    impl Futex for FailingWake {
        fn wait(_atomic: &AtomicI32, _expected: i32, _: Option<Timeout>) -> Result<(), Error> {
            Err(Error::Interrupted)
        }

        fn wake(_atomic: &AtomicI32, _count: i32) -> Result<(), Error> {
            Err(Error::Os(14))
        }

        fn requeue(_from: &AtomicI32, _count: i32, _to: &AtomicI32) -> Result<(), Error> {
            Ok(())
        }
    }

    /// A backend whose wake up reports an interruption.
    struct InterruptedWake;

    impl Futex for InterruptedWake {
        fn wait(_atomic: &AtomicI32, _expected: i32, _: Option<Timeout>) -> Result<(), Error> {
            Err(Error::Interrupted)
        }

        fn wake(_atomic: &AtomicI32, _count: i32) -> Result<(), Error> {
            Err(Error::Interrupted)
        }

        fn requeue(_from: &AtomicI32, _count: i32, _to: &AtomicI32) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    #[should_panic(expected = "futex wake failed")]
    fn wake_os_error_is_fatal() {
        let atomic = AtomicI32::new(0);
        super::wake::<FailingWake>(&atomic, WAKE_ONE);
    }

    #[test]
    fn wake_interrupted_is_ignored() {
        let atomic = AtomicI32::new(0);
        super::wake::<InterruptedWake>(&atomic, WAKE_ONE);
    }

    #[test]
    #[should_panic(expected = "futex wake failed")]
    fn unlock_with_failing_wake_is_fatal() {
        // Leaked: the waiter registered below would fail the drop check.
        let mutex: &Mutex<FailingWake> = Box::leak(Box::new(Mutex::with_backend(false)));
        mutex.increment_waiters();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn unlock_without_waiters_skips_wake() {
        let mutex: Mutex<FailingWake> = Mutex::with_backend(false);
        assert!(mutex.try_lock());
        mutex.unlock();
        assert_eq!(mutex.state.load(Relaxed), 0);
    }
}
