//! A futex emulated on top of the `parking_lot_core` parking lot.
//!
//! Threads park on the address of the lock word. The value check passed to
//! `park` runs under the parking lot bucket lock, which wakers also take after
//! updating the word, so a wait can not miss a wake up. Requeueing moves
//! parked threads to the queue of the target word without waking them, like
//! `FUTEX_REQUEUE` does.

use core::sync::atomic::Ordering::Relaxed;

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot_core::{ParkResult, RequeueOp, DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};

use crate::cfg::atomic::AtomicI32;
use crate::sys::{Error, Timeout, WAKE_ONE};

/// Returns the parking lot key of `atomic`.
fn key(atomic: &AtomicI32) -> usize {
    atomic as *const AtomicI32 as usize
}

/// Converts `timeout` into a monotonic deadline.
///
/// Returns `Err(TimedOut)` if an absolute deadline already passed, and
/// `Ok(None)` if the deadline lies beyond what an `Instant` can represent.
fn deadline(timeout: Timeout) -> Result<Option<Instant>, Error> {
    let remaining = match timeout {
        Timeout::Relative(duration) => duration,
        Timeout::Absolute(deadline) => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            deadline.checked_sub(now).ok_or(Error::TimedOut)?
        }
    };
    Ok(Instant::now().checked_add(remaining))
}

/// The parking lot based futex emulation.
#[derive(Debug)]
pub struct Futex;

impl crate::sys::Futex for Futex {
    fn wait(atomic: &AtomicI32, expected: i32, timeout: Option<Timeout>) -> Result<(), Error> {
        let deadline = match timeout {
            Some(timeout) => match deadline(timeout) {
                Ok(deadline) => deadline,
                Err(err) if atomic.load(Relaxed) == expected => return Err(err),
                Err(_) => return Err(Error::Interrupted),
            },
            None => None,
        };
        let validate = || atomic.load(Relaxed) == expected;
        // SAFETY: The key is the address of a word that outlives the wait.
        // The callbacks neither panic nor call back into the parking lot.
        let result = unsafe {
            parking_lot_core::park(
                key(atomic),
                validate,
                || {},
                |_, _| {},
                DEFAULT_PARK_TOKEN,
                deadline,
            )
        };
        match result {
            ParkResult::Unparked(_) => Ok(()),
            ParkResult::Invalid => Err(Error::Interrupted),
            ParkResult::TimedOut => Err(Error::TimedOut),
        }
    }

    fn wake(atomic: &AtomicI32, count: i32) -> Result<(), Error> {
        let key = key(atomic);
        // SAFETY: The callback neither panics nor calls back into the
        // parking lot.
        unsafe {
            if count == WAKE_ONE {
                parking_lot_core::unpark_one(key, |_| DEFAULT_UNPARK_TOKEN);
            } else {
                parking_lot_core::unpark_all(key, DEFAULT_UNPARK_TOKEN);
            }
        }
        Ok(())
    }

    fn requeue(from: &AtomicI32, count: i32, to: &AtomicI32) -> Result<(), Error> {
        // Only one or all waiters can be moved, any other count moves all.
        let op = if count == WAKE_ONE { RequeueOp::RequeueOne } else { RequeueOp::RequeueAll };
        // SAFETY: The callbacks neither panic nor call back into the parking
        // lot.
        unsafe {
            parking_lot_core::unpark_requeue(key(from), key(to), || op, |_, _| {
                DEFAULT_UNPARK_TOKEN
            });
        }
        Ok(())
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use core::sync::atomic::AtomicI32;
    use core::sync::atomic::Ordering::SeqCst;
    use core::time::Duration;

    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    use super::{deadline, Futex};
    use crate::sys::{Error, Futex as _, Timeout, WAKE_ALL, WAKE_ONE};

    #[test]
    fn deadline_conversion() {
        let before = Instant::now();
        let relative = deadline(Timeout::Relative(Duration::from_millis(5))).unwrap().unwrap();
        assert!(relative >= before + Duration::from_millis(5));
        let past = Timeout::Absolute(Duration::from_secs(1));
        assert_eq!(deadline(past), Err(Error::TimedOut));
        assert_eq!(deadline(Timeout::Relative(Duration::MAX)), Ok(None));
    }

    #[test]
    fn value_mismatch_is_interrupted() {
        let atomic = AtomicI32::new(1);
        assert_eq!(Futex::wait(&atomic, 0, None), Err(Error::Interrupted));
        let past = Some(Timeout::Absolute(Duration::from_secs(1)));
        assert_eq!(Futex::wait(&atomic, 0, past), Err(Error::Interrupted));
    }

    #[test]
    fn relative_timeout_expires() {
        let atomic = AtomicI32::new(0);
        let start = Instant::now();
        let timeout = Some(Timeout::Relative(Duration::from_millis(10)));
        assert_eq!(Futex::wait(&atomic, 0, timeout), Err(Error::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[test]
    fn absolute_timeout_expires() {
        let atomic = AtomicI32::new(0);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let timeout = Some(Timeout::Absolute(now + Duration::from_millis(10)));
        assert_eq!(Futex::wait(&atomic, 0, timeout), Err(Error::TimedOut));
    }

    #[test]
    fn wake_without_waiters() {
        let atomic = AtomicI32::new(0);
        assert_eq!(Futex::wake(&atomic, WAKE_ONE), Ok(()));
        assert_eq!(Futex::wake(&atomic, WAKE_ALL), Ok(()));
    }

    #[test]
    fn wake_resumes_waiter() {
        let atomic = Arc::new(AtomicI32::new(0));
        let c_atomic = Arc::clone(&atomic);
        let handle = thread::spawn(move || {
            while c_atomic.load(SeqCst) == 0 {
                let _ = Futex::wait(&c_atomic, 0, None);
            }
        });
        thread::sleep(Duration::from_millis(10));
        atomic.store(1, SeqCst);
        assert_eq!(Futex::wake(&atomic, WAKE_ONE), Ok(()));
        handle.join().unwrap();
    }

    #[test]
    fn requeue_moves_waiter_without_waking() {
        let from = Arc::new(AtomicI32::new(0));
        let to = Arc::new(AtomicI32::new(0));
        let c_from = Arc::clone(&from);
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            // A single wait: returning at all means the thread was woken.
            tx.send(Futex::wait(&c_from, 0, None)).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(Futex::requeue(&from, WAKE_ALL, &to), Ok(()));
        // The waiter now sits in the queue of `to`: neither the requeue nor a
        // wake on `from` resumes it.
        assert_eq!(Futex::wake(&from, WAKE_ALL), Ok(()));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(Futex::wake(&to, WAKE_ONE), Ok(()));
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result, Ok(()));
        handle.join().unwrap();
    }

    #[test]
    fn requeue_one_moves_a_single_waiter() {
        let from = Arc::new(AtomicI32::new(0));
        let to = Arc::new(AtomicI32::new(0));
        let (tx, rx) = mpsc::channel();
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let c_from = Arc::clone(&from);
                let tx = tx.clone();
                thread::spawn(move || tx.send(Futex::wait(&c_from, 0, None)).unwrap())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(Futex::requeue(&from, WAKE_ONE, &to), Ok(()));
        assert_eq!(Futex::wake(&to, WAKE_ALL), Ok(()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(Futex::wake(&from, WAKE_ALL), Ok(()));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
