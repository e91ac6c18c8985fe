//! The native `futex(2)` backend.
//!
//! All operations use the process private variants, the lock words are never
//! shared across address spaces.

use core::ptr;
use core::time::Duration;

use crate::cfg::atomic::AtomicI32;
use crate::sys::{Error, Timeout};

/// A full bitmask, makes `FUTEX_WAIT_BITSET` behave like a `FUTEX_WAIT` that
/// takes an absolute deadline.
const BITSET_MATCH_ANY: u32 = !0;

/// Converts a duration into a `timespec`, saturating the seconds.
fn timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        // Always below one billion, fits any `c_long`.
        tv_nsec: duration.subsec_nanos() as _,
    }
}

/// Maps the `errno` of a failed futex call.
fn last_error() -> Error {
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::ETIMEDOUT) => Error::TimedOut,
        Some(libc::EAGAIN | libc::EINTR) => Error::Interrupted,
        Some(code) => Error::Os(code),
        None => Error::Os(0),
    }
}

/// The Linux futex syscall.
#[derive(Debug)]
pub struct Futex;

impl crate::sys::Futex for Futex {
    fn wait(atomic: &AtomicI32, expected: i32, timeout: Option<Timeout>) -> Result<(), Error> {
        // `FUTEX_WAIT` takes a relative timeout, an absolute one requires
        // `FUTEX_WAIT_BITSET`, measured here against the realtime clock.
        let (op, ts) = match timeout {
            None => (libc::FUTEX_WAIT, None),
            Some(Timeout::Relative(duration)) => (libc::FUTEX_WAIT, Some(timespec(duration))),
            Some(Timeout::Absolute(deadline)) => {
                let op = libc::FUTEX_WAIT_BITSET | libc::FUTEX_CLOCK_REALTIME;
                (op, Some(timespec(deadline)))
            }
        };
        let timeout = ts.as_ref().map_or(ptr::null(), |ts| ts as *const libc::timespec);
        // SAFETY: These are the correct syscall parameters on linux:
        //   long syscall(SYS_futex, uint32_t *uaddr, int futex_op, uint32_t val,
        //     const struct timespec *timeout, uint32_t *uaddr2, uint32_t val3)
        // `uaddr` points to a live, aligned 32-bit atomic and `timeout` is
        // either null or points to a `timespec` that outlives the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic.as_ptr(),
                op | libc::FUTEX_PRIVATE_FLAG,
                expected,
                timeout,
                ptr::null::<u32>(),
                BITSET_MATCH_ANY,
            )
        };
        if ret == 0 {
            Ok(())
        } else {
            Err(last_error())
        }
    }

    fn wake(atomic: &AtomicI32, count: i32) -> Result<(), Error> {
        // SAFETY: `uaddr` points to a live, aligned 32-bit atomic. The
        // timeout, uaddr2 and val3 arguments are ignored by `FUTEX_WAKE`.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                atomic.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                count,
                ptr::null::<libc::timespec>(),
                ptr::null::<u32>(),
                0u32,
            )
        };
        if ret == -1 {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn requeue(from: &AtomicI32, count: i32, to: &AtomicI32) -> Result<(), Error> {
        // SAFETY: Both addresses point to live, aligned 32-bit atomics. For
        // `FUTEX_REQUEUE` the timeout argument is reinterpreted as `val2`,
        // the maximum number of waiters moved to `uaddr2`. `val` is the number
        // of waiters to wake, none here.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_futex,
                from.as_ptr(),
                libc::FUTEX_REQUEUE | libc::FUTEX_PRIVATE_FLAG,
                0i32,
                libc::c_long::from(count),
                to.as_ptr(),
                0u32,
            )
        };
        if ret == -1 {
            Err(last_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use core::sync::atomic::AtomicI32;
    use core::sync::atomic::Ordering::SeqCst;
    use core::time::Duration;

    use std::sync::Arc;
    use std::thread;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    use super::Futex;
    use crate::sys::{Error, Futex as _, Timeout, WAKE_ALL, WAKE_ONE};

    #[test]
    fn value_mismatch_is_interrupted() {
        let atomic = AtomicI32::new(1);
        assert_eq!(Futex::wait(&atomic, 0, None), Err(Error::Interrupted));
    }

    #[test]
    fn relative_timeout_expires() {
        let atomic = AtomicI32::new(0);
        let start = Instant::now();
        let timeout = Some(Timeout::Relative(Duration::from_millis(20)));
        assert_eq!(Futex::wait(&atomic, 0, timeout), Err(Error::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn absolute_timeout_in_the_past_expires() {
        let atomic = AtomicI32::new(0);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        let timeout = Some(Timeout::Absolute(now - Duration::from_secs(1)));
        assert_eq!(Futex::wait(&atomic, 0, timeout), Err(Error::TimedOut));
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
    fn wake_without_waiters() {
        let atomic = AtomicI32::new(0);
        assert_eq!(Futex::wake(&atomic, WAKE_ONE), Ok(()));
        assert_eq!(Futex::wake(&atomic, WAKE_ALL), Ok(()));
    }

    #[test]
    fn requeue_without_waiters() {
        let from = AtomicI32::new(0);
        let to = AtomicI32::new(0);
        assert_eq!(Futex::requeue(&from, WAKE_ALL, &to), Ok(()));
    }
}
