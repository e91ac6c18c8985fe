//! The futex primitive the locks are built upon.
//!
//! Lock state machines never talk to the OS directly. They block and wake
//! threads through the [`Futex`] trait, which operates on the address of the
//! very same 32-bit atomic word the locks update with CAS. A backend is
//! selected at compile time:
//!
//! - [`linux::Futex`]: the `futex(2)` syscall, the default on Linux and
//!   Android.
//! - [`emulated::Futex`]: an emulation on the `parking_lot_core` parking lot,
//!   the default on every other platform, or when the `emulated` feature is
//!   enabled.
//!
//! [`Sys`] names the selected backend, and every lock type defaults its
//! backend parameter to it.

use core::fmt::{self, Display, Formatter};
use core::time::Duration;

use crate::cfg::atomic::AtomicI32;

#[cfg(all(any(target_os = "linux", target_os = "android"), not(all(loom, test))))]
pub mod linux;

#[cfg(not(all(loom, test)))]
pub mod emulated;

#[cfg(all(loom, test))]
pub(crate) mod loom;

/// The platform default backend.
#[cfg(all(
    any(target_os = "linux", target_os = "android"),
    not(feature = "emulated"),
    not(all(loom, test))
))]
pub type Sys = linux::Futex;

/// The platform default backend.
#[cfg(all(
    any(not(any(target_os = "linux", target_os = "android")), feature = "emulated"),
    not(all(loom, test))
))]
pub type Sys = emulated::Futex;

/// The platform default backend.
#[cfg(all(loom, test))]
pub type Sys = loom::Futex;

/// Wake count that resumes a single waiter.
pub const WAKE_ONE: i32 = 1;

/// Wake count that resumes every waiter.
pub const WAKE_ALL: i32 = i32::MAX;

/// A deadline for [`Futex::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Time out after the given duration elapsed.
    Relative(Duration),
    /// Time out once the realtime clock reaches the given duration since the
    /// UNIX epoch.
    Absolute(Duration),
}

impl Timeout {
    /// Creates a timeout from a millisecond and nanosecond pair.
    ///
    /// `nanos` may exceed one second, the excess carries into seconds.
    #[must_use]
    pub fn from_millis_nanos(millis: u64, nanos: u64, absolute: bool) -> Self {
        let duration = Duration::from_millis(millis)
            .checked_add(Duration::from_nanos(nanos))
            .unwrap_or(Duration::MAX);
        if absolute {
            Self::Absolute(duration)
        } else {
            Self::Relative(duration)
        }
    }
}

/// The reasons a futex operation returns without a wake up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The deadline passed before a wake up arrived (`ETIMEDOUT`).
    TimedOut,
    /// The word did not hold the expected value, or the wait was interrupted
    /// by a signal (`EAGAIN`, `EINTR`). Callers treat this as a spurious wake
    /// up.
    Interrupted,
    /// Any other failure, carrying the raw OS error code.
    Os(i32),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("futex wait timed out"),
            Self::Interrupted => f.write_str("futex wait interrupted"),
            Self::Os(code) => write!(f, "futex failed with os error {code}"),
        }
    }
}

impl std::error::Error for Error {}

/// Blocking and waking threads on a 32-bit atomic word.
///
/// All operations may wake up more threads than requested, and `wait` may
/// return spuriously: lock state machines always re-evaluate the word after
/// returning from `wait`.
pub trait Futex {
    /// Blocks the calling thread for as long as `atomic` holds `expected`,
    /// until woken, or until `timeout` expires.
    ///
    /// The comparison and the enqueueing happen atomically with respect to
    /// [`wake`] and [`requeue`] on the same word.
    ///
    /// [`wake`]: Futex::wake
    /// [`requeue`]: Futex::requeue
    fn wait(atomic: &AtomicI32, expected: i32, timeout: Option<Timeout>) -> Result<(), Error>;

    /// Wakes up to `count` threads blocked on `atomic`.
    fn wake(atomic: &AtomicI32, count: i32) -> Result<(), Error>;

    /// Moves up to `count` threads blocked on `from` into the wait queue of
    /// `to`, without waking any of them.
    fn requeue(from: &AtomicI32, count: i32, to: &AtomicI32) -> Result<(), Error>;
}

#[cfg(all(not(loom), test))]
mod test {
    use core::time::Duration;

    use super::{Error, Timeout};

    #[test]
    fn timeout_carries_nanos() {
        let timeout = Timeout::from_millis_nanos(1_500, 700_000_000, false);
        assert_eq!(timeout, Timeout::Relative(Duration::new(2, 200_000_000)));
    }

    #[test]
    fn timeout_absolute() {
        let timeout = Timeout::from_millis_nanos(0, 5, true);
        assert_eq!(timeout, Timeout::Absolute(Duration::from_nanos(5)));
    }

    #[test]
    fn timeout_from_nanos_only() {
        let timeout = Timeout::from_millis_nanos(0, 3_000_000_001, false);
        assert_eq!(timeout, Timeout::Relative(Duration::new(3, 1)));
    }

    #[test]
    fn error_display() {
        assert_eq!(Error::TimedOut.to_string(), "futex wait timed out");
        assert_eq!(Error::Os(22).to_string(), "futex failed with os error 22");
    }
}
