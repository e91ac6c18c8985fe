//! Diagnostics for lock misuse and slow paths.
//!
//! Protocol violations can not be recovered from: the invariant the lock
//! exists to provide is already broken by the time one is observed. They are
//! reported through [`fatal!`], which never returns.

use core::fmt::Arguments;

/// Reports a protocol violation or an unexpected syscall failure and
/// terminates the process.
///
/// Test builds panic instead of aborting, so that misuse paths stay testable.
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::diag::abort(format_args!($($arg)+))
    };
}

/// Emits a `trace` level record about a lock slow path.
///
/// Compiles to nothing without the `log` feature.
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(feature = "log")]
        ::log::trace!(target: "futexlock", $($arg)+);
    };
}

pub(crate) use {fatal, trace};

#[cold]
#[inline(never)]
#[track_caller]
pub(crate) fn abort(args: Arguments<'_>) -> ! {
    #[cfg(feature = "log")]
    ::log::error!(target: "futexlock", "{args}");

    #[cfg(test)]
    panic!("{args}");

    #[cfg(not(test))]
    {
        std::eprintln!("futexlock: fatal: {args}");
        std::process::abort()
    }
}
