//! Thread identity as recorded by lock owner fields.
//!
//! Looking up the OS thread identifier requires a syscall, so each thread
//! caches its own identifier the first time it is requested. A forked child
//! must call [`post_fork`] from the thread that survived the fork, since that
//! thread has a new identifier there.

use core::cell::Cell;
use core::fmt::{self, Display, Formatter};
use core::num::NonZeroU32;

use crate::cfg::thread::thread_local;

/// An identifier of a thread that may own a lock.
///
/// On Linux and Android this is the kernel thread identifier. On other
/// platforms identifiers are handed out by a process wide counter, in the
/// order threads first request them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(NonZeroU32);

impl ThreadId {
    /// Returns the identifier of the calling thread.
    ///
    /// # Examples
    ///
    /// ```
    /// use futexlock::thread::ThreadId;
    ///
    /// let id = ThreadId::current();
    /// let other = std::thread::spawn(ThreadId::current).join().unwrap();
    /// assert_eq!(id, ThreadId::current());
    /// assert_ne!(id, other);
    /// ```
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|current| match Self::new(current.get()) {
            Some(id) => id,
            None => {
                let id = os::current();
                current.set(id.get());
                id
            }
        })
    }

    /// Creates an identifier from its raw value, `None` if the value is zero.
    ///
    /// Zero is reserved by the lock owner fields to mean "no owner".
    #[must_use]
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the raw, non-zero value of this identifier.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl Display for ThreadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

thread_local! {
    // Zero until the first lookup.
    static CURRENT: Cell<u32> = Cell::new(0);
}

/// Refreshes the cached identifier of the calling thread.
///
/// Must be called in a child process, right after `fork`, by the thread that
/// performed the fork.
pub fn post_fork() {
    CURRENT.with(|current| current.set(os::current().get()));
}

#[cfg(all(any(target_os = "linux", target_os = "android"), not(all(loom, test))))]
mod os {
    use super::ThreadId;

    pub fn current() -> ThreadId {
        // SAFETY: `gettid` takes no arguments and can not fail.
        let tid = unsafe { libc::syscall(libc::SYS_gettid) };
        match u32::try_from(tid).ok().and_then(ThreadId::new) {
            Some(id) => id,
            None => crate::diag::fatal!("gettid returned an invalid thread id: {tid}"),
        }
    }
}

#[cfg(any(not(any(target_os = "linux", target_os = "android")), all(loom, test)))]
mod os {
    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering::Relaxed;

    use super::ThreadId;

    // Shared across Loom executions on purpose, only uniqueness matters.
    static NEXT: AtomicU32 = AtomicU32::new(1);

    pub fn current() -> ThreadId {
        let raw = NEXT.fetch_add(1, Relaxed);
        match ThreadId::new(raw) {
            Some(id) => id,
            None => crate::diag::fatal!("thread id space exhausted"),
        }
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use std::collections::HashSet;
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use super::{post_fork, ThreadId};

    #[test]
    fn zero_is_not_an_id() {
        assert!(ThreadId::new(0).is_none());
        assert_eq!(ThreadId::new(7).map(ThreadId::get), Some(7));
    }

    #[test]
    fn current_is_cached_and_stable() {
        let id = ThreadId::current();
        assert_eq!(id, ThreadId::current());
        post_fork();
        // Without an actual fork the identifier does not change.
        assert_eq!(id, ThreadId::current());
    }

    #[test]
    fn threads_have_distinct_ids() {
        const THREADS: usize = 8;
        // Keep every thread alive until all ids are collected, so that no OS
        // thread identifier can be recycled.
        let barrier = Arc::new(Barrier::new(THREADS + 1));
        let (tx, rx) = channel();
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let (tx, barrier) = (tx.clone(), Arc::clone(&barrier));
                thread::spawn(move || {
                    tx.send(ThreadId::current()).unwrap();
                    barrier.wait();
                })
            })
            .collect();
        let ids: HashSet<_> = (0..THREADS).map(|_| rx.recv().unwrap()).collect();
        barrier.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!ids.contains(&ThreadId::current()));
        assert_eq!(ids.len(), THREADS);
    }

    #[test]
    fn display_raw_value() {
        let id = ThreadId::new(42).unwrap();
        assert_eq!(id.to_string(), "42");
    }
}
