//! Futex based mutual exclusion primitives.
//!
//! This crate provides the low level locks a language runtime builds its
//! monitors and internal data structures upon:
//!
//! - [`Mutex`]: a mutual exclusion lock, optionally recursive, that records
//!   its owner and supports handing ownership off to another thread;
//! - [`RwLock`]: a readers-writer lock;
//! - [`ConditionVariable`]: a condition variable that rendezvous with a
//!   [`Mutex`], moving signaled waiters straight into the mutex wait queue
//!   when possible.
//!
//! The locks do not own the data they protect. They only provide the mutual
//! exclusion and visibility guarantees that come with holding them. The RAII
//! guards in [`guard`] release a lock on every exit path, unwinding included.
//!
//! ## Spin then block
//!
//! Every lock keeps its whole state in 32-bit atomic words. Acquisitions first
//! try a single CAS, then busy wait for a bounded amount of time (see
//! [`relax`]), and only then register as a waiter and block on the very same
//! word with a futex. Releases only issue a wake up syscall when they observe
//! registered waiters.
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use futexlock::Mutex;
//!
//! let mutex = Arc::new(Mutex::new());
//! let c_mutex = Arc::clone(&mutex);
//!
//! thread::spawn(move || {
//!     let _guard = c_mutex.guard();
//!     // Critical section.
//! })
//! .join().expect("thread::spawn failed");
//!
//! assert!(!mutex.is_locked());
//! ```
//!
//! ## Misuse
//!
//! Protocol violations, such as unlocking a lock not held by the calling
//! thread, waiting on a condition variable without holding the mutex, or
//! dropping a lock that is still in use, are bugs that leave the lock in an
//! unknown state. They are reported and terminate the process. Contention
//! and timeouts are never errors.
//!
//! ## Features
//!
//! ### log
//!
//! Enabled by default. Fatal diagnostics are recorded at the `error` level and
//! slow paths are traced at the `trace` level through the [`log`] facade,
//! under the `futexlock` target. Fatal diagnostics are always printed to
//! stderr regardless of this feature.
//!
//! ### emulated
//!
//! Uses the parking lot based futex emulation of [`sys::emulated`]
//! even on platforms with a native futex, mostly useful for testing. Platforms
//! other than Linux and Android always use the emulation.
//!
//! [`log`]: https://docs.rs/log

#![allow(clippy::doc_markdown)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(missing_docs)]
#![warn(rust_2024_compatibility)]
#![warn(clippy::undocumented_unsafe_blocks)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod guard;
pub mod raw;
pub mod relax;
pub mod sys;
pub mod thread;

pub(crate) mod cfg;
pub(crate) mod diag;

#[doc(inline)]
pub use guard::{MutexGuard, ReadGuard, WriteGuard};
#[doc(inline)]
pub use raw::{ConditionVariable, Mutex, RwLock};
#[doc(inline)]
pub use thread::ThreadId;

#[cfg(test)]
pub(crate) mod test;

#[cfg(all(loom, test))]
#[cfg(not(tarpaulin))]
pub(crate) mod loom;
