//! A futex backend for Loom models.
//!
//! Loom can not model a kernel wait queue. Every wait returns right away as a
//! spurious wake up after yielding to the Loom scheduler, which turns all
//! blocking loops into yielding spin loops that Loom knows how to explore.

use loom::sync::atomic::AtomicI32;

use crate::sys::{Error, Timeout};

/// The Loom backend.
#[derive(Debug)]
pub struct Futex;

impl crate::sys::Futex for Futex {
    fn wait(_atomic: &AtomicI32, _expected: i32, _timeout: Option<Timeout>) -> Result<(), Error> {
        loom::thread::yield_now();
        Err(Error::Interrupted)
    }

    fn wake(_atomic: &AtomicI32, _count: i32) -> Result<(), Error> {
        Ok(())
    }

    fn requeue(_from: &AtomicI32, _count: i32, _to: &AtomicI32) -> Result<(), Error> {
        Ok(())
    }
}
