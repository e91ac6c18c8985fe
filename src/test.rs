use crate::cfg::cell::{UnsafeCell, UnsafeCellWith};

/// A trait for lock types that can be acquired exclusively through an RAII
/// guard.
pub trait RawLock {
    /// The guard that holds the lock exclusively until dropped.
    type Guard<'a>
    where
        Self: 'a;

    /// Acquires the lock exclusively.
    fn guard(&self) -> Self::Guard<'_>;
}

/// Pairs a raw lock with the data it protects.
pub struct Locked<L, T> {
    lock: L,
    data: UnsafeCell<T>,
}

// SAFETY: The data is only ever accessed while holding the lock exclusively.
unsafe impl<L: Sync, T: Send> Sync for Locked<L, T> {}

impl<L: RawLock, T> Locked<L, T> {
    /// Creates a new instance from `lock` and the initial `value`.
    pub fn new(lock: L, value: T) -> Self {
        Self { lock, data: UnsafeCell::new(value) }
    }

    /// Acquires the lock and then runs the closure against the protected data.
    pub fn lock_then<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut T) -> Ret,
    {
        let _guard = self.lock.guard();
        // SAFETY: The guard holds the lock exclusively until the end of the
        // scope, there are no other aliases to the data.
        unsafe { self.data.with_mut_unchecked(f) }
    }
}

/// An arbitrary unsigned integer type.
pub type Int = u32;

#[cfg(all(not(loom), test))]
pub mod tests {
    // Modified test suite from the Rust's Mutex implementation with minor changes
    // since the API is not compatible with this crate implementation and some
    // new tests as well.
    //
    // Copyright 2014 The Rust Project Developers.
    //
    // Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
    // http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
    // <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
    // option. This file may not be copied, modified, or distributed
    // except according to those terms.

    use core::sync::atomic::AtomicU32;
    use core::sync::atomic::Ordering::Relaxed;

    use std::sync::mpsc::channel;
    use std::sync::Arc;
    use std::thread;

    use super::{Int, Locked, RawLock};

    const ITERS: Int = 1000;
    const CONCURRENCY: Int = 3;
    const EXPECTED_VALUE: Int = ITERS * CONCURRENCY * 2;

    fn inc<L: RawLock>(locked: &Locked<L, Int>) {
        locked.lock_then(|data| *data += 1);
    }

    fn get<L: RawLock>(locked: &Locked<L, Int>) -> Int {
        locked.lock_then(|data| *data)
    }

    fn lots_and_lots<L, N>(new: N, f: fn(&Locked<L, Int>)) -> Int
    where
        L: RawLock + Send + Sync + 'static,
        N: Fn() -> L,
    {
        let locked = Arc::new(Locked::new(new(), 0));
        let (tx, rx) = channel();
        for _ in 0..CONCURRENCY {
            let locked1 = Arc::clone(&locked);
            let tx2 = tx.clone();
            thread::spawn(move || {
                f(&locked1);
                tx2.send(()).unwrap();
            });
            let locked2 = Arc::clone(&locked);
            let tx2 = tx.clone();
            thread::spawn(move || {
                f(&locked2);
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..2 * CONCURRENCY {
            rx.recv().unwrap();
        }
        get(&locked)
    }

    pub fn lots_and_lots_lock<L, N>(new: N)
    where
        L: RawLock + Send + Sync + 'static,
        N: Fn() -> L,
    {
        fn inc_for<L: RawLock>(locked: &Locked<L, Int>) {
            for _ in 0..ITERS {
                inc(locked);
            }
        }
        let value = lots_and_lots(new, inc_for::<L>);
        assert_eq!(value, EXPECTED_VALUE);
    }

    pub fn smoke<L, N>(new: N)
    where
        L: RawLock,
        N: Fn() -> L,
    {
        let lock = new();
        drop(lock.guard());
        drop(lock.guard());
    }

    /// Asserts that at most one thread is inside the critical section at any
    /// instant.
    pub fn mutual_exclusion<L, N>(new: N)
    where
        L: RawLock + Sync,
        N: Fn() -> L,
    {
        let lock = new();
        let inside = AtomicU32::new(0);
        thread::scope(|s| {
            for _ in 0..2 * CONCURRENCY {
                s.spawn(|| {
                    for _ in 0..ITERS {
                        let _guard = lock.guard();
                        assert_eq!(inside.fetch_add(1, Relaxed), 0);
                        thread::yield_now();
                        assert_eq!(inside.fetch_sub(1, Relaxed), 1);
                    }
                });
            }
        });
        assert_eq!(inside.load(Relaxed), 0);
    }

    pub fn test_acquire_more_than_one_lock<L, N>(new: N)
    where
        L: RawLock + Send + Sync + 'static,
        N: Fn() -> L + Copy + Send + 'static,
    {
        let arc = Arc::new(new());
        let (tx, rx) = channel();
        for _ in 0..4 {
            let tx2 = tx.clone();
            let c_arc = Arc::clone(&arc);
            let _t = thread::spawn(move || {
                let outer = c_arc.guard();
                let lock = new();
                drop(lock.guard());
                drop(outer);
                tx2.send(()).unwrap();
            });
        }
        drop(tx);
        for _ in 0..4 {
            rx.recv().unwrap();
        }
    }

    pub fn test_lock_arc_access_in_unwind<L, N>(new: N)
    where
        L: RawLock + Send + Sync + 'static,
        N: Fn() -> L,
    {
        let arc = Arc::new(Locked::new(new(), 1));
        let arc2 = arc.clone();
        let _ = thread::spawn(move || {
            struct Unwinder<L: RawLock> {
                i: Arc<Locked<L, Int>>,
            }
            impl<L: RawLock> Drop for Unwinder<L> {
                fn drop(&mut self) {
                    inc(&self.i);
                }
            }
            let _u = Unwinder { i: arc2 };
            panic!();
        })
        .join();
        let value = get(&arc);
        assert_eq!(value, 2);
    }
}
