use loom::cell::UnsafeCell;

/// A flag that is only ever accessed while holding some lock, so that Loom
/// reports any access the lock fails to order.
pub struct Flag(UnsafeCell<bool>);

// SAFETY: Models only access the flag while holding the lock that protects it.
unsafe impl Sync for Flag {}

impl Flag {
    pub fn new() -> Self {
        Self(UnsafeCell::new(false))
    }

    /// # Safety
    ///
    /// Caller must hold the lock that protects this flag.
    pub unsafe fn get(&self) -> bool {
        // SAFETY: Caller guaranteed that there are no mutable aliases.
        self.0.with(|ptr| unsafe { *ptr })
    }

    /// # Safety
    ///
    /// Caller must hold the lock that protects this flag exclusively.
    pub unsafe fn set(&self) {
        // SAFETY: Caller guaranteed that there are no other aliases.
        self.0.with_mut(|ptr| unsafe { *ptr = true });
    }
}

pub mod models {
    use core::array;

    use loom::sync::Arc;
    use loom::{model, thread};

    use super::Flag;
    use crate::raw::{ConditionVariable, Mutex};
    use crate::test::{Int, Locked, RawLock};

    const RUNS: usize = 2;

    /// Increments a shared integer.
    fn inc<L: RawLock>(locked: &Arc<Locked<L, Int>>) {
        locked.lock_then(|data| *data += 1);
    }

    /// Get the shared integer.
    fn get<L: RawLock>(locked: &Arc<Locked<L, Int>>) -> Int {
        locked.lock_then(|data| *data)
    }

    /// Evaluates that concurrent exclusive acquisitions serialize all
    /// mutations against the shared data, therefore no data races.
    pub fn lock_join<L, N>(new: N)
    where
        L: RawLock + Send + Sync + 'static,
        N: Fn() -> L + Send + Sync + 'static,
    {
        model(move || {
            let data = Arc::new(Locked::new(new(), 0));
            let handles: [_; RUNS] = array::from_fn(|_| {
                let data = Arc::clone(&data);
                thread::spawn(move || inc(&data))
            });
            for handle in handles {
                handle.join().unwrap();
            }
            let data = get(&data);
            assert_eq!(RUNS as Int, data);
        });
    }

    /// Evaluates that a waiter observes the condition set by the signaling
    /// thread once it returns from waiting, and that it is not lost.
    pub fn wait_signal(recursive: bool) {
        model(move || {
            // Leaked, a condition variable must not outlive its mutex.
            let mutex: &'static Mutex = Box::leak(Box::new(Mutex::with_backend(recursive)));
            let cond: &'static ConditionVariable<'static> =
                Box::leak(Box::new(ConditionVariable::with_backend()));
            let ready: &'static Flag = Box::leak(Box::new(Flag::new()));
            let handle = thread::spawn(move || {
                mutex.lock();
                // SAFETY: The mutex is held.
                unsafe { ready.set() };
                cond.signal();
                mutex.unlock();
            });
            mutex.lock();
            // SAFETY: The mutex is held, `wait` returns holding it again.
            while !unsafe { ready.get() } {
                cond.wait(mutex);
            }
            mutex.unlock();
            handle.join().unwrap();
            assert!(!cond.has_waiters());
        });
    }
}
