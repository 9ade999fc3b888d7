use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::sync::lock;

/// Counting semaphore that parks waiters on a condition variable.
#[derive(Debug)]
pub struct Semaphore {
    permits: Mutex<usize>,
    released: Condvar,
}

impl Semaphore {
    /// Builds a semaphore holding `permits` permits.
    #[must_use]
    pub const fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and takes it.
    pub fn acquire(&self) {
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = self
                .released
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }

    /// Waits at most `timeout` for a permit. Returns `false` when none was
    /// taken.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let permits = lock(&self.permits);
        let (mut permits, _) = self
            .released
            .wait_timeout_while(permits, timeout, |permits| *permits == 0)
            .unwrap_or_else(PoisonError::into_inner);
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Returns a permit and wakes one waiter.
    pub fn release(&self) {
        let mut permits = lock(&self.permits);
        *permits += 1;
        drop(permits);
        self.released.notify_one();
    }

    /// Number of permits currently free.
    pub fn available(&self) -> usize {
        *lock(&self.permits)
    }
}
