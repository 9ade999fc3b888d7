use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tracing::warn;

use super::Semaphore;
use crate::sync::lock;

const POOL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::admission");

/// Reusable client handle for lightweight read-only operations.
#[derive(Debug, PartialEq, Eq)]
pub struct SecondaryHandle {
    slot: usize,
}

impl SecondaryHandle {
    /// Position of the handle inside its pool.
    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles waiting in the queue.
    pub available: usize,
    /// Handles currently checked out.
    pub checked_out: usize,
    /// Fixed pool size.
    pub capacity: usize,
}

#[derive(Debug)]
struct PoolState<H> {
    available: VecDeque<Arc<H>>,
    checked_out: Vec<Arc<H>>,
}

/// Fixed pool of handles shared between worker threads.
///
/// The semaphore blocks callers while the pool is empty; the mutex guards
/// the queue and the checked-out list, so `available + checked_out` always
/// equals the capacity when the lock is released.
#[derive(Debug)]
pub struct HandlePool<H> {
    capacity: usize,
    permits: Semaphore,
    state: Mutex<PoolState<H>>,
}

impl HandlePool<SecondaryHandle> {
    /// Builds a pool of `size` secondary handles.
    #[must_use]
    pub fn secondary(size: usize) -> Self {
        Self::new((0..size).map(|slot| SecondaryHandle { slot }))
    }
}

impl<H> HandlePool<H> {
    /// Builds a pool owning `handles`.
    pub fn new(handles: impl IntoIterator<Item = H>) -> Self {
        let available: VecDeque<Arc<H>> = handles.into_iter().map(Arc::new).collect();
        let capacity = available.len();
        Self {
            capacity,
            permits: Semaphore::new(capacity),
            state: Mutex::new(PoolState {
                available,
                checked_out: Vec::with_capacity(capacity),
            }),
        }
    }

    /// Blocks until a handle is free, then takes the oldest one.
    pub fn checkout_handle(&self) -> Arc<H> {
        loop {
            self.permits.acquire();
            let mut state = lock(&self.state);
            if let Some(handle) = state.available.pop_front() {
                state.checked_out.push(Arc::clone(&handle));
                return handle;
            }
            drop(state);
            // Permits track the queue length, so this only happens if the
            // two drifted apart; give the permit back and retry.
            self.permits.release();
            std::thread::yield_now();
        }
    }

    /// Returns a handle obtained from [`Self::checkout_handle`].
    ///
    /// Handles that are not checked out from this pool are refused and
    /// `false` is returned.
    pub fn checkin_handle(&self, handle: Arc<H>) -> bool {
        let mut state = lock(&self.state);
        let Some(position) = state
            .checked_out
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, &handle))
        else {
            drop(state);
            warn!(target: POOL_TARGET, "refused check-in of a handle that is not checked out");
            return false;
        };
        state.checked_out.swap_remove(position);
        state.available.push_back(handle);
        drop(state);
        self.permits.release();
        true
    }

    /// Checks out a handle that is checked back in when the lease drops.
    pub fn lease(&self) -> HandleLease<'_, H> {
        HandleLease {
            pool: self,
            handle: self.checkout_handle(),
        }
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.state);
        PoolStats {
            available: state.available.len(),
            checked_out: state.checked_out.len(),
            capacity: self.capacity,
        }
    }
}

/// Scoped checkout of a pooled handle.
#[derive(Debug)]
pub struct HandleLease<'pool, H> {
    pool: &'pool HandlePool<H>,
    handle: Arc<H>,
}

impl<H> Deref for HandleLease<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        &self.handle
    }
}

impl<H> Drop for HandleLease<'_, H> {
    fn drop(&mut self) {
        self.pool.checkin_handle(Arc::clone(&self.handle));
    }
}
