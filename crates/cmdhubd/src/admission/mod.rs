//! Admission control: the petition slot semaphore and the secondary handle
//! pool.

mod pool;
mod semaphore;


use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub use pool::{HandleLease, HandlePool, PoolStats, SecondaryHandle};
pub use semaphore::Semaphore;

/// Bounds how many petitions are processed at once.
#[derive(Debug)]
pub struct AdmissionController {
    slots: Semaphore,
    capacity: usize,
    in_use: AtomicUsize,
}

impl AdmissionController {
    /// Builds a controller with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Semaphore::new(capacity),
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Blocks until a slot is free and takes it.
    ///
    /// Every call must be paired with exactly one [`Self::release_slot`].
    pub fn acquire_slot(&self) {
        self.slots.acquire();
        self.in_use.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns a slot taken by [`Self::acquire_slot`].
    pub fn release_slot(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.slots.release();
    }

    /// Takes a slot that is released when the permit drops.
    #[must_use]
    pub fn permit(self: &Arc<Self>) -> SlotPermit {
        self.acquire_slot();
        SlotPermit {
            controller: Arc::clone(self),
        }
    }

    /// Like [`Self::permit`], but gives up after `timeout`.
    #[must_use]
    pub fn permit_timeout(self: &Arc<Self>, timeout: Duration) -> Option<SlotPermit> {
        if !self.slots.acquire_timeout(timeout) {
            return None;
        }
        self.in_use.fetch_add(1, Ordering::SeqCst);
        Some(SlotPermit {
            controller: Arc::clone(self),
        })
    }

    /// Configured slot capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

/// Slot held for the lifetime of one petition.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct SlotPermit {
    controller: Arc<AdmissionController>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.controller.release_slot();
    }
}
