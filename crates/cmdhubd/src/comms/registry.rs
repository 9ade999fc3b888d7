//! Registry of state listeners.

use std::sync::Mutex;

use tracing::debug;

use super::petition::Petition;
use super::{COMMS_TARGET, Delivery};
use crate::sync::lock;

/// Consecutive undelivered pushes after which a listener is dropped.
pub const MAX_MISSED_PUSHES: u8 = 3;

#[derive(Debug, Default)]
struct Registry {
    last_client_id: u64,
    entries: Vec<Petition>,
}

/// Petitions kept open to receive pushed messages.
#[derive(Debug, Default)]
pub struct StateListeners {
    registry: Mutex<Registry>,
}

impl StateListeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `petition` and returns its newly assigned client id.
    pub fn register(&self, mut petition: Petition) -> u64 {
        let mut registry = lock(&self.registry);
        registry.last_client_id += 1;
        let client_id = registry.last_client_id;
        petition.set_client_id(client_id);
        registry.entries.push(petition);
        client_id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Client ids currently registered, in registration order.
    #[must_use]
    pub fn client_ids(&self) -> Vec<u64> {
        lock(&self.registry)
            .entries
            .iter()
            .filter_map(Petition::client_id)
            .collect()
    }

    /// Pushes to every listener through `push` and prunes the dead ones.
    /// Returns how many pushes were delivered.
    pub(crate) fn inform_all(&self, mut push: impl FnMut(&mut Petition) -> Delivery) -> usize {
        let mut registry = lock(&self.registry);
        let mut delivered = 0;
        registry.entries.retain_mut(|petition| {
            let delivery = push(petition);
            if delivery == Delivery::Delivered {
                delivered += 1;
            }
            settle(petition, delivery)
        });
        delivered
    }

    /// Pushes to the listener registered as `client_id`.
    pub(crate) fn inform_one(
        &self,
        client_id: u64,
        push: impl FnOnce(&mut Petition) -> Delivery,
    ) -> Delivery {
        let mut registry = lock(&self.registry);
        let Some(index) = registry
            .entries
            .iter()
            .position(|petition| petition.client_id() == Some(client_id))
        else {
            return Delivery::UnknownClient;
        };
        let Some(petition) = registry.entries.get_mut(index) else {
            return Delivery::UnknownClient;
        };
        let delivery = push(petition);
        if !settle(petition, delivery) {
            registry.entries.remove(index);
        }
        delivery
    }

    /// Removes every listener.
    pub fn drain(&self) -> Vec<Petition> {
        std::mem::take(&mut lock(&self.registry).entries)
    }
}

/// Applies a push result; returns whether the listener stays registered.
fn settle(petition: &mut Petition, delivery: Delivery) -> bool {
    let keep = match delivery {
        Delivery::Delivered => {
            petition.record_push(true);
            true
        }
        Delivery::Pending => {
            petition.record_push(false);
            petition.missed_pushes() < MAX_MISSED_PUSHES
        }
        Delivery::Gone => false,
        Delivery::Unsupported | Delivery::UnknownClient => true,
    };
    if !keep {
        debug!(
            target: COMMS_TARGET,
            client_id = petition.client_id(),
            ?delivery,
            "dropping state listener"
        );
    }
    keep
}
