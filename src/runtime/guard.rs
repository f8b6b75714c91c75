//! Per-conversation in-flight guard
//!
//! At most one submission per conversation id runs at a time. Later
//! submissions for the same id wait in arrival order; other ids are not
//! affected. Slots exist only while someone holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// One conversation's lock plus the number of holders and waiters using it
#[derive(Default)]
struct Slot {
    lock: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

type SlotMap = HashMap<String, Slot>;
type Slots = Arc<Mutex<SlotMap>>;

#[derive(Default, Clone)]
pub struct InFlightGuard {
    slots: Slots,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other submission holds `conversation_id`, then hold it
    /// until the returned lease is dropped.
    pub async fn acquire(&self, conversation_id: &str) -> InFlightLease {
        let mutex = {
            let mut slots = lock(&self.slots);
            let slot = slots.entry(conversation_id.to_string()).or_default();
            slot.users += 1;
            Arc::clone(&slot.lock)
        };

        // Gives the slot back if this future is dropped while waiting
        let mut waiting = Waiting {
            conversation_id,
            slots: &self.slots,
            armed: true,
        };

        // tokio's Mutex is fair, so waiters are served first come first served
        let held = mutex.lock_owned().await;
        waiting.armed = false;

        InFlightLease {
            conversation_id: conversation_id.to_string(),
            held: Some(held),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of conversations currently held or waited on
    pub fn active(&self) -> usize {
        lock(&self.slots).len()
    }
}

struct Waiting<'a> {
    conversation_id: &'a str,
    slots: &'a Slots,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            release(&mut lock(self.slots), self.conversation_id);
        }
    }
}

/// Exclusive hold on one conversation. Released on drop.
pub struct InFlightLease {
    conversation_id: String,
    held: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl InFlightLease {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }
}

impl Drop for InFlightLease {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        drop(self.held.take());
        release(&mut slots, &self.conversation_id);
    }
}

/// Drop one user of a slot, removing the slot when nobody is left
fn release(slots: &mut SlotMap, conversation_id: &str) {
    let idle = match slots.get_mut(conversation_id) {
        Some(slot) => {
            slot.users = slot.users.saturating_sub(1);
            slot.users == 0
        }
        None => false,
    };
    if idle {
        slots.remove(conversation_id);
    }
}

fn lock(slots: &Slots) -> MutexGuard<'_, SlotMap> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
