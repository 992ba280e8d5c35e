// Client-controlled state: per-peer, last-write-wins presence data.
//
// Each peer owns exactly one slot keyed by its client id. Slots travel by
// direct broadcast through the relay, outside the ordered transaction log,
// so they are never rolled back. A `null` value in a merge removes that key;
// a `None` slot in an update means the peer left.

use std::collections::BTreeMap;

use lockstep_protocol::{ClientId, ClientSlot, ClientSlotUpdates};
use serde_json::Value;

#[derive(Clone, Debug)]
pub struct ClientStates {
    own_id: ClientId,
    slots: BTreeMap<ClientId, ClientSlot>,
}

impl ClientStates {
    pub fn new(own_id: ClientId, others: BTreeMap<ClientId, ClientSlot>) -> Self {
        let mut states = Self {
            own_id,
            slots: others,
        };
        states.slots.entry(states.own_id.clone()).or_default();
        states
    }

    pub fn own(&self) -> &ClientSlot {
        // Always present: inserted in `new` and never removed.
        &self.slots[&self.own_id]
    }

    pub fn get(&self, id: &ClientId) -> Option<&ClientSlot> {
        self.slots.get(id)
    }

    pub fn all(&self) -> &BTreeMap<ClientId, ClientSlot> {
        &self.slots
    }

    /// Replace this peer's slot. Returns the new slot for broadcasting.
    pub fn set_own(&mut self, slot: ClientSlot) -> ClientSlot {
        let slot: ClientSlot = slot.into_iter().filter(|(_, v)| !v.is_null()).collect();
        self.slots.insert(self.own_id.clone(), slot.clone());
        slot
    }

    /// Merge keys into this peer's slot; `null` removes a key.
    pub fn merge_own(&mut self, patch: ClientSlot) {
        let own = self.slots.entry(self.own_id.clone()).or_default();
        merge_slot(own, patch);
    }

    /// Apply slot updates relayed from other peers. Updates addressed to our
    /// own id are ignored: this peer is the only writer of its slot.
    /// Returns whether anything changed.
    pub fn apply_updates(&mut self, updates: ClientSlotUpdates) -> bool {
        let mut changed = false;
        for (id, slot) in updates {
            if id == self.own_id {
                continue;
            }
            match slot {
                Some(slot) => {
                    if self.slots.get(&id) != Some(&slot) {
                        self.slots.insert(id, slot);
                        changed = true;
                    }
                }
                None => changed |= self.slots.remove(&id).is_some(),
            }
        }
        changed
    }
}

/// Merge `patch` into `slot`, last write wins per key; `null` removes.
pub fn merge_slot(slot: &mut ClientSlot, patch: ClientSlot) {
    for (key, value) in patch {
        if value == Value::Null {
            slot.remove(&key);
        } else {
            slot.insert(key, value);
        }
    }
}
