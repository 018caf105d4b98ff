use crate::Slot;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

/// The number of independently locked shards.
const SHARDS: usize = 64;

/// Per-slot "fetch in progress" markers.
///
/// At most one [Reservation] exists for a slot at any time. Reserving a slot that is already
/// reserved fails without blocking, leaving the caller to retry or skip.
#[derive(Clone)]
pub(super) struct Reservations {
    shards: Arc<[Mutex<HashSet<Slot>>]>,
}

impl Reservations {
    pub(super) fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    fn shard(&self, slot: &Slot) -> &Mutex<HashSet<Slot>> {
        let mix = slot.offset ^ ((slot.device as u64) << 32);
        &self.shards[(mix as usize) % SHARDS]
    }

    /// Place a marker on `slot`, returning `None` if another caller holds one.
    pub(super) fn try_reserve(&self, slot: Slot) -> Option<Reservation> {
        let mut shard = self.shard(&slot).lock().unwrap();
        if !shard.insert(slot) {
            return None;
        }
        Some(Reservation {
            slot,
            table: self.clone(),
        })
    }

    /// Returns `true` if `slot` is currently reserved.
    pub(super) fn is_reserved(&self, slot: Slot) -> bool {
        self.shard(&slot).lock().unwrap().contains(&slot)
    }

    /// The number of outstanding reservations.
    pub(super) fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}

/// A claim on a slot, released when dropped.
pub struct Reservation {
    slot: Slot,
    table: Reservations,
}

impl Reservation {
    /// The reserved slot.
    pub fn slot(&self) -> Slot {
        self.slot
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Reservation").field(&self.slot).finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.table.shard(&self.slot).lock().unwrap().remove(&self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusive_until_dropped() {
        let table = Reservations::new();
        let slot = Slot::new(3, 17);

        let first = table.try_reserve(slot).unwrap();
        assert_eq!(first.slot(), slot);
        assert!(table.is_reserved(slot));
        assert!(table.try_reserve(slot).is_none());

        // Unrelated slots (including the same offset on another device) are independent
        let other = table.try_reserve(Slot::new(4, 17)).unwrap();
        assert_eq!(table.len(), 2);

        drop(first);
        assert!(!table.is_reserved(slot));
        let again = table.try_reserve(slot).unwrap();
        drop(again);
        drop(other);
        assert_eq!(table.len(), 0);
    }
}
