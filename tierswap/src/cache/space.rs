use super::{Error, PageHandle};
use crate::Slot;
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Mutex,
};

/// The slots of one device, partitioned into independently locked segments.
///
/// # Invariants
///
/// Each segment holds at most one entry per offset, and every entry held by segment `i` has an
/// offset in `[i * segment_pages, (i + 1) * segment_pages)`.
pub(super) struct AddressSpace {
    device: u32,
    capacity: u64,
    segment_pages: u64,
    segments: Vec<Mutex<HashMap<u64, PageHandle>>>,
}

impl AddressSpace {
    /// Create an address space able to hold `capacity` slots.
    pub(super) fn new(device: u32, capacity: u64, segment_pages: u64) -> Self {
        let count = capacity.div_ceil(segment_pages).max(1);
        let segments = (0..count).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            device,
            capacity,
            segment_pages,
            segments,
        }
    }

    pub(super) fn capacity(&self) -> u64 {
        self.capacity
    }

    fn segment(&self, slot: Slot) -> Result<&Mutex<HashMap<u64, PageHandle>>, Error> {
        if slot.offset >= self.capacity {
            return Err(Error::OutOfRange(slot));
        }
        let index = (slot.offset / self.segment_pages) as usize;
        Ok(&self.segments[index])
    }

    /// Insert `handle` if no entry exists for its slot. `admit` is consulted (under the segment
    /// lock) before the entry is placed and may refuse it.
    pub(super) fn insert(
        &self,
        handle: PageHandle,
        admit: impl FnOnce() -> Result<(), Error>,
    ) -> Result<(), Error> {
        let slot = handle.slot();
        let mut segment = self.segment(slot)?.lock().unwrap();
        match segment.entry(slot.offset) {
            Entry::Occupied(_) => Err(Error::AlreadyPresent(slot)),
            Entry::Vacant(v) => {
                admit()?;
                v.insert(handle);
                Ok(())
            }
        }
    }

    pub(super) fn get(&self, slot: Slot) -> Option<PageHandle> {
        let segment = self.segment(slot).ok()?.lock().unwrap();
        segment.get(&slot.offset).cloned()
    }

    pub(super) fn remove(&self, slot: Slot) -> Result<PageHandle, Error> {
        let mut segment = self.segment(slot)?.lock().unwrap();
        segment.remove(&slot.offset).ok_or(Error::NotPresent(slot))
    }

    /// The number of entries across all segments.
    pub(super) fn live(&self) -> usize {
        self.segments
            .iter()
            .map(|segment| segment.lock().unwrap().len())
            .sum()
    }

    pub(super) fn device(&self) -> u32 {
        self.device
    }
}
