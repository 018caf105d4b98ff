use super::{region::Pte, Plan};
use crate::{dispatch::Channel, fetch::Fetch, AllocFlags, Owner};

/// A readahead window waiting to be drained.
///
/// A request is created by the fault that computed the window, may be partially drained on the
/// fault path, and is then moved (together with any reads that path left in flight) to the
/// prefetch worker, which owns it until `progress` reaches the end of the window.
#[derive(Debug)]
pub struct PrefetchRequest {
    /// The owner prefetched pages are charged against.
    pub owner: Owner,

    /// The faulting address.
    pub address: u64,

    /// The address of the first entry.
    pub base: u64,

    /// The address increment between consecutive entries (0 if every entry uses `base`).
    pub stride: u64,

    /// The index of the faulting entry, which is never prefetched.
    pub offset: Option<usize>,

    /// The captured entries of the window.
    pub entries: Vec<Pte>,

    /// The index of the next entry to drain.
    pub progress: usize,

    /// The channel prefetch reads are issued on.
    pub channel: Channel,

    /// Allocation flags for prefetched pages.
    pub alloc: AllocFlags,

    /// Reads issued on the fault path that have not yet been committed.
    pub inflight: Vec<Fetch>,
}

impl PrefetchRequest {
    /// Create a request to drain `plan` on `channel`.
    pub fn new(plan: Plan, owner: Owner, address: u64, channel: Channel, alloc: AllocFlags) -> Self {
        Self {
            owner,
            address,
            base: plan.base,
            stride: plan.stride,
            offset: plan.offset,
            entries: plan.entries,
            progress: 0,
            channel,
            alloc,
            inflight: Vec::new(),
        }
    }

    /// The number of entries in the window.
    pub fn nr_entries(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` once every entry was visited.
    pub fn exhausted(&self) -> bool {
        self.progress >= self.entries.len()
    }

    /// The address backed by entry `index`.
    pub fn address_of(&self, index: usize) -> u64 {
        self.base + self.stride * index as u64
    }

    /// Returns the next entry (with its index) and advances the cursor.
    pub fn advance(&mut self) -> Option<(usize, Pte)> {
        let index = self.progress;
        let pte = *self.entries.get(index)?;
        self.progress += 1;
        Some((index, pte))
    }
}
