//! Deterministic collaborators for testing.

use crate::{
    dispatch::{Channel, Completion, OperationId, Saturated, Transport},
    page::{AllocHint, OutOfMemory, Page, PageAllocator},
    readahead::{PageTable, Pte},
    AllocFlags, ChargeError, Owner, OwnerCharge, Slot, UsageOracle,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

struct Operation {
    id: u64,
    slot: Slot,
    page: Page,
    ready_at: u64,
    broken: bool,
}

/// A completion queue that advances one tick every time it is polled or peeked.
#[derive(Default)]
struct Queue {
    tick: u64,
    operations: Vec<Operation>,
}

#[derive(Default)]
struct State {
    next: u64,
    queues: HashMap<Channel, Queue>,
    store: HashMap<Slot, Vec<u8>>,
    rejected: HashSet<Slot>,
    broken: HashSet<Slot>,
    submitted: HashMap<Slot, usize>,
}

/// An in-memory [Transport] whose operations complete a fixed number of ticks after they were
/// submitted.
///
/// Time is counted per channel: every [Transport::poll] or [Transport::peek] of a channel
/// advances that channel by one tick. An operation submitted at tick `t` completes at tick
/// `t + latency`.
pub struct MockTransport {
    page_size: usize,
    latency: u64,
    units: Option<u16>,
    state: Mutex<State>,
}

impl MockTransport {
    /// Create a transport serving pages of `page_size` bytes after `latency` ticks.
    pub fn new(page_size: usize, latency: u64) -> Self {
        Self {
            page_size,
            latency,
            units: None,
            state: Mutex::new(State::default()),
        }
    }

    /// Advertise separate completion queues for `units` execution units.
    pub fn with_units(mut self, units: u16) -> Self {
        self.units = Some(units);
        self
    }

    /// The contents served for `slot` unless it was written.
    pub fn contents(slot: Slot, page_size: usize) -> Vec<u8> {
        slot.offset
            .to_le_bytes()
            .iter()
            .copied()
            .cycle()
            .take(page_size)
            .collect()
    }

    /// Store `data` as the contents of `slot`.
    pub fn write(&self, slot: Slot, mut data: Vec<u8>) {
        data.resize(self.page_size, 0);
        self.state.lock().unwrap().store.insert(slot, data);
    }

    /// Refuse to submit reads of `slot`.
    pub fn reject(&self, slot: Slot) {
        self.state.lock().unwrap().rejected.insert(slot);
    }

    /// Fail reads of `slot` on completion.
    pub fn break_read(&self, slot: Slot) {
        self.state.lock().unwrap().broken.insert(slot);
    }

    /// The number of operations submitted for `slot`.
    pub fn submitted(&self, slot: Slot) -> usize {
        self.state
            .lock()
            .unwrap()
            .submitted
            .get(&slot)
            .copied()
            .unwrap_or(0)
    }

    /// The number of operations submitted for all slots.
    pub fn total_submitted(&self) -> usize {
        self.state.lock().unwrap().submitted.values().sum()
    }

    /// The number of operations that were submitted but not yet observed as complete.
    pub fn outstanding(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .values()
            .map(|queue| queue.operations.len())
            .sum()
    }
}

impl Transport for MockTransport {
    fn submit(&self, page: &Page, slot: Slot, channel: Channel) -> Result<OperationId, Saturated> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.contains(&slot) {
            return Err(Saturated);
        }
        *state.submitted.entry(slot).or_default() += 1;
        let id = state.next;
        state.next += 1;
        let broken = state.broken.contains(&slot);
        let queue = state.queues.entry(channel).or_default();
        queue.operations.push(Operation {
            id,
            slot,
            page: page.clone(),
            ready_at: queue.tick + self.latency,
            broken,
        });
        Ok(OperationId(id))
    }

    fn poll(&self, channel: Channel, op: OperationId) -> Completion {
        let mut state = self.state.lock().unwrap();
        let State { queues, store, .. } = &mut *state;
        let Some(queue) = queues.get_mut(&channel) else {
            return Completion::Failed;
        };
        queue.tick += 1;
        let Some(index) = queue.operations.iter().position(|o| o.id == op.0) else {
            return Completion::Failed;
        };
        if queue.operations[index].ready_at > queue.tick {
            return Completion::Pending;
        }
        let operation = queue.operations.swap_remove(index);
        if operation.broken {
            return Completion::Failed;
        }
        match store.get(&operation.slot) {
            Some(data) => operation.page.fill(data),
            None => operation
                .page
                .fill(&Self::contents(operation.slot, operation.page.len())),
        }
        Completion::Done
    }

    fn peek(&self, channel: Channel) -> usize {
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.entry(channel).or_default();
        queue.tick += 1;
        let tick = queue.tick;
        queue
            .operations
            .iter()
            .filter(|o| o.ready_at <= tick)
            .count()
    }

    fn supports_per_core_channels(&self) -> bool {
        self.units.is_some()
    }

    fn units(&self) -> u16 {
        self.units.unwrap_or(1)
    }
}

/// A heap-backed [PageAllocator] that can be told to fail.
pub struct FailingAllocator {
    page_size: usize,
    failing: AtomicBool,
    allocated: AtomicUsize,
}

impl FailingAllocator {
    /// Create an allocator of `page_size` byte pages.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            failing: AtomicBool::new(false),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Make every following allocation fail (or succeed).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// The number of pages handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

impl PageAllocator for FailingAllocator {
    fn allocate(&self, _: AllocHint) -> Result<Page, OutOfMemory> {
        if self.failing.load(Ordering::Acquire) {
            return Err(OutOfMemory);
        }
        self.allocated.fetch_add(1, Ordering::AcqRel);
        Ok(Page::zeroed(self.page_size))
    }
}

/// A [UsageOracle] that reports the slots it was told about as unused.
#[derive(Default)]
pub struct SetOracle {
    unused: Mutex<HashSet<Slot>>,
}

impl SetOracle {
    /// Report `slot` as unused.
    pub fn mark_unused(&self, slot: Slot) {
        self.unused.lock().unwrap().insert(slot);
    }

    /// Report `slot` as used again.
    pub fn mark_used(&self, slot: Slot) {
        self.unused.lock().unwrap().remove(&slot);
    }
}

impl UsageOracle for SetOracle {
    fn is_unused(&self, slot: Slot) -> bool {
        self.unused.lock().unwrap().contains(&slot)
    }
}

/// An [OwnerCharge] that records what it charged and can be told to fail.
#[derive(Default)]
pub struct RecordingCharge {
    failing: AtomicBool,
    charged: AtomicUsize,
    batches: Mutex<Vec<(Owner, usize, AllocFlags)>>,
}

impl RecordingCharge {
    /// Make every following charge fail (or succeed).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// The number of pages successfully charged.
    pub fn charged(&self) -> usize {
        self.charged.load(Ordering::Acquire)
    }

    /// The successful batch charges as `(owner, pages, flags)`.
    pub fn batches(&self) -> Vec<(Owner, usize, AllocFlags)> {
        self.batches.lock().unwrap().clone()
    }
}

impl OwnerCharge for RecordingCharge {
    fn charge(&self, _: &Page, owner: Owner, _: AllocFlags) -> Result<(), ChargeError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ChargeError(owner));
        }
        self.charged.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn charge_batch(
        &self,
        pages: &[Page],
        owner: Owner,
        flags: AllocFlags,
    ) -> Result<(), ChargeError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ChargeError(owner));
        }
        self.charged.fetch_add(pages.len(), Ordering::AcqRel);
        self.batches
            .lock()
            .unwrap()
            .push((owner, pages.len(), flags));
        Ok(())
    }
}

/// A [PageTable] backed by a map from virtual page number to entry. Unset entries are
/// [Pte::None].
#[derive(Default)]
pub struct StaticPageTable {
    entries: Mutex<HashMap<u64, Pte>>,
}

impl StaticPageTable {
    /// Set the entry for `vpn`.
    pub fn set(&self, vpn: u64, pte: Pte) {
        self.entries.lock().unwrap().insert(vpn, pte);
    }
}

impl PageTable for StaticPageTable {
    fn capture(&self, start_vpn: u64, end_vpn: u64) -> Vec<Pte> {
        let entries = self.entries.lock().unwrap();
        (start_vpn..end_vpn)
            .map(|vpn| entries.get(&vpn).copied().unwrap_or(Pte::None))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_counts_polls_per_channel() {
        let transport = MockTransport::new(4, 2);
        let page = Page::zeroed(4);
        let slot = Slot::new(0, 0x0102);
        let op = transport.submit(&page, slot, Channel::demand(0)).unwrap();

        // Ticks on another channel do not count
        assert_eq!(transport.peek(Channel::demand(1)), 0);
        assert_eq!(transport.peek(Channel::demand(1)), 0);
        assert_eq!(transport.poll(Channel::demand(0), op), Completion::Pending);
        assert_eq!(transport.poll(Channel::demand(0), op), Completion::Done);
        assert_eq!(page.bytes().as_ref(), &[0x02, 0x01, 0, 0]);
        assert_eq!(transport.outstanding(), 0);
        assert_eq!(transport.submitted(slot), 1);

        // A forgotten operation is reported as failed
        assert_eq!(transport.poll(Channel::demand(0), op), Completion::Failed);
    }
}
