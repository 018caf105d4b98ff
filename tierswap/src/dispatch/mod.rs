//! Issue page reads through an injected [Transport] and observe their completion.
//!
//! Every read is submitted on a [Channel] (a logical completion queue) and returns a
//! [CompletionHandle] that must be consumed exactly once, either by [Dispatcher::poll] returning
//! [Progress::Done] or by [Dispatcher::drain_blocking]. There is no way to cancel an operation: a
//! handle that is dropped before its operation was observed leaks the transport's in-flight state
//! and is logged as an error.
//!
//! # Channels
//!
//! Each execution unit owns two queues, one for demand reads and one for prefetch reads, so that
//! prefetch completions never mask the progress of a demand read. Transports that cannot separate
//! completion queues per unit (see [Transport::supports_per_core_channels]) are served from the
//! queues of unit 0. This capability is queried once, when the [Dispatcher] is created.

use crate::{page::Page, Slot};
use commonware_runtime::Metrics as RuntimeMetrics;
use std::{fmt, sync::Arc};
use thiserror::Error;
use tracing::{error, trace};

mod metrics;

/// The queue of an execution unit a read is issued on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Queue {
    /// Reads that a fault is waiting on.
    Demand,
    /// Speculative reads issued by readahead.
    Prefetch,
}

/// A logical completion queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel {
    /// The execution unit that owns the queue.
    pub unit: u16,

    /// Which of the unit's queues.
    pub queue: Queue,
}

impl Channel {
    /// The demand queue of `unit`.
    pub const fn demand(unit: u16) -> Self {
        Self {
            unit,
            queue: Queue::Demand,
        }
    }

    /// The prefetch queue of `unit`.
    pub const fn prefetch(unit: u16) -> Self {
        Self {
            unit,
            queue: Queue::Prefetch,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.queue {
            Queue::Demand => write!(f, "{}/demand", self.unit),
            Queue::Prefetch => write!(f, "{}/prefetch", self.unit),
        }
    }
}

/// Opaque identifier of a submitted operation, unique per [Channel].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationId(pub u64);

/// The state of a submitted operation as reported by the [Transport].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Done,
    Failed,
}

/// Returned by a [Transport] that cannot accept another operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transport saturated")]
pub struct Saturated;

/// Moves page contents from the backing tier into memory.
///
/// The core set of methods must be implemented. The capability queries have conservative defaults
/// and are only consulted once, by [Dispatcher::new].
pub trait Transport: Send + Sync + 'static {
    /// Start reading `slot` into `page`. Once [Transport::poll] reports [Completion::Done], the
    /// page must be resident.
    fn submit(&self, page: &Page, slot: Slot, channel: Channel) -> Result<OperationId, Saturated>;

    /// Report the state of `op`. Once [Completion::Done] or [Completion::Failed] is returned, the
    /// transport may forget `op`.
    fn poll(&self, channel: Channel, op: OperationId) -> Completion;

    /// The number of operations on `channel` that have completed but not yet been polled.
    fn peek(&self, channel: Channel) -> usize;

    /// Returns `true` if the transport keeps separate completion queues per execution unit.
    fn supports_per_core_channels(&self) -> bool {
        false
    }

    /// The number of execution units with their own completion queues.
    fn units(&self) -> u16 {
        1
    }
}

/// Errors that can occur when issuing or observing an operation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("submit rejected: {0}")]
    Rejected(Slot),
    #[error("read failed: {0}")]
    Failed(Slot),
}

impl Error {
    /// The slot the failed operation targeted.
    pub fn slot(&self) -> Slot {
        match self {
            Self::Rejected(slot) | Self::Failed(slot) => *slot,
        }
    }
}

/// Correlates one submitted operation with the channel it completes on.
#[must_use = "an issued operation must be polled to completion"]
pub struct CompletionHandle {
    channel: Channel,
    op: OperationId,
    slot: Slot,
    armed: bool,
}

impl CompletionHandle {
    /// The channel the operation completes on.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// The slot being read.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// The transport's identifier of the operation.
    pub fn op(&self) -> OperationId {
        self.op
    }

    fn consume(mut self) {
        self.armed = false;
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("channel", &self.channel)
            .field("op", &self.op)
            .field("slot", &self.slot)
            .finish()
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if self.armed {
            error!(slot = %self.slot, channel = %self.channel, op = self.op.0, "abandoned in-flight operation");
        }
    }
}

/// The result of a non-blocking [Dispatcher::poll].
#[derive(Debug)]
pub enum Progress {
    /// The operation completed and the page is resident.
    Done,
    /// The operation is still in flight. The handle is returned so it can be polled again.
    Pending(CompletionHandle),
}

/// Issues reads to a [Transport] and tracks their completion.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    per_unit: bool,
    units: u16,
    metrics: Arc<metrics::Metrics>,
}

impl<T: Transport> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            per_unit: self.per_unit,
            units: self.units,
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Transport> Dispatcher<T> {
    /// Create a new dispatcher, resolving the transport's capabilities.
    pub fn new<E: RuntimeMetrics>(context: E, transport: Arc<T>) -> Self {
        let per_unit = transport.supports_per_core_channels();
        let units = if per_unit { transport.units().max(1) } else { 1 };
        Self {
            transport,
            per_unit,
            units,
            metrics: Arc::new(metrics::Metrics::init(context)),
        }
    }

    /// The transport reads are issued to.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The channel that `unit` should use for `queue`.
    pub fn channel_for(&self, unit: u16, queue: Queue) -> Channel {
        let unit = if self.per_unit { unit % self.units } else { 0 };
        Channel { unit, queue }
    }

    /// Submit a read of `slot` into `page` on `channel`.
    pub fn issue(&self, page: &Page, slot: Slot, channel: Channel) -> Result<CompletionHandle, Error> {
        let op = self.transport.submit(page, slot, channel).map_err(|_| {
            self.metrics.failed.inc();
            Error::Rejected(slot)
        })?;
        self.metrics.issued.inc();
        self.metrics.in_flight.inc();
        trace!(%slot, %channel, op = op.0, "issued read");
        Ok(CompletionHandle {
            channel,
            op,
            slot,
            armed: true,
        })
    }

    /// Check whether the operation behind `handle` has completed, without waiting.
    pub fn poll(&self, handle: CompletionHandle) -> Result<Progress, Error> {
        match self.transport.poll(handle.channel, handle.op) {
            Completion::Pending => Ok(Progress::Pending(handle)),
            Completion::Done => {
                handle.consume();
                self.metrics.completed.inc();
                self.metrics.in_flight.dec();
                Ok(Progress::Done)
            }
            Completion::Failed => {
                let slot = handle.slot;
                handle.consume();
                self.metrics.failed.inc();
                self.metrics.in_flight.dec();
                Err(Error::Failed(slot))
            }
        }
    }

    /// The number of operations on `channel` that have completed but not yet been polled.
    pub fn peek(&self, channel: Channel) -> usize {
        self.transport.peek(channel)
    }

    /// Wait until the operation behind `handle` completes, yielding to other tasks between polls.
    pub async fn drain_blocking(&self, mut handle: CompletionHandle) -> Result<(), Error> {
        loop {
            match self.poll(handle)? {
                Progress::Done => return Ok(()),
                Progress::Pending(pending) => {
                    handle = pending;
                    commonware_runtime::reschedule().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockTransport;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Metrics, Runner};

    fn page() -> Page {
        Page::zeroed(4)
    }

    #[test_traced]
    fn test_issue_poll_until_done() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let transport = Arc::new(MockTransport::new(4, 3));
            let slot = Slot::new(0, 9);
            transport.write(slot, vec![1, 2, 3, 4]);
            let dispatcher = Dispatcher::new(context.clone(), transport.clone());
            let channel = dispatcher.channel_for(0, Queue::Demand);

            let target = page();
            let mut handle = dispatcher.issue(&target, slot, channel).unwrap();
            assert_eq!(transport.outstanding(), 1);
            let mut polls = 0;
            loop {
                polls += 1;
                match dispatcher.poll(handle).unwrap() {
                    Progress::Done => break,
                    Progress::Pending(pending) => handle = pending,
                }
            }
            assert_eq!(polls, 3);
            assert!(target.is_resident());
            assert_eq!(target.bytes().as_ref(), &[1, 2, 3, 4]);
            assert_eq!(transport.outstanding(), 0);

            let buffer = context.encode();
            assert!(buffer.contains("issued_total 1"));
            assert!(buffer.contains("completed_total 1"));
            assert!(buffer.contains("in_flight 0"));
        });
    }

    #[test_traced]
    fn test_drain_blocking() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let transport = Arc::new(MockTransport::new(4, 10));
            let dispatcher = Dispatcher::new(context, transport.clone());
            let target = page();
            let handle = dispatcher
                .issue(&target, Slot::new(0, 1), Channel::demand(0))
                .unwrap();
            dispatcher.drain_blocking(handle).await.unwrap();
            assert!(target.is_resident());
            assert_eq!(transport.outstanding(), 0);
        });
    }

    #[test_traced]
    fn test_rejected_and_failed() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let transport = Arc::new(MockTransport::new(4, 0));
            let rejected = Slot::new(0, 1);
            let broken = Slot::new(0, 2);
            transport.reject(rejected);
            transport.break_read(broken);
            let dispatcher = Dispatcher::new(context.clone(), transport.clone());

            let err = dispatcher
                .issue(&page(), rejected, Channel::demand(0))
                .unwrap_err();
            assert_eq!(err, Error::Rejected(rejected));

            let target = page();
            let handle = dispatcher.issue(&target, broken, Channel::demand(0)).unwrap();
            let err = dispatcher.drain_blocking(handle).await.unwrap_err();
            assert_eq!(err, Error::Failed(broken));
            assert_eq!(err.slot(), broken);
            assert!(!target.is_resident());
            assert_eq!(transport.outstanding(), 0);

            let buffer = context.encode();
            assert!(buffer.contains("failed_total 2"));
            assert!(buffer.contains("in_flight 0"));
        });
    }

    #[test_traced]
    fn test_peek_counts_completed() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let transport = Arc::new(MockTransport::new(4, 2));
            let dispatcher = Dispatcher::new(context, transport.clone());
            let channel = Channel::prefetch(0);
            let pages: Vec<_> = (0..3).map(|_| page()).collect();
            let handles: Vec<_> = pages
                .iter()
                .enumerate()
                .map(|(i, p)| dispatcher.issue(p, Slot::new(0, i as u64), channel).unwrap())
                .collect();

            // Nothing is complete until the channel advances
            assert_eq!(dispatcher.peek(channel), 0);
            assert_eq!(dispatcher.peek(channel), 3);

            // Other queues are unaffected
            assert_eq!(dispatcher.peek(Channel::demand(0)), 0);

            for handle in handles {
                assert!(matches!(dispatcher.poll(handle), Ok(Progress::Done)));
            }
            assert_eq!(dispatcher.peek(channel), 0);
            assert!(pages.iter().all(|p| p.is_resident()));
        });
    }

    #[test_traced]
    fn test_channel_capabilities() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let shared = Dispatcher::new(
                context.with_label("shared"),
                Arc::new(MockTransport::new(4, 0)),
            );
            assert_eq!(shared.channel_for(5, Queue::Demand), Channel::demand(0));
            assert_eq!(shared.channel_for(5, Queue::Prefetch), Channel::prefetch(0));

            let per_unit = Dispatcher::new(
                context.with_label("per_unit"),
                Arc::new(MockTransport::new(4, 0).with_units(4)),
            );
            assert_eq!(per_unit.channel_for(2, Queue::Demand), Channel::demand(2));
            assert_eq!(per_unit.channel_for(6, Queue::Prefetch), Channel::prefetch(2));
        });
    }
}
