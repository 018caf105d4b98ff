//! Drain readahead windows in the background.
//!
//! # Overview
//!
//! A fault that computes a readahead window hands the resulting [PrefetchRequest] to the [Actor]
//! through its [Mailbox]. The actor owns the request from then on: it visits the entries of the
//! window in passes of at most `batch` entries, issuing a read for every evicted page that is
//! neither cached nor being fetched by someone else, and re-enqueues the request behind any newer
//! ones until its cursor reaches the end of the window.
//!
//! # Bounding In-Flight Reads
//!
//! Every `peek_interval` issued reads, the actor peeks its completion channel and commits whatever
//! has completed. At the end of a pass it waits for every read the pass issued, so a request never
//! carries unconfirmed reads from one pass into the next.
//!
//! # Failures
//!
//! Nothing the worker does can fail a fault. Entries that cannot be prefetched (allocation or
//! transport failure, a lost race, a full cache) are skipped.

use crate::{
    cache::Flags,
    dispatch::Transport,
    fetch::{ChargeMode, Claim, Coordinator, LockMode, Request},
    readahead::PrefetchRequest,
};
use commonware_runtime::Clock;
use tracing::{debug, trace};

mod actor;
pub use actor::Actor;
mod ingress;
pub use ingress::Mailbox;
pub(crate) use ingress::Message;
mod metrics;

/// Configuration for the [Actor].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    /// The maximum number of entries visited per pass.
    pub batch: usize,

    /// The number of reads issued between peeks at the completion channel.
    pub peek_interval: usize,

    /// Reaction to an entry that is already being fetched.
    pub lock: LockMode,

    /// When prefetched pages are charged against their owner.
    pub charge: ChargeMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailbox_size: 1024,
            batch: 64,
            peek_interval: 4,
            lock: LockMode::Try,
            charge: ChargeMode::Immediate,
        }
    }
}

/// The result of visiting one entry of a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// A read was issued and added to the request's in-flight reads.
    Issued,
    /// The entry was skipped.
    Skipped,
}

/// Visit the next entry of `request`, issuing a read if it refers to an evicted page that is not
/// cached and not being fetched. Returns `None` once the window is exhausted.
pub(crate) async fn step<E: Clock, T: Transport>(
    coordinator: &Coordinator<E, T>,
    request: &mut PrefetchRequest,
    lock: LockMode,
    charge: ChargeMode,
) -> Option<Step> {
    let (index, pte) = request.advance()?;
    if request.offset == Some(index) {
        return Some(Step::Skipped);
    }
    let Some(slot) = pte.slot() else {
        trace!(index, ?pte, "skipping entry");
        return Some(Step::Skipped);
    };
    let fetch = Request {
        channel: request.channel,
        lock,
        charge,
        speculative: false,
        owner: request.owner,
        address: request.address_of(index),
        alloc: request.alloc,
        flags: Flags::PREFETCHED,
    };
    match coordinator.claim(slot, &fetch).await {
        Ok(Claim::Issued(fetch)) => {
            request.inflight.push(fetch);
            Some(Step::Issued)
        }
        Ok(claim) => {
            trace!(%slot, ?claim, "not prefetching");
            Some(Step::Skipped)
        }
        Err(err) => {
            debug!(%slot, ?err, "prefetch failed");
            Some(Step::Skipped)
        }
    }
}
