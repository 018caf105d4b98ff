//! Fetch evicted pages from a remote tier with single-fetcher coordination and adaptive readahead.
//!
//! When a process touches memory that was evicted to a slower (often remote) tier, the host asks
//! this crate for the page backing the faulting [Slot]. The crate guarantees that concurrent faults
//! on the same slot cooperate (at most one fetch is ever in flight per slot), overlaps the fetch
//! latency with speculative reads of neighboring slots, and sizes that speculation from recent
//! readahead hits.
//!
//! # Components
//!
//! - [cache::SlotCache]: sharded map from [Slot] to the resident page backing it.
//! - [fetch::Coordinator]: turns a cache miss into exactly one fetch using per-slot reservations.
//! - [dispatch::Dispatcher]: issues reads through an injected [dispatch::Transport] and polls
//!   their completion queues.
//! - [readahead]: computes how many (and which) neighboring slots to prefetch.
//! - [worker::Actor]: drains prefetch requests in the background.
//! - [Engine]: wires the above together and exposes the host entry points.
//!
//! # Status
//!
//! `tierswap` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::fmt;
use thiserror::Error;

pub mod cache;
pub mod dispatch;
pub mod fetch;
pub mod page;
pub mod readahead;
pub mod worker;

mod engine;
pub use engine::{Config, Engine, Fault, Handoff, Host};

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// A unit of backing-store capacity holding one page worth of evicted data.
///
/// A slot is stable for the lifetime of the backing allocation and is never reused while a live
/// cache entry references it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    /// The backing device the slot lives on.
    pub device: u32,

    /// The offset (in pages) of the slot within its device.
    pub offset: u64,
}

impl Slot {
    /// Create a new slot.
    pub const fn new(device: u32, offset: u64) -> Self {
        Self { device, offset }
    }

    /// Returns the slot at `offset` on the same device.
    pub const fn with_offset(&self, offset: u64) -> Self {
        Self {
            device: self.device,
            offset,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device, self.offset)
    }
}

/// Identifies the owner (e.g. an address space or accounting group) that fetched pages are
/// charged against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Owner(pub u64);

/// Allocation flags forwarded to the [page::PageAllocator] and the [OwnerCharge] hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocFlags {
    /// The page may be migrated by the host after allocation.
    pub movable: bool,

    /// The allocation (or charge) must not fail for want of reclaim.
    pub atomic: bool,
}

impl AllocFlags {
    /// Flags used for user pages brought in by a fault.
    pub const USER: Self = Self {
        movable: true,
        atomic: false,
    };

    /// Flags used to force-charge a batch of already fetched pages.
    pub const ATOMIC: Self = Self {
        movable: false,
        atomic: true,
    };
}

/// Errors that can occur when resolving a slot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(cache::Error),
    #[error("invariant violation: {0}")]
    InvariantViolation(cache::Error),
    #[error("page allocation failed")]
    AllocationFailed,
    #[error("transport failed: {0}")]
    TransportFailed(Slot),
    #[error("owner charge failed: {0}")]
    ChargeFailed(Slot),
}

impl From<cache::Error> for Error {
    fn from(err: cache::Error) -> Self {
        if err.is_violation() {
            Self::InvariantViolation(err)
        } else {
            Self::Cache(err)
        }
    }
}

/// Reports whether a slot still holds live data.
pub trait UsageOracle: Send + Sync + 'static {
    /// Returns `true` if `slot` has no remaining references and no pending writers.
    ///
    /// Fetches of unused slots are skipped, which prevents spurious reads from racing a concurrent
    /// teardown of the backing allocation.
    fn is_unused(&self, slot: Slot) -> bool;
}

/// Charges fetched pages against their owner.
pub trait OwnerCharge: Send + Sync + 'static {
    /// Charge a single page.
    fn charge(&self, page: &page::Page, owner: Owner, flags: AllocFlags) -> Result<(), ChargeError>;

    /// Charge a batch of pages at once.
    ///
    /// Failure is reported but never unwinds fetches that were already issued.
    fn charge_batch(
        &self,
        pages: &[page::Page],
        owner: Owner,
        flags: AllocFlags,
    ) -> Result<(), ChargeError> {
        for page in pages {
            self.charge(page, owner, flags)?;
        }
        Ok(())
    }
}

/// Error returned by an [OwnerCharge] hook.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("owner {0:?} over limit")]
pub struct ChargeError(pub Owner);

/// An [OwnerCharge] that accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unmetered;

impl OwnerCharge for Unmetered {
    fn charge(&self, _: &page::Page, _: Owner, _: AllocFlags) -> Result<(), ChargeError> {
        Ok(())
    }
}
