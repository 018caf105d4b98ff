//! A concurrent map from backing-store [Slot] to the resident page that backs it.
//!
//! The [SlotCache] knows nothing about how pages are fetched. It only guarantees that at most one
//! [CacheEntry] exists per [Slot]: an insert that finds an existing entry is rejected with
//! [Error::AlreadyPresent], which always indicates a bug in the caller's reservation protocol
//! (see [crate::fetch]) and is logged as such.
//!
//! # Address Spaces
//!
//! Each backing device must be registered with [SlotCache::open] before use and unregistered with
//! [SlotCache::close] once it is detached. Closing a device that still has live entries leaks
//! them, so it is refused with [Error::LiveEntries] (the device stays registered so the caller can
//! remove the remaining entries and retry).
//!
//! # Sharding
//!
//! The slots of a device are partitioned into segments of `segment_pages` consecutive offsets, each
//! behind its own lock. Mutating one slot never blocks lookups of slots in other segments. Segments
//! are allocated eagerly when the device is opened, so memory overhead is one (empty) map per
//! `segment_pages` slots of capacity plus one entry per resident page.
//!
//! # Handles
//!
//! [SlotCache::lookup] returns a [PageHandle] (a new reference to the entry). The handle keeps the
//! page alive even if the entry is removed afterwards.
//!
//! # Example
//!
//! ```rust
//! use commonware_runtime::{deterministic, Runner};
//! use tierswap::{cache::{Flags, SlotCache}, page::Page, Slot};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     // Create a cache and register a device with 1024 slots
//!     let cache = SlotCache::new(context, 512, None);
//!     cache.open(0, 1024).unwrap();
//!
//!     // Insert a page
//!     let page = Page::zeroed(8);
//!     page.fill(b"resident");
//!     cache.insert(Slot::new(0, 7), page, Flags::default()).unwrap();
//!
//!     // Look it up
//!     let handle = cache.lookup(Slot::new(0, 7)).unwrap();
//!     assert_eq!(handle.bytes().as_ref(), b"resident");
//!
//!     // Remove it and close the device
//!     cache.remove(Slot::new(0, 7)).unwrap();
//!     cache.close(0).unwrap();
//! });
//! ```

use crate::{page::Page, Slot};
use bytes::Bytes;
use commonware_runtime::Metrics as RuntimeMetrics;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, RwLock,
    },
};
use thiserror::Error;
use tracing::{debug, error, warn};

mod metrics;
mod space;
use space::AddressSpace;

/// Errors that can occur when interacting with the [SlotCache].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("slot already present: {0}")]
    AlreadyPresent(Slot),
    #[error("slot not present: {0}")]
    NotPresent(Slot),
    #[error("unknown device: {0}")]
    UnknownDevice(u32),
    #[error("device already open: {0}")]
    DeviceExists(u32),
    #[error("slot out of range: {0}")]
    OutOfRange(Slot),
    #[error("cache full")]
    Full,
    #[error("device {0} closed with {1} live entries")]
    LiveEntries(u32, usize),
}

impl Error {
    /// Returns `true` if the error signals a violated caller contract rather than a runtime
    /// condition.
    pub fn is_violation(&self) -> bool {
        matches!(self, Self::AlreadyPresent(_) | Self::LiveEntries(..))
    }
}

/// Flags recorded on an entry at insertion time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// The entry was inserted speculatively and has not yet been touched by a fault.
    pub readahead: bool,

    /// The entry was inserted by the prefetch path.
    pub prefetch: bool,
}

impl Flags {
    /// Flags for an entry brought in by readahead.
    pub const PREFETCHED: Self = Self {
        readahead: true,
        prefetch: true,
    };
}

/// One resident page plus its metadata.
pub struct CacheEntry {
    slot: Slot,
    page: Page,
    readahead: AtomicBool,
    prefetch: bool,
}

/// A reference to a [CacheEntry].
#[derive(Clone)]
pub struct PageHandle {
    entry: Arc<CacheEntry>,
}

impl PageHandle {
    fn new(slot: Slot, page: Page, flags: Flags) -> Self {
        Self {
            entry: Arc::new(CacheEntry {
                slot,
                page,
                readahead: AtomicBool::new(flags.readahead),
                prefetch: flags.prefetch,
            }),
        }
    }

    /// The slot this entry caches.
    pub fn slot(&self) -> Slot {
        self.entry.slot
    }

    /// The cached page.
    pub fn page(&self) -> &Page {
        &self.entry.page
    }

    /// A copy of the cached page contents.
    pub fn bytes(&self) -> Bytes {
        self.entry.page.bytes()
    }

    /// Returns `true` if the page holds valid data.
    pub fn is_resident(&self) -> bool {
        self.entry.page.is_resident()
    }

    /// Returns `true` if the entry was inserted by the prefetch path.
    pub fn is_prefetch(&self) -> bool {
        self.entry.prefetch
    }

    /// Returns `true` if the entry has not been touched since it was read ahead.
    pub fn is_readahead(&self) -> bool {
        self.entry.readahead.load(Ordering::Acquire)
    }

    /// Clear the readahead flag, returning whether it was set.
    ///
    /// Exactly one caller observes `true` for each readahead insertion.
    pub fn take_readahead(&self) -> bool {
        self.entry.readahead.swap(false, Ordering::AcqRel)
    }

    /// Returns `true` if both handles refer to the same entry.
    pub fn same(&self, other: &PageHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl std::fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageHandle")
            .field("slot", &self.entry.slot)
            .field("prefetch", &self.entry.prefetch)
            .field("readahead", &self.is_readahead())
            .finish()
    }
}

/// A sharded, per-device map from [Slot] to [CacheEntry] that can be shared across tasks via
/// cloning.
#[derive(Clone)]
pub struct SlotCache {
    /// Registered devices, keyed by device id.
    spaces: Arc<RwLock<HashMap<u32, Arc<AddressSpace>>>>,

    /// The number of consecutive offsets covered by each segment.
    segment_pages: u64,

    /// The maximum number of entries across all devices.
    max_entries: usize,

    /// The number of entries across all devices.
    entries: Arc<AtomicUsize>,

    metrics: Arc<metrics::Metrics>,
}

impl SlotCache {
    /// Create a new cache whose devices are split into segments of `segment_pages` slots. If
    /// `max_entries` is set, inserts beyond that many live entries fail with [Error::Full].
    ///
    /// # Panics
    ///
    /// Panics if `segment_pages` is 0.
    pub fn new<E: RuntimeMetrics>(context: E, segment_pages: u64, max_entries: Option<usize>) -> Self {
        assert!(segment_pages > 0);
        Self {
            spaces: Arc::new(RwLock::new(HashMap::new())),
            segment_pages,
            max_entries: max_entries.unwrap_or(usize::MAX),
            entries: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(metrics::Metrics::init(context)),
        }
    }

    fn space(&self, device: u32) -> Option<Arc<AddressSpace>> {
        self.spaces.read().unwrap().get(&device).cloned()
    }

    /// Register `device` with room for `capacity` slots.
    pub fn open(&self, device: u32, capacity: u64) -> Result<(), Error> {
        let mut spaces = self.spaces.write().unwrap();
        if spaces.contains_key(&device) {
            return Err(Error::DeviceExists(device));
        }
        let space = AddressSpace::new(device, capacity, self.segment_pages);
        spaces.insert(device, Arc::new(space));
        debug!(device, capacity, "opened address space");
        Ok(())
    }

    /// Unregister `device`.
    ///
    /// Fails with [Error::LiveEntries] (leaving the device registered) if any entry is still
    /// resident.
    pub fn close(&self, device: u32) -> Result<(), Error> {
        let mut spaces = self.spaces.write().unwrap();
        let space = spaces.get(&device).ok_or(Error::UnknownDevice(device))?;
        let live = space.live();
        if live > 0 {
            warn!(device, live, "refusing to close address space with live entries");
            return Err(Error::LiveEntries(device, live));
        }
        spaces.remove(&device);
        debug!(device, "closed address space");
        Ok(())
    }

    /// The number of slots `device` was opened with.
    pub fn capacity(&self, device: u32) -> Option<u64> {
        self.space(device).map(|space| space.capacity())
    }

    /// Insert `page` for `slot`, returning a handle to the new entry.
    pub fn insert(&self, slot: Slot, page: Page, flags: Flags) -> Result<PageHandle, Error> {
        // The registry stays read-locked until the entry is counted, so `close` cannot miss it
        let spaces = self.spaces.read().unwrap();
        let space = spaces
            .get(&slot.device)
            .ok_or(Error::UnknownDevice(slot.device))?;
        let handle = PageHandle::new(slot, page, flags);
        let result = space.insert(handle.clone(), || {
            self.entries
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    (n < self.max_entries).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| Error::Full)
        });
        match result {
            Ok(()) => {
                self.metrics.inserts.inc();
                self.metrics.entries.inc();
                Ok(handle)
            }
            Err(err @ Error::AlreadyPresent(_)) => {
                error!(%slot, "double insert into slot cache");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Look up the entry for `slot`.
    pub fn lookup(&self, slot: Slot) -> Option<PageHandle> {
        self.metrics.lookups.inc();
        let handle = self.space(slot.device)?.get(slot)?;
        self.metrics.hits.inc();
        Some(handle)
    }

    /// Returns `true` if an entry exists for `slot`.
    pub fn contains(&self, slot: Slot) -> bool {
        self.space(slot.device)
            .and_then(|space| space.get(slot))
            .is_some()
    }

    /// Remove the entry for `slot`, returning it.
    pub fn remove(&self, slot: Slot) -> Result<PageHandle, Error> {
        let spaces = self.spaces.read().unwrap();
        let space = spaces
            .get(&slot.device)
            .ok_or(Error::UnknownDevice(slot.device))?;
        let handle = space.remove(slot)?;
        self.entries.fetch_sub(1, Ordering::AcqRel);
        self.metrics.removes.inc();
        self.metrics.entries.dec();
        Ok(handle)
    }

    /// The number of live entries for `device`.
    pub fn live(&self, device: u32) -> usize {
        self.space(device).map(|space| space.live()).unwrap_or(0)
    }

    /// The number of live entries across all devices.
    pub fn len(&self) -> usize {
        self.entries.load(Ordering::Acquire)
    }

    /// Returns `true` if no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The ids of all registered devices.
    pub fn devices(&self) -> Vec<u32> {
        let spaces = self.spaces.read().unwrap();
        let mut devices: Vec<_> = spaces.values().map(|space| space.device()).collect();
        devices.sort_unstable();
        devices
    }
}
