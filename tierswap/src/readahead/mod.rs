//! Decide how many (and which) neighbors of a faulting slot to read ahead.
//!
//! Two strategies share the window formula in [next_window]:
//!
//! - [Strategy::Virtual] follows locality in the faulting process's address space. Each [Region]
//!   (and each [AccessDomain] a fault declares) tracks the last fault, the window computed for it
//!   and the readahead hits seen since. The window is placed around the fault in the direction of
//!   the access pattern and the page-table entries it covers are captured for draining.
//! - [Strategy::Cluster] follows locality in the backing store. A single engine-wide state is used
//!   and the window is the aligned block of slots holding the faulting slot.
//!
//! # Window Placement
//!
//! A window of `w` pages for a fault at page `f` whose predecessor faulted at page `p` covers:
//!
//! ```txt
//! f == p + 1 (or always_ascend): [f, f + w)
//! p == f + 1:                    [f - w + 1, f + 1)
//! otherwise:                     [f - (w - 1) / 2, f + w - (w - 1) / 2)
//! ```
//!
//! and is clamped to the region and to the aligned span of `clamp_pages` pages holding `f`.

use crate::{cache::PageHandle, Slot};
use commonware_runtime::Metrics as RuntimeMetrics;
use std::sync::Arc;
use tracing::trace;

mod cluster;
pub use cluster::{cluster_range, ClusterState};
mod metrics;
mod region;
pub use region::{AccessDomain, PageTable, Pattern, Pte, Region};
mod request;
pub use request::PrefetchRequest;
mod state;
pub use state::{ReadaheadInfo, ReadaheadState, HITS_MAX, INITIAL_HITS};
mod window;
pub use window::next_window;

/// The largest page-cluster order honored by virtual readahead.
const ORDER_CEILING: u32 = 5;

/// Which kind of locality readahead follows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Neighbors in the faulting region's address space.
    #[default]
    Virtual,
    /// Neighbors in the backing store.
    Cluster,
}

/// Configuration for [Readahead].
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// The size of a page in bytes (a power of two).
    pub page_size: u64,

    /// Log2 of the largest window.
    pub page_cluster: u32,

    /// Use this window instead of the computed one.
    pub fixed_window: Option<u32>,

    /// The kind of locality to follow.
    pub strategy: Strategy,

    /// Hits credited to a [Pattern::Sequential] domain before the window is computed.
    pub sequential_boost: u32,

    /// The largest window of a [Pattern::Sequential] domain.
    pub sequential_max_window: u32,

    /// Windows never cross an aligned span of this many pages.
    pub clamp_pages: u64,

    /// Always place the window after the fault.
    pub always_ascend: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            page_cluster: 3,
            fixed_window: None,
            strategy: Strategy::Virtual,
            sequential_boost: 4,
            sequential_max_window: 32,
            clamp_pages: 512,
            always_ascend: false,
        }
    }
}

impl Config {
    /// Panics if the configuration is not usable.
    pub fn assert(&self) {
        assert!(self.page_size.is_power_of_two(), "page_size must be a power of two");
        assert!(self.page_cluster <= 10, "page_cluster too large");
        assert!(self.clamp_pages > 0, "clamp_pages must be positive");
        assert!(
            self.sequential_max_window > 0 && self.sequential_max_window <= 1 << 10,
            "sequential_max_window out of range"
        );
        if let Some(window) = self.fixed_window {
            assert!(window > 0 && window <= 1 << 10, "fixed_window out of range");
        }
    }
}

/// The slots chosen for readahead around one fault.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    /// The computed window.
    pub window: u32,

    /// The address of the first entry.
    pub base: u64,

    /// The address increment between consecutive entries.
    pub stride: u64,

    /// The index of the faulting entry.
    pub offset: Option<usize>,

    /// The captured entries.
    pub entries: Vec<Pte>,
}

/// Computes readahead windows and keeps the hit accounting they depend on.
#[derive(Clone)]
pub struct Readahead {
    cfg: Config,
    cluster: Arc<ClusterState>,
    metrics: Arc<metrics::Metrics>,
}

impl Readahead {
    /// Create a new policy.
    ///
    /// # Panics
    ///
    /// Panics if `cfg` is invalid (see [Config::assert]).
    pub fn new<E: RuntimeMetrics>(context: E, cfg: Config) -> Self {
        cfg.assert();
        Self {
            cfg,
            cluster: Arc::new(ClusterState::default()),
            metrics: Arc::new(metrics::Metrics::init(context)),
        }
    }

    /// The configured strategy.
    pub fn strategy(&self) -> Strategy {
        self.cfg.strategy
    }

    /// The engine-wide state used by [Strategy::Cluster].
    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    /// The largest window virtual readahead will compute.
    pub fn max_window(&self) -> u32 {
        1 << self.cfg.page_cluster.min(ORDER_CEILING)
    }

    fn vpn(&self, address: u64) -> u64 {
        address / self.cfg.page_size
    }

    fn size(&self, prev: u64, vpn: u64, hits: u32, max: u32, prev_window: u32) -> u32 {
        self.cfg
            .fixed_window
            .unwrap_or_else(|| next_window(prev, vpn, hits, max, prev_window))
    }

    fn record(&self, window: u32) {
        self.metrics.windows.inc();
        self.metrics.window.set(window as i64);
    }

    /// Account for a cache hit on `handle` at `address`.
    ///
    /// Test-and-clears the entry's readahead flag. The region's state (in virtual mode) or the
    /// engine-wide state (in cluster mode) and the domain's state (if any) are credited when the
    /// flag was set.
    pub fn touch(
        &self,
        handle: &PageHandle,
        region: Option<&Region>,
        domain: Option<&AccessDomain>,
        address: u64,
    ) -> bool {
        let readahead = handle.take_readahead();
        let vpn = self.vpn(address);
        match (self.cfg.strategy, region) {
            (Strategy::Virtual, Some(region)) => {
                region.state().touch(vpn, readahead);
            }
            _ => {
                if readahead {
                    self.cluster.record_hit();
                }
            }
        }
        if let Some(domain) = domain {
            domain.state().touch(vpn, readahead);
        }
        if readahead {
            self.metrics.readahead_hits.inc();
            trace!(slot = %handle.slot(), address, "readahead hit");
        }
        readahead
    }

    /// Compute the window for a fault at `address` in `region` and capture its entries.
    ///
    /// Returns `None` if the window has a single page. The state of the region (and domain) is
    /// reset to the new window either way, unless readahead is disabled altogether.
    pub fn plan(
        &self,
        region: &Region,
        domain: Option<&AccessDomain>,
        address: u64,
    ) -> Option<Plan> {
        let max = self.max_window();
        if max == 1 {
            return None;
        }
        let fvpn = self.vpn(address);
        let (prev, window) = match domain {
            Some(domain) => {
                let info = domain.state().load();
                let window = match domain.pattern() {
                    Pattern::Sequential => self.size(
                        info.vpn,
                        fvpn,
                        info.hits.saturating_add(self.cfg.sequential_boost),
                        self.cfg.sequential_max_window,
                        info.window,
                    ),
                    Pattern::Random => 1,
                    Pattern::Default => self.size(info.vpn, fvpn, info.hits, max, info.window),
                };
                domain.state().reset(fvpn, window);
                (info.vpn, window)
            }
            None => {
                let info = region.state().load();
                let window = self.size(info.vpn, fvpn, info.hits, max, info.window);
                (info.vpn, window)
            }
        };
        region.state().reset(fvpn, window);
        self.record(window);
        if window == 1 {
            return None;
        }

        // Place the window in the direction of travel
        let win = window as u64;
        let (lo, hi) = if self.cfg.always_ascend || fvpn == prev.wrapping_add(1) {
            (fvpn, fvpn + win)
        } else if prev == fvpn + 1 {
            ((fvpn + 1).saturating_sub(win), fvpn + 1)
        } else {
            let left = (win - 1) / 2;
            (fvpn.saturating_sub(left), fvpn + win - left)
        };

        // Clamp to the region and the aligned span holding the fault
        let span = fvpn - fvpn % self.cfg.clamp_pages;
        let start = lo.max(self.vpn(region.start())).max(span);
        let end = hi
            .min(self.vpn(region.end()))
            .min(span + self.cfg.clamp_pages);
        if end <= start + 1 {
            return None;
        }
        let offset = (start..end)
            .contains(&fvpn)
            .then(|| (fvpn - start) as usize);
        let entries = region.table().capture(start, end);
        trace!(window, start, end, "planned virtual readahead");
        Some(Plan {
            window,
            base: start * self.cfg.page_size,
            stride: self.cfg.page_size,
            offset,
            entries,
        })
    }

    /// Compute the window for a fault on `slot` (on a device with `capacity` slots) using the
    /// engine-wide state, and list the slots of the aligned block holding it.
    ///
    /// Returns `None` if the window has a single page.
    pub fn plan_cluster(&self, slot: Slot, capacity: u64, address: u64) -> Option<Plan> {
        let max = 1u32 << self.cfg.page_cluster;
        if max <= 1 {
            return None;
        }
        let window = self.cluster.next(slot.offset, max, self.cfg.fixed_window);
        self.record(window);
        if window == 1 {
            return None;
        }
        let range = cluster_range(slot.offset, window, capacity)?;
        let start = *range.start();
        let offset = range
            .contains(&slot.offset)
            .then(|| (slot.offset - start) as usize);
        let entries = range.map(|offset| Pte::Swapped(slot.with_offset(offset))).collect();
        trace!(window, %slot, "planned cluster readahead");
        Some(Plan {
            window,
            base: address,
            stride: 0,
            offset,
            entries,
        })
    }
}
