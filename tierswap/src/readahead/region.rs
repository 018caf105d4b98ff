use super::state::ReadaheadState;
use crate::{Owner, Slot};
use std::sync::Arc;

/// A captured page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pte {
    /// Nothing is mapped.
    None,
    /// The page is resident.
    Present,
    /// The page was evicted to `Slot`.
    Swapped(Slot),
    /// A non-swap entry (e.g. a migration or device entry).
    Special,
}

impl Pte {
    /// The backing slot of an evicted page.
    pub fn slot(&self) -> Option<Slot> {
        match self {
            Self::Swapped(slot) => Some(*slot),
            _ => None,
        }
    }
}

/// Provides a snapshot of the page table of a region.
pub trait PageTable: Send + Sync + 'static {
    /// Copy the entries for virtual pages `[start_vpn, end_vpn)`.
    ///
    /// The returned vector must have exactly `end_vpn - start_vpn` entries.
    fn capture(&self, start_vpn: u64, end_vpn: u64) -> Vec<Pte>;
}

/// A mapped range of virtual memory (e.g. one memory mapping of a process).
pub struct Region {
    start: u64,
    end: u64,
    owner: Owner,
    state: ReadaheadState,
    table: Arc<dyn PageTable>,
}

impl Region {
    /// Create a region spanning the byte addresses `[start, end)`.
    ///
    /// # Panics
    ///
    /// Panics if `start >= end`.
    pub fn new(start: u64, end: u64, owner: Owner, table: Arc<dyn PageTable>) -> Self {
        assert!(start < end, "empty region");
        Self {
            start,
            end,
            owner,
            state: ReadaheadState::default(),
            table,
        }
    }

    /// The first byte address of the region.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte address of the region.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Returns `true` if `address` falls within the region.
    pub fn contains(&self, address: u64) -> bool {
        (self.start..self.end).contains(&address)
    }

    /// The owner pages fetched for this region are charged against.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    /// Readahead state of the region.
    pub fn state(&self) -> &ReadaheadState {
        &self.state
    }

    /// The page table backing the region.
    pub fn table(&self) -> &Arc<dyn PageTable> {
        &self.table
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("start", &format_args!("{:#x}", self.start))
            .field("end", &format_args!("{:#x}", self.end))
            .field("owner", &self.owner)
            .field("state", &self.state.load())
            .finish()
    }
}

/// The declared access pattern of an [AccessDomain].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Pattern {
    /// No declared pattern. The window follows the hit history.
    #[default]
    Default,
    /// Sequential or streaming access. The window grows eagerly.
    Sequential,
    /// Random access. No readahead.
    Random,
}

/// An explicitly declared access-pattern context with its own readahead state.
///
/// When a fault carries a domain, the domain's state (rather than the region's) drives the window.
#[derive(Debug, Default)]
pub struct AccessDomain {
    pattern: Pattern,
    state: ReadaheadState,
}

impl AccessDomain {
    /// Create a domain with the given pattern.
    pub fn new(pattern: Pattern) -> Self {
        Self {
            pattern,
            state: ReadaheadState::default(),
        }
    }

    /// The declared pattern.
    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    /// Readahead state of the domain.
    pub fn state(&self) -> &ReadaheadState {
        &self.state
    }
}
