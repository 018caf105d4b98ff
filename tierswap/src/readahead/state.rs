use std::sync::atomic::{AtomicU64, Ordering};

/// The maximum number of hits tracked.
pub const HITS_MAX: u32 = 63;

/// The hit credit of state that was never written.
pub const INITIAL_HITS: u32 = 4;

const HITS_BITS: u32 = 6;
const WINDOW_BITS: u32 = 11;
const HITS_MASK: u64 = (1 << HITS_BITS) - 1;
const WINDOW_MASK: u64 = (1 << WINDOW_BITS) - 1;
const VPN_SHIFT: u32 = HITS_BITS + WINDOW_BITS;

/// The last fault of an access domain, the window computed for it and the readahead hits seen
/// since.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadaheadInfo {
    /// Virtual page number of the last fault that computed a window.
    pub vpn: u64,

    /// The window computed for that fault.
    pub window: u32,

    /// Readahead hits since.
    pub hits: u32,
}

impl ReadaheadInfo {
    fn pack(&self) -> u64 {
        (self.vpn << VPN_SHIFT)
            | ((self.window as u64 & WINDOW_MASK) << HITS_BITS)
            | (self.hits.min(HITS_MAX) as u64 & HITS_MASK)
    }

    fn unpack(raw: u64) -> Self {
        if raw == 0 {
            return Self {
                vpn: 0,
                window: 0,
                hits: INITIAL_HITS,
            };
        }
        Self {
            vpn: raw >> VPN_SHIFT,
            window: ((raw >> HITS_BITS) & WINDOW_MASK) as u32,
            hits: (raw & HITS_MASK) as u32,
        }
    }
}

/// A [ReadaheadInfo] packed into a single word.
///
/// Updates are plain atomic read-modify-writes. Concurrent faults in the same domain may overwrite
/// each other's updates.
#[derive(Debug, Default)]
pub struct ReadaheadState(AtomicU64);

impl ReadaheadState {
    /// Read the current state.
    pub fn load(&self) -> ReadaheadInfo {
        ReadaheadInfo::unpack(self.0.load(Ordering::Acquire))
    }

    /// Replace the current state.
    pub fn store(&self, info: ReadaheadInfo) {
        self.0.store(info.pack(), Ordering::Release);
    }

    /// Start a new window at `vpn`, clearing the hit count.
    pub fn reset(&self, vpn: u64, window: u32) {
        self.store(ReadaheadInfo {
            vpn,
            window,
            hits: 0,
        });
    }

    /// Record a cache hit at `vpn`, counting it if the entry was read ahead. Returns the new hit
    /// count.
    pub fn touch(&self, vpn: u64, readahead: bool) -> u32 {
        let mut hits = 0;
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let mut info = ReadaheadInfo::unpack(raw);
                if readahead {
                    info.hits = (info.hits + 1).min(HITS_MAX);
                }
                info.vpn = vpn;
                hits = info.hits;
                Some(info.pack())
            });
        hits
    }
}
