use super::{
    state::{HITS_MAX, INITIAL_HITS},
    window::next_window,
};
use std::{
    ops::RangeInclusive,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

/// Engine-wide readahead state for slot-locality (cluster) readahead.
#[derive(Debug)]
pub struct ClusterState {
    prev_offset: AtomicU64,
    last_window: AtomicU32,
    hits: AtomicU32,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            prev_offset: AtomicU64::new(0),
            last_window: AtomicU32::new(0),
            hits: AtomicU32::new(INITIAL_HITS),
        }
    }
}

impl ClusterState {
    /// Count a readahead hit.
    pub fn record_hit(&self) {
        let _ = self
            .hits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |hits| {
                Some((hits + 1).min(HITS_MAX))
            });
    }

    /// The hits recorded since the last window.
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Acquire)
    }

    /// Compute the window for a fault at `offset`, consuming the recorded hits. A `fixed` window
    /// replaces the computed one.
    ///
    /// `prev_offset` only moves when no hits were recorded, so a run of hits keeps being compared
    /// against the fault that started it.
    pub fn next(&self, offset: u64, max_window: u32, fixed: Option<u32>) -> u32 {
        let hits = self.hits.swap(0, Ordering::AcqRel);
        let window = fixed.unwrap_or_else(|| {
            next_window(
                self.prev_offset.load(Ordering::Acquire),
                offset,
                hits,
                max_window,
                self.last_window.load(Ordering::Acquire),
            )
        });
        if hits == 0 {
            self.prev_offset.store(offset, Ordering::Release);
        }
        self.last_window.store(window, Ordering::Release);
        window
    }
}

/// The `window`-aligned block of offsets holding `offset` on a device of `capacity` slots.
///
/// Offset 0 holds the backing store's header and is never included. Returns `None` if the block
/// is empty after clamping.
pub fn cluster_range(offset: u64, window: u32, capacity: u64) -> Option<RangeInclusive<u64>> {
    let mask = window.max(1).next_power_of_two() as u64 - 1;
    let start = (offset & !mask).max(1);
    let end = (offset | mask).min(capacity.checked_sub(1)?);
    (start <= end).then_some(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_credit_then_consumed() {
        let state = ClusterState::default();
        assert_eq!(state.hits(), INITIAL_HITS);

        // 4 hits + 2 rounds to 8
        assert_eq!(state.next(100, 8, None), 8);
        assert_eq!(state.hits(), 0);

        // No hits, not adjacent to the fault that last moved prev_offset (0), half of 8
        assert_eq!(state.next(200, 8, None), 4);

        // No hits, adjacent to 200
        assert_eq!(state.next(201, 8, None), 2);
    }

    #[test]
    fn test_hits_keep_prev_offset() {
        let state = ClusterState::default();
        state.next(50, 8, None);
        state.next(10, 8, None);
        state.next(300, 8, None);
        state.next(500, 8, None);

        // prev_offset is now 500; a hit run does not move it
        state.record_hit();
        assert_eq!(state.next(900, 2, None), 2);
        assert_eq!(state.next(501, 2, None), 2);

        // Without hits prev_offset follows the fault
        assert_eq!(state.next(900, 2, None), 1);

        // A fixed window still consumes hits
        state.record_hit();
        assert_eq!(state.next(77, 2, Some(6)), 6);
        assert_eq!(state.hits(), 0);
    }

    #[test]
    fn test_cluster_range() {
        // Aligned block around the fault
        assert_eq!(cluster_range(13, 8, 100), Some(8..=15));

        // Header slot is skipped
        assert_eq!(cluster_range(3, 8, 100), Some(1..=7));

        // Clamped to capacity
        assert_eq!(cluster_range(97, 8, 100), Some(96..=99));

        // Non power-of-two windows round up
        assert_eq!(cluster_range(13, 5, 100), Some(8..=15));

        // Nothing to read
        assert_eq!(cluster_range(0, 1, 100), None);
        assert_eq!(cluster_range(0, 1, 0), None);
    }
}
