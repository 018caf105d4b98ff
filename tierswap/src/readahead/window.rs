/// Compute the width of the next readahead window.
///
/// The base width is `hits + 2`. With no recent hits the window collapses to 1 unless `offset` is
/// adjacent to `prev_offset`. Otherwise the width is rounded up to a power of two of at least 4.
/// The result is clamped to `max_window` and never falls below half of `prev_window`.
pub fn next_window(
    prev_offset: u64,
    offset: u64,
    hits: u32,
    max_window: u32,
    prev_window: u32,
) -> u32 {
    let mut pages = hits.saturating_add(2);
    if pages == 2 {
        if offset.abs_diff(prev_offset) != 1 {
            pages = 1;
        }
    } else {
        pages = pages.checked_next_power_of_two().unwrap_or(u32::MAX).max(4);
    }
    pages = pages.min(max_window);

    // Don't shrink too fast
    pages.max(prev_window / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(100, 250, 0, 16, 1 => 1; "random single access")]
    #[test_case(100, 101, 0, 16, 0 => 2; "adjacent ascending")]
    #[test_case(101, 100, 0, 16, 0 => 2; "adjacent descending")]
    #[test_case(0, 9, 1, 16, 0 => 4; "one hit rounds to four")]
    #[test_case(0, 9, 3, 16, 0 => 8; "five rounds to eight")]
    #[test_case(0, 9, 6, 16, 0 => 8; "eight stays eight")]
    #[test_case(0, 9, 63, 16, 0 => 16; "clamped to max")]
    #[test_case(0, 9, 63, 1, 0 => 1; "max of one")]
    #[test_case(100, 250, 0, 16, 16 => 8; "shrinks by half at most")]
    #[test_case(100, 250, 0, 16, 3 => 1; "half of three rounds down")]
    #[test_case(0, 9, 4, 32, 0 => 8; "initial credit")]
    #[test_case(0, 9, u32::MAX, 32, 0 => 32; "saturated hits")]
    fn test_next_window(prev: u64, offset: u64, hits: u32, max: u32, prev_window: u32) -> u32 {
        next_window(prev, offset, hits, max, prev_window)
    }

    #[test]
    fn test_monotonic_until_saturation() {
        // Adjacent accesses with a growing hit count
        let mut prev_window = 0;
        let mut offset = 1000;
        for hits in 0..20 {
            let window = next_window(offset, offset + 1, hits, 16, prev_window);
            assert!(window >= prev_window, "window shrank at hits={hits}");
            assert!(window <= 16);
            prev_window = window;
            offset += 1;
        }
        assert_eq!(prev_window, 16);

        // A single step without hits falls back to half the previous window
        let window = next_window(offset, offset + 50, 0, 16, prev_window);
        assert_eq!(window, prev_window / 2);
    }
}
