//! Buffer view.
//!
//! Pure computation over the media element's buffered ranges: given a probe
//! position, how much contiguous media lies ahead of it, tolerating small
//! holes between ranges.

use crate::media::TimeRanges;

/// The buffered region ahead of a probe position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    /// Start of the contiguous run containing (or just past) the probe
    pub start: f64,
    /// Far boundary of the run, after merging across tolerated holes
    pub end: f64,
    /// Seconds of media ahead of the probe
    pub len: f64,
    /// Start of the next buffered range past the run, when one exists
    pub next_start: Option<f64>,
}

impl BufferInfo {
    fn empty(pos: f64, next_start: Option<f64>) -> Self {
        Self {
            start: pos,
            end: pos,
            len: 0.0,
            next_start,
        }
    }
}

/// Compute the buffered region ahead of `pos`.
///
/// Successive ranges separated by gaps of at most `max_hole` seconds are
/// merged into one run. A run whose start lies within `max_hole` after `pos`
/// counts as containing it. `len` measures from `pos`, or from the run start
/// when the run begins past the probe.
pub fn buffer_info(buffered: &TimeRanges, pos: f64, max_hole: f64) -> BufferInfo {
    let ranges = buffered.as_slice();
    if ranges.is_empty() {
        return BufferInfo::empty(pos, None);
    }

    // Merge ranges separated by holes <= max_hole.
    let mut merged: Vec<(f64, f64)> = Vec::with_capacity(ranges.len());
    for &(start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start - last.1 <= max_hole => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    for (i, &(start, end)) in merged.iter().enumerate() {
        if pos + max_hole >= start && pos < end {
            let effective = pos.max(start);
            return BufferInfo {
                start,
                end,
                len: end - effective,
                next_start: merged.get(i + 1).map(|r| r.0),
            };
        }
        if start > pos {
            return BufferInfo::empty(pos, Some(start));
        }
    }

    BufferInfo::empty(pos, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_ranges() {
        let info = buffer_info(&TimeRanges::empty(), 5.0, 0.5);
        assert_eq!(info.len, 0.0);
        assert_eq!(info.start, 5.0);
        assert_eq!(info.next_start, None);
    }

    #[test]
    fn test_pos_inside_range() {
        let ranges = TimeRanges::new(vec![(0.0, 10.0)]);
        let info = buffer_info(&ranges, 4.0, 0.5);
        assert_eq!(info.start, 0.0);
        assert_eq!(info.end, 10.0);
        assert_eq!(info.len, 6.0);
        assert_eq!(info.next_start, None);
    }

    #[test]
    fn test_small_hole_merged() {
        let ranges = TimeRanges::new(vec![(0.0, 10.0), (10.3, 20.0)]);
        let info = buffer_info(&ranges, 4.0, 0.5);
        assert_eq!(info.end, 20.0);
        assert_eq!(info.len, 16.0);
        assert_eq!(info.next_start, None);
    }

    #[test]
    fn test_large_hole_not_merged() {
        let ranges = TimeRanges::new(vec![(0.0, 10.0), (15.0, 20.0)]);
        let info = buffer_info(&ranges, 4.0, 0.5);
        assert_eq!(info.end, 10.0);
        assert_eq!(info.len, 6.0);
        assert_eq!(info.next_start, Some(15.0));
    }

    #[test]
    fn test_pos_just_before_range() {
        // probe within max_hole ahead of the range start
        let ranges = TimeRanges::new(vec![(5.2, 12.0)]);
        let info = buffer_info(&ranges, 5.0, 0.5);
        assert_eq!(info.start, 5.2);
        assert_eq!(info.end, 12.0);
        // len measured from the run start, which is later than the probe
        assert!((info.len - 6.8).abs() < 1e-9);
    }

    #[test]
    fn test_pos_in_gap() {
        let ranges = TimeRanges::new(vec![(0.0, 5.0), (8.0, 12.0)]);
        let info = buffer_info(&ranges, 6.0, 0.5);
        assert_eq!(info.len, 0.0);
        assert_eq!(info.next_start, Some(8.0));
    }

    #[test]
    fn test_pos_past_all_ranges() {
        let ranges = TimeRanges::new(vec![(0.0, 5.0)]);
        let info = buffer_info(&ranges, 7.0, 0.5);
        assert_eq!(info.len, 0.0);
        assert_eq!(info.next_start, None);
    }

    #[test]
    fn test_three_ranges_merge_forward() {
        let ranges = TimeRanges::new(vec![(0.0, 4.0), (4.2, 8.0), (8.1, 12.0), (20.0, 24.0)]);
        let info = buffer_info(&ranges, 1.0, 0.5);
        assert_eq!(info.end, 12.0);
        assert_eq!(info.len, 11.0);
        assert_eq!(info.next_start, Some(20.0));
    }
}
