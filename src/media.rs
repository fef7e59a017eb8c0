//! Media element interface.
//!
//! The scheduler never touches a real playback surface; the embedding
//! application hands it a [`MediaHandle`] wrapping whatever implements
//! [`MediaElement`]. Buffered ranges are read-only to the core; the only
//! `current_time` writes are the start-up seek, live catch-up, gap skips,
//! and the immediate-switch nudge.

use parking_lot::Mutex;
use std::sync::Arc;

/// Readiness of the playback surface, in increasing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    /// No metadata yet
    HaveNothing,
    /// Duration and dimensions known
    HaveMetadata,
    /// Data for the current position
    HaveCurrentData,
    /// Data a little past the current position
    HaveFutureData,
    /// Enough data to play through
    HaveEnoughData,
}

/// An ordered set of disjoint `[start, end)` buffered ranges, seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRanges(Vec<(f64, f64)>);

impl TimeRanges {
    pub fn new(ranges: Vec<(f64, f64)>) -> Self {
        debug_assert!(
            ranges.windows(2).all(|w| w[0].1 <= w[1].0),
            "time ranges must be sorted and disjoint"
        );
        Self(ranges)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn start(&self, i: usize) -> f64 {
        self.0[i].0
    }

    pub fn end(&self, i: usize) -> f64 {
        self.0[i].1
    }

    pub fn as_slice(&self) -> &[(f64, f64)] {
        &self.0
    }

    /// True when `pos` falls inside any range.
    pub fn contains(&self, pos: f64) -> bool {
        self.0.iter().any(|&(s, e)| pos >= s && pos < e)
    }
}

/// Capabilities the scheduler requires from the playback surface.
pub trait MediaElement: Send {
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, time: f64);
    fn ready_state(&self) -> ReadyState;
    fn seeking(&self) -> bool;
    fn paused(&self) -> bool;
    fn ended(&self) -> bool;
    /// Total duration in seconds; NaN until known.
    fn duration(&self) -> f64;
    fn buffered(&self) -> TimeRanges;
    fn play(&mut self);
    fn pause(&mut self);
}

/// Shared handle to the attached media element.
pub type MediaHandle = Arc<Mutex<dyn MediaElement>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ranges_contains() {
        let ranges = TimeRanges::new(vec![(0.0, 10.0), (12.0, 20.0)]);
        assert!(ranges.contains(5.0));
        assert!(!ranges.contains(11.0));
        assert!(ranges.contains(12.0));
        assert!(!ranges.contains(20.0));
    }

    #[test]
    fn test_ready_state_ordering() {
        assert!(ReadyState::HaveCurrentData >= ReadyState::HaveMetadata);
        assert!(ReadyState::HaveNothing < ReadyState::HaveMetadata);
    }
}
