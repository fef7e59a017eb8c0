//! Stall detection and recovery.
//!
//! Watches the playhead once per tick. A stationary playhead while playback
//! is expected means either a hole in the buffer (skip past it) or a decoder
//! stuck inside a buffered range (nudge it). Skips and nudges are reported
//! as non-fatal errors on the bus; a playhead that survives the whole nudge
//! budget escalates to a fatal stall.

use std::time::Instant;

use crate::buffer::buffer_info;
use crate::error::ErrorDetails;
use crate::events::{ErrorData, Event, EventBus};
use crate::media::{MediaHandle, ReadyState};

/// Playhead must be stationary this long before recovery starts.
const STALL_MIN_DURATION_MS: u64 = 250;
/// Stationary this long inside a buffered range triggers a nudge.
const NUDGE_AFTER_MS: u64 = 1000;
/// Each nudge moves the playhead forward by this many seconds, scaled by
/// the retry count.
const NUDGE_OFFSET_SECS: f64 = 0.1;
/// Nudges before the stall is declared unrecoverable.
const MAX_NUDGE_RETRY: u32 = 3;
/// Landing offset past a skipped hole.
const SKIP_HOLE_STEP_SECS: f64 = 0.1;

/// Per-tick playhead watchdog.
#[derive(Debug)]
pub struct GapController {
    last_position: f64,
    stalled_since: Option<Instant>,
    nudge_retry: u32,
}

impl GapController {
    pub fn new() -> Self {
        Self {
            last_position: 0.0,
            stalled_since: None,
            nudge_retry: 0,
        }
    }

    pub fn reset(&mut self) {
        self.stalled_since = None;
        self.nudge_retry = 0;
    }

    /// Run one watchdog pass. Called from the scheduler's buffer check.
    pub fn poll(&mut self, media: &MediaHandle, bus: &mut EventBus) {
        self.poll_at(Instant::now(), media, bus);
    }

    pub(crate) fn poll_at(&mut self, now: Instant, media: &MediaHandle, bus: &mut EventBus) {
        let (pos, expect_progress, buffered) = {
            let m = media.lock();
            let expect = !m.paused()
                && !m.seeking()
                && !m.ended()
                && m.ready_state() >= ReadyState::HaveCurrentData;
            (m.current_time(), expect, m.buffered())
        };

        if !expect_progress {
            self.reset();
            self.last_position = pos;
            return;
        }

        if pos != self.last_position {
            // playhead moving, all good
            self.reset();
            self.last_position = pos;
            return;
        }

        let since = *self.stalled_since.get_or_insert(now);
        let stalled_ms = now.duration_since(since).as_millis() as u64;
        if stalled_ms < STALL_MIN_DURATION_MS {
            return;
        }

        let info = buffer_info(&buffered, pos, 0.0);
        if info.len < SKIP_HOLE_STEP_SECS {
            match info.next_start {
                Some(next) => {
                    // hole right ahead of the playhead; jump it
                    let target = next + SKIP_HOLE_STEP_SECS;
                    tracing::warn!(pos, target, "skipping over buffer hole");
                    media.lock().set_current_time(target);
                    bus.emit(Event::Error(ErrorData::new(ErrorDetails::BufferSeekOverHole)));
                    self.reset();
                    self.last_position = target;
                }
                // plain underrun: nothing buffered ahead, nothing to skip to
                None => {}
            }
            return;
        }

        if stalled_ms < NUDGE_AFTER_MS {
            return;
        }

        // stuck inside a buffered range: the decoder wants a nudge
        if self.nudge_retry < MAX_NUDGE_RETRY {
            self.nudge_retry += 1;
            let target = pos + self.nudge_retry as f64 * NUDGE_OFFSET_SECS;
            tracing::warn!(pos, target, retry = self.nudge_retry, "nudging stalled playhead");
            media.lock().set_current_time(target);
            bus.emit(Event::Error(ErrorData::new(ErrorDetails::BufferNudgeOnStall)));
            self.stalled_since = Some(now);
        } else {
            tracing::error!(pos, "playback stalled, nudge budget exhausted");
            let mut data = ErrorData::new(ErrorDetails::BufferStalledError);
            data.fatal = true;
            bus.emit(Event::Error(data));
            self.reset();
        }
    }
}

impl Default for GapController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TimeRanges;
    use crate::tests::fixtures::MockMedia;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn playing_media(pos: f64, ranges: Vec<(f64, f64)>) -> (Arc<Mutex<MockMedia>>, MediaHandle) {
        let mock = MockMedia::new();
        {
            let mut m = mock.lock();
            m.current_time = pos;
            m.paused = false;
            m.ready_state = ReadyState::HaveEnoughData;
            m.buffered = TimeRanges::new(ranges);
        }
        let handle: MediaHandle = mock.clone();
        (mock, handle)
    }

    #[test]
    fn test_moving_playhead_is_ignored() {
        let (mock, handle) = playing_media(5.0, vec![(0.0, 30.0)]);
        let mut gap = GapController::new();
        let mut bus = EventBus::new();
        let t0 = Instant::now();
        gap.poll_at(t0, &handle, &mut bus);
        mock.lock().current_time = 5.2;
        gap.poll_at(t0 + Duration::from_secs(2), &handle, &mut bus);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_skip_over_hole() {
        let (mock, handle) = playing_media(10.0, vec![(0.0, 10.0), (14.0, 20.0)]);
        let mut gap = GapController::new();
        let mut bus = EventBus::new();
        let t0 = Instant::now();
        gap.poll_at(t0, &handle, &mut bus); // records position
        gap.poll_at(t0 + Duration::from_millis(100), &handle, &mut bus); // starts stall timer
        gap.poll_at(t0 + Duration::from_millis(600), &handle, &mut bus);
        assert!((mock.lock().current_time - 14.1).abs() < 1e-9);
        let events = bus.drain();
        assert!(matches!(
            &events[..],
            [Event::Error(data)] if data.details == ErrorDetails::BufferSeekOverHole && !data.fatal
        ));
    }

    #[test]
    fn test_underrun_is_not_skipped() {
        let (mock, handle) = playing_media(10.0, vec![(0.0, 10.0)]);
        let mut gap = GapController::new();
        let mut bus = EventBus::new();
        let t0 = Instant::now();
        gap.poll_at(t0, &handle, &mut bus);
        gap.poll_at(t0 + Duration::from_millis(100), &handle, &mut bus);
        gap.poll_at(t0 + Duration::from_secs(3), &handle, &mut bus);
        assert_eq!(mock.lock().current_time, 10.0);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_nudge_then_fatal_stall() {
        let (mock, handle) = playing_media(5.0, vec![(0.0, 30.0)]);
        let mut gap = GapController::new();
        let mut bus = EventBus::new();
        let mut t = Instant::now();
        gap.poll_at(t, &handle, &mut bus); // records position

        // decoder never recovers: pin the playhead and poll every 2s.
        // First poll arms the stall timer, the next three nudge, the fifth
        // gives up.
        let mut nudges = 0;
        let mut fatal = false;
        for _ in 0..5 {
            t += Duration::from_secs(2);
            mock.lock().current_time = 5.0;
            gap.poll_at(t, &handle, &mut bus);
            for event in bus.drain() {
                if let Event::Error(data) = event {
                    match data.details {
                        ErrorDetails::BufferNudgeOnStall => {
                            assert!(!data.fatal);
                            nudges += 1;
                        }
                        ErrorDetails::BufferStalledError => {
                            assert!(data.fatal);
                            fatal = true;
                        }
                        other => panic!("unexpected error: {other:?}"),
                    }
                }
            }
        }
        assert_eq!(nudges, MAX_NUDGE_RETRY);
        assert!(fatal);
    }

    #[test]
    fn test_paused_media_never_stalls() {
        let (mock, handle) = playing_media(5.0, vec![(0.0, 30.0)]);
        mock.lock().paused = true;
        let mut gap = GapController::new();
        let mut bus = EventBus::new();
        let t0 = Instant::now();
        gap.poll_at(t0, &handle, &mut bus);
        gap.poll_at(t0 + Duration::from_secs(5), &handle, &mut bus);
        assert!(bus.is_empty());
    }
}
