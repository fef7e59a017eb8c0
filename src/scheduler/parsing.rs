//! Load and parse completion handling.
//!
//! Completions arrive from the loader and transmuxer collaborators long
//! after the work was issued. Every entry point here first validates the
//! `(level, sn)` context against the in-flight fragment and silently drops
//! anything stale — aborted loads, level switches, and duplicate delivery
//! all funnel through that one check.

use bytes::Bytes;

use crate::api::{FragLoadResult, TransmuxResult};
use crate::events::{AppendContent, AppendedRanges, Event};
use crate::level::update_fragment_pts;
use crate::types::{now_millis, Fragment, LoadStats, PlaylistKind, StreamKind};

use super::{SchedulerState, StreamScheduler};

impl StreamScheduler {
    /// Fragment payload arrived from the loader.
    pub fn on_frag_loaded(&mut self, result: FragLoadResult) {
        if self.state != SchedulerState::FragLoading {
            tracing::debug!(frag = %result.key, state = ?self.state, "late fragment load discarded");
            return;
        }
        let Some(mut cur) = self.frag_current.clone() else {
            return;
        };
        if result.key != cur.key() {
            tracing::debug!(
                got = %result.key,
                expected = %cur.key(),
                "fragment load context mismatch, discarded"
            );
            return;
        }

        cur.stats.tfirst = result.stats.tfirst.or(cur.stats.tfirst).or(cur.stats.trequest);
        cur.stats.tload = result.stats.tload.or_else(|| Some(now_millis()));
        cur.stats.loaded = if result.stats.loaded > 0 {
            result.stats.loaded
        } else {
            result.payload.len() as u64
        };
        cur.stats.total = result.stats.total.max(cur.stats.loaded);

        if cur.bitrate_test {
            // probe load: never parsed, never buffered; its only output is
            // a bandwidth sample for the ABR collaborator
            cur.stats.tparsed = cur.stats.tload;
            cur.stats.tbuffered = cur.stats.tload;
            self.frag_last_kbps = load_kbps(&cur.stats);
            tracing::debug!(kbps = self.frag_last_kbps, "bandwidth probe finished");
            self.bus.emit(Event::FragBuffered {
                frag: cur.key(),
                stats: cur.stats.clone(),
                id: PlaylistKind::Main,
            });
            self.tracker.remove(cur.key());
            self.bitrate_test = false;
            self.start_frag_requested = false;
            self.frag_current = None;
            // no immediate re-tick: the ABR collaborator reads the probe
            // stats and moves the level before the next timer tick
            self.state = SchedulerState::Idle;
            return;
        }

        self.appended = false;
        self.update_canonical(&cur);
        self.frag_current = Some(cur.clone());
        self.state = SchedulerState::Parsing;
        self.transmuxer.push(&cur, result.payload);
    }

    /// Init segment payload arrived from the loader.
    pub fn on_init_segment_loaded(&mut self, level: usize, data: Bytes) {
        // init loads run with no fragment context
        if self.state != SchedulerState::FragLoading || self.frag_current.is_some() {
            tracing::debug!(level, "late init segment load discarded");
            return;
        }
        if level != self.levels.current() {
            tracing::debug!(level, "init segment for abandoned level discarded");
            return;
        }
        if let Some(details) = self.levels.current_details_mut() {
            if let Some(init) = details.init_segment.as_mut() {
                init.data = Some(data);
            }
        }
        self.init_segment_sent = false;
        self.state = SchedulerState::Idle;
        self.tick();
    }

    /// The transmuxer finished one fragment.
    pub fn on_transmux_complete(&mut self, result: TransmuxResult) {
        if self.state != SchedulerState::Parsing {
            tracing::debug!(frag = %result.key, state = ?self.state, "late transmux discarded");
            return;
        }
        let Some(mut cur) = self.frag_current.clone() else {
            return;
        };
        if result.key != cur.key() {
            tracing::debug!(
                got = %result.key,
                expected = %cur.key(),
                "transmux context mismatch, discarded"
            );
            return;
        }

        let was_backtracked = cur.backtracked;
        let mut dropped = 0;
        if let Some(video) = &result.video {
            cur.elementary_streams.video = true;
            dropped = video.dropped;
        }
        if result.audio.is_some() {
            cur.elementary_streams.audio = true;
        }
        if let (Some(audio), Some(video)) = (&result.audio, &result.video) {
            cur.delta_pts = (audio.start_pts - video.start_pts).abs();
        }
        cur.dropped = dropped;

        // a fragment that lost leading video frames cannot start cleanly;
        // reload its predecessor first to recover the keyframe
        let first_sn = self
            .levels
            .details(cur.level)
            .map(|d| d.start_sn)
            .unwrap_or(0);
        if dropped > 0 && cur.sn != first_sn && !was_backtracked {
            let start_pts = result.video.as_ref().map(|v| v.start_pts).unwrap_or(cur.start);
            self.backtrack(cur, start_pts);
            return;
        }

        cur.stats.tparsed = Some(now_millis());
        if was_backtracked && dropped == 0 {
            // clean reload; the recovery chain is complete
            cur.backtracked = false;
        }
        self.update_canonical(&cur);

        // fold parsed timing into the level timeline
        let level = cur.level;
        for track in [&result.audio, &result.video].into_iter().flatten() {
            let drift = self
                .levels
                .details_mut(level)
                .map(|details| {
                    update_fragment_pts(
                        details,
                        result.key.sn,
                        track.start_pts,
                        track.end_pts,
                        track.start_dts,
                        track.end_dts,
                    )
                })
                .unwrap_or(0.0);
            self.bus.emit(Event::LevelPtsUpdated { level, drift });
        }
        // pick up the rebased start/duration
        if let Some(canonical) = self.levels.fragment(cur.key()) {
            let stats = cur.stats.clone();
            cur = canonical.clone();
            cur.stats = stats;
        }

        if let Some(init_pts) = result.init_pts {
            self.bus.emit(Event::InitPtsFound {
                frag: cur.key(),
                init_pts,
            });
        }

        if let Some(init) = &result.init_segment {
            self.bus.emit(Event::FragParsingInitSegment { frag: cur.key() });
            let mut tracks = init.tracks.clone();
            if let Some(codec) = &self.config.default_audio_codec {
                for track in tracks.iter_mut().filter(|t| t.kind == StreamKind::Audio) {
                    track.codec = codec.clone();
                }
            }
            self.bus.emit(Event::BufferCodecs {
                tracks: tracks.clone(),
            });
            for track in tracks {
                if !track.data.is_empty() {
                    self.bus.emit(Event::BufferAppending {
                        kind: track.kind,
                        data: track.data,
                        parent: PlaylistKind::Main,
                        content: AppendContent::InitSegment,
                    });
                    self.appended = true;
                }
            }
            self.init_segment_sent = true;
        } else if !self.init_segment_sent {
            // fMP4 path: forward the level's own init segment once per
            // codec generation
            let init_data = self
                .levels
                .details(level)
                .and_then(|d| d.init_segment.as_ref())
                .and_then(|i| i.data.clone());
            if let Some(data) = init_data {
                let kind = if self
                    .levels
                    .level(level)
                    .map(|l| l.video_codec.is_some())
                    .unwrap_or(true)
                {
                    StreamKind::Video
                } else {
                    StreamKind::Audio
                };
                self.bus.emit(Event::BufferAppending {
                    kind,
                    data,
                    parent: PlaylistKind::Main,
                    content: AppendContent::InitSegment,
                });
                self.appended = true;
                self.init_segment_sent = true;
            }
        }

        if let Some(data) = result.metadata {
            self.bus.emit(Event::FragParsingMetadata {
                frag: cur.key(),
                data,
            });
        }
        if let Some(data) = result.userdata {
            self.bus.emit(Event::FragParsingUserdata {
                frag: cur.key(),
                data,
            });
        }

        for track in [result.audio, result.video].into_iter().flatten() {
            // with an alternate rendition active, audio belongs to the
            // audio stream's own buffer, not ours
            if self.alt_audio && track.kind == StreamKind::Audio {
                continue;
            }
            self.bus.emit(Event::BufferAppending {
                kind: track.kind,
                data: track.data,
                parent: PlaylistKind::Main,
                content: AppendContent::Data,
            });
            self.appended = true;
        }

        self.tracker.frag_appending(&cur);
        self.update_canonical(&cur);
        self.frag_current = Some(cur);
        self.state = SchedulerState::Parsed;
    }

    fn backtrack(&mut self, mut cur: Fragment, start_pts: f64) {
        tracing::warn!(
            frag = %cur.key(),
            dropped = cur.dropped,
            "video frames dropped before keyframe, backtracking"
        );
        self.tracker.remove(cur.key());
        cur.backtracked = true;
        self.update_canonical(&cur);
        // selection will be drawn to the predecessor: the next probe
        // position now falls inside it
        self.next_load_position = start_pts;
        self.frag_previous = Some(cur);
        self.frag_current = None;
        self.state = SchedulerState::Idle;
        self.tick();
    }

    /// All appends of the current fragment drained.
    pub(crate) fn on_frag_fully_buffered(&mut self, ranges: AppendedRanges) {
        let Some(mut cur) = self.frag_current.take() else {
            return;
        };
        cur.stats.tbuffered = Some(now_millis());
        self.frag_last_kbps = load_kbps(&cur.stats);
        self.update_canonical(&cur);
        self.tracker
            .frag_buffered(&cur, ranges.audio.as_ref(), ranges.video.as_ref());
        tracing::debug!(
            frag = %cur.key(),
            kbps = self.frag_last_kbps,
            "fragment buffered"
        );
        self.bus.emit(Event::FragBuffered {
            frag: cur.key(),
            stats: cur.stats.clone(),
            id: PlaylistKind::Main,
        });
        self.frag_previous = Some(cur);
        self.appended = false;
        self.frag_load_error = 0;
        self.state = SchedulerState::Idle;
        self.tick();
    }
}

/// Observed load throughput in kilobits per second.
fn load_kbps(stats: &LoadStats) -> f64 {
    let start = stats.tfirst.or(stats.trequest);
    let end = stats.tbuffered.or(stats.tload);
    match (start, end) {
        (Some(start), Some(end)) if end > start => {
            8.0 * stats.loaded as f64 / (end - start) as f64
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_kbps() {
        let stats = LoadStats {
            trequest: Some(1000),
            tfirst: Some(1100),
            tload: Some(1500),
            tparsed: None,
            tbuffered: Some(2100),
            loaded: 500_000,
            total: 500_000,
        };
        // 4 Mbit over 1000 ms
        assert!((load_kbps(&stats) - 4000.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_kbps_degenerate() {
        let stats = LoadStats::default();
        assert_eq!(load_kbps(&stats), 0.0);
    }
}
