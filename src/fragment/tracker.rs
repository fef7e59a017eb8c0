//! Fragment lifecycle tracking.
//!
//! The tracker remembers what happened to every fragment the scheduler has
//! touched, keyed by `(level, sn)`. Its state answers the one scheduling
//! question that matters: is this fragment worth fetching again? Entries are
//! dropped as soon as their media leaves the buffered set, so the table
//! tracks the buffer, not the playlist.
//!
//! The table is shared between the main stream scheduler and an alternate
//! audio consumer, hence the concurrent map.

use dashmap::DashMap;
use serde::Serialize;

use crate::media::TimeRanges;
use crate::types::{Fragment, FragmentKey, StreamKind};

/// Lifecycle state of a tracked fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentState {
    /// Never loaded, or evicted from the buffer since
    NotLoaded,
    /// A load is in flight
    Loading,
    /// Appended, but the buffer holds less of it than its duration
    Partial,
    /// Parsed payload handed to the buffer sink, append not yet confirmed
    Appending,
    /// Fully present in the buffer
    Ok,
}

/// Coverage shortfall below which an appended fragment counts as partial.
const PARTIAL_TOLERANCE_SECS: f64 = 0.2;

#[derive(Debug, Clone)]
struct FragmentEntity {
    body: Fragment,
    loading: bool,
    buffered: bool,
    partial: bool,
    /// Buffered spans observed per elementary stream when the append drained
    audio_spans: Vec<(f64, f64)>,
    video_spans: Vec<(f64, f64)>,
}

impl FragmentEntity {
    fn spans(&self, kind: StreamKind) -> &[(f64, f64)] {
        match kind {
            StreamKind::Audio => &self.audio_spans,
            StreamKind::Video => &self.video_spans,
        }
    }

    fn clear_spans(&mut self, kind: StreamKind) {
        match kind {
            StreamKind::Audio => self.audio_spans.clear(),
            StreamKind::Video => self.video_spans.clear(),
        }
    }
}

/// Tracker statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub tracked: usize,
    pub buffered: usize,
    pub partial: usize,
}

/// Per-fragment lifecycle state, evicted in step with the media buffer.
#[derive(Debug, Default)]
pub struct FragmentTracker {
    fragments: DashMap<FragmentKey, FragmentEntity>,
}

impl FragmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scheduling gate. Only `NotLoaded` and `Partial` fragments are
    /// worth fetching (backtracked fragments bypass this check entirely).
    pub fn state(&self, key: FragmentKey) -> FragmentState {
        match self.fragments.get(&key) {
            None => FragmentState::NotLoaded,
            Some(entity) => {
                if entity.loading {
                    FragmentState::Loading
                } else if !entity.buffered {
                    FragmentState::Appending
                } else if entity.partial {
                    FragmentState::Partial
                } else {
                    FragmentState::Ok
                }
            }
        }
    }

    /// Record that a load was issued for `frag`.
    pub fn frag_loading(&self, frag: &Fragment) {
        self.fragments.insert(
            frag.key(),
            FragmentEntity {
                body: frag.clone(),
                loading: true,
                buffered: false,
                partial: false,
                audio_spans: Vec::new(),
                video_spans: Vec::new(),
            },
        );
    }

    /// Record that parsed payload was handed to the buffer sink.
    pub fn frag_appending(&self, frag: &Fragment) {
        let mut entity = self
            .fragments
            .entry(frag.key())
            .or_insert_with(|| FragmentEntity {
                body: frag.clone(),
                loading: false,
                buffered: false,
                partial: false,
                audio_spans: Vec::new(),
                video_spans: Vec::new(),
            });
        entity.body = frag.clone();
        entity.loading = false;
        entity.buffered = false;
    }

    /// Record that every append for `frag` drained, and measure how much of
    /// it the buffer actually holds per elementary stream.
    pub fn frag_buffered(
        &self,
        frag: &Fragment,
        audio: Option<&TimeRanges>,
        video: Option<&TimeRanges>,
    ) {
        let start = frag.effective_start();
        let end = frag.effective_end();
        let mut partial = false;

        let observe = |buffered: Option<&TimeRanges>| -> Vec<(f64, f64)> {
            buffered
                .map(|ranges| {
                    ranges
                        .as_slice()
                        .iter()
                        .filter_map(|&(s, e)| {
                            let lo = s.max(start);
                            let hi = e.min(end);
                            (hi > lo).then_some((lo, hi))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let audio_spans = if frag.elementary_streams.audio {
            let spans = observe(audio);
            partial |= covered(&spans) + PARTIAL_TOLERANCE_SECS < end - start;
            spans
        } else {
            Vec::new()
        };
        let video_spans = if frag.elementary_streams.video {
            let spans = observe(video);
            partial |= covered(&spans) + PARTIAL_TOLERANCE_SECS < end - start;
            spans
        } else {
            Vec::new()
        };

        self.fragments.insert(
            frag.key(),
            FragmentEntity {
                body: frag.clone(),
                loading: false,
                buffered: true,
                partial,
                audio_spans,
                video_spans,
            },
        );
    }

    /// Downgrade to `NotLoaded` every buffered fragment whose observed range
    /// for `kind` no longer intersects the current buffered set.
    pub fn detect_evicted(&self, kind: StreamKind, buffered: &TimeRanges) {
        let mut gone: Vec<FragmentKey> = Vec::new();
        for mut entry in self.fragments.iter_mut() {
            let key = *entry.key();
            let entity = entry.value_mut();
            if !entity.buffered || !entity.body.elementary_streams.contains(kind) {
                continue;
            }
            let still_there = entity.spans(kind).iter().any(|&(s, e)| {
                buffered
                    .as_slice()
                    .iter()
                    .any(|&(bs, be)| s < be && e > bs)
            });
            if !still_there {
                entity.clear_spans(kind);
                let audio_gone =
                    entity.body.elementary_streams.audio && entity.audio_spans.is_empty();
                let video_gone =
                    entity.body.elementary_streams.video && entity.video_spans.is_empty();
                let all_gone = match (
                    entity.body.elementary_streams.audio,
                    entity.body.elementary_streams.video,
                ) {
                    (true, true) => audio_gone && video_gone,
                    (true, false) => audio_gone,
                    (false, true) => video_gone,
                    (false, false) => true,
                };
                if all_gone {
                    gone.push(key);
                }
            }
        }
        for key in gone {
            tracing::debug!(frag = %key, "evicted from buffer, dropping tracker entry");
            self.fragments.remove(&key);
        }
    }

    /// The buffered fragment covering `pos`, when one exists. Ties across
    /// levels resolve to the earliest start.
    pub fn buffered_frag_at(&self, pos: f64) -> Option<Fragment> {
        let mut best: Option<Fragment> = None;
        for entry in self.fragments.iter() {
            let entity = entry.value();
            if !entity.buffered {
                continue;
            }
            let body = &entity.body;
            if pos >= body.effective_start() && pos < body.effective_end() {
                match &best {
                    Some(b) if b.effective_start() <= body.effective_start() => {}
                    _ => best = Some(body.clone()),
                }
            }
        }
        best
    }

    /// Forget one fragment (backtracking, forced re-fetch).
    pub fn remove(&self, key: FragmentKey) {
        self.fragments.remove(&key);
    }

    /// Forget everything (manifest reload, full flush).
    pub fn remove_all(&self) {
        self.fragments.clear();
    }

    pub fn stats(&self) -> TrackerStats {
        let mut buffered = 0;
        let mut partial = 0;
        for entry in self.fragments.iter() {
            if entry.value().buffered {
                buffered += 1;
            }
            if entry.value().partial {
                partial += 1;
            }
        }
        TrackerStats {
            tracked: self.fragments.len(),
            buffered,
            partial,
        }
    }
}

fn covered(spans: &[(f64, f64)]) -> f64 {
    spans.iter().map(|&(s, e)| e - s).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementaryStreams;

    fn frag(sn: u64, start: f64) -> Fragment {
        let mut f = Fragment::new(0, sn, 0, start, 4.0, format!("f{sn}.ts"));
        f.start_pts = Some(start);
        f.end_pts = Some(start + 4.0);
        f.elementary_streams = ElementaryStreams {
            audio: true,
            video: true,
        };
        f
    }

    #[test]
    fn test_untracked_is_not_loaded() {
        let tracker = FragmentTracker::new();
        assert_eq!(
            tracker.state(FragmentKey { level: 0, sn: 1 }),
            FragmentState::NotLoaded
        );
    }

    #[test]
    fn test_loading_then_appending_then_ok() {
        let tracker = FragmentTracker::new();
        let f = frag(10, 40.0);
        tracker.frag_loading(&f);
        assert_eq!(tracker.state(f.key()), FragmentState::Loading);

        tracker.frag_appending(&f);
        assert_eq!(tracker.state(f.key()), FragmentState::Appending);

        let buffered = TimeRanges::new(vec![(40.0, 44.0)]);
        tracker.frag_buffered(&f, Some(&buffered), Some(&buffered));
        assert_eq!(tracker.state(f.key()), FragmentState::Ok);
    }

    #[test]
    fn test_partial_when_buffer_holds_less() {
        let tracker = FragmentTracker::new();
        let f = frag(10, 40.0);
        tracker.frag_appending(&f);
        // only half the fragment made it into the buffer
        let buffered = TimeRanges::new(vec![(40.0, 42.0)]);
        tracker.frag_buffered(&f, Some(&buffered), Some(&buffered));
        assert_eq!(tracker.state(f.key()), FragmentState::Partial);
    }

    #[test]
    fn test_detect_evicted() {
        let tracker = FragmentTracker::new();
        let f = frag(10, 40.0);
        let buffered = TimeRanges::new(vec![(40.0, 44.0)]);
        tracker.frag_buffered(&f, Some(&buffered), Some(&buffered));
        assert_eq!(tracker.state(f.key()), FragmentState::Ok);

        // buffer slid past the fragment on both streams
        let later = TimeRanges::new(vec![(50.0, 60.0)]);
        tracker.detect_evicted(StreamKind::Audio, &later);
        assert_eq!(tracker.state(f.key()), FragmentState::Ok);
        tracker.detect_evicted(StreamKind::Video, &later);
        assert_eq!(tracker.state(f.key()), FragmentState::NotLoaded);
    }

    #[test]
    fn test_buffered_frag_at() {
        let tracker = FragmentTracker::new();
        let buffered = TimeRanges::new(vec![(40.0, 48.0)]);
        tracker.frag_buffered(&frag(10, 40.0), Some(&buffered), Some(&buffered));
        tracker.frag_buffered(&frag(11, 44.0), Some(&buffered), Some(&buffered));

        assert_eq!(tracker.buffered_frag_at(41.0).unwrap().sn, 10);
        assert_eq!(tracker.buffered_frag_at(44.0).unwrap().sn, 11);
        assert!(tracker.buffered_frag_at(50.0).is_none());
    }

    #[test]
    fn test_remove() {
        let tracker = FragmentTracker::new();
        let f = frag(10, 40.0);
        let buffered = TimeRanges::new(vec![(40.0, 44.0)]);
        tracker.frag_buffered(&f, Some(&buffered), Some(&buffered));
        tracker.remove(f.key());
        assert_eq!(tracker.state(f.key()), FragmentState::NotLoaded);
    }

    #[test]
    fn test_stats() {
        let tracker = FragmentTracker::new();
        let buffered = TimeRanges::new(vec![(40.0, 44.0)]);
        tracker.frag_loading(&frag(9, 36.0));
        tracker.frag_buffered(&frag(10, 40.0), Some(&buffered), Some(&buffered));
        let stats = tracker.stats();
        assert_eq!(stats.tracked, 2);
        assert_eq!(stats.buffered, 1);
    }
}
