//! Quality level state.
//!
//! Each quality level owns at most one `LevelDetails`: the current playlist
//! snapshot. Live playlists slide, so an incoming snapshot is merged with
//! the previous one to carry parsed PTS/DTS data forward and to rebase the
//! new window onto the established timeline. The `LevelStore` is the
//! registry every other component resolves `(level, sn)` handles through.

use crate::config::StreamConfig;
use crate::error::{HlsClientError, Result};
use crate::fragment::finder;
use crate::types::{Fragment, FragmentKey, InitSegment};

/// One quality level of the master playlist.
#[derive(Debug, Clone)]
pub struct Level {
    /// Peak bitrate declared by the master playlist, bits per second
    pub bitrate: u64,
    /// Declared audio codec, when present
    pub audio_codec: Option<String>,
    /// Declared video codec, when present
    pub video_codec: Option<String>,
    /// Media playlist URL
    pub url: String,
    /// Current playlist snapshot, absent until the first playlist load
    pub details: Option<LevelDetails>,
}

impl Level {
    pub fn new(bitrate: u64, url: String) -> Self {
        Self {
            bitrate,
            audio_codec: None,
            video_codec: None,
            url,
            details: None,
        }
    }
}

/// A media playlist snapshot for one level.
#[derive(Debug, Clone)]
pub struct LevelDetails {
    /// Fragments in playlist order; `sn` contiguous from `start_sn`
    pub fragments: Vec<Fragment>,
    pub start_sn: u64,
    pub end_sn: u64,
    pub start_cc: u32,
    pub end_cc: u32,
    /// EXT-X-TARGETDURATION in seconds
    pub target_duration: f64,
    /// Playlist has no EXT-X-ENDLIST yet
    pub live: bool,
    /// Fragment starts are PTS-derived, not just playlist arithmetic
    pub pts_known: bool,
    /// Playlist carries EXT-X-PROGRAM-DATE-TIME
    pub has_program_date_time: bool,
    /// EXT-X-MAP init segment, when the level needs one
    pub init_segment: Option<InitSegment>,
    /// EXT-X-START offset, when present
    pub start_time_offset: Option<f64>,
}

impl LevelDetails {
    /// Build a snapshot from a parsed fragment list. SN/CC bounds and the
    /// PDT flag are derived from the fragments.
    pub fn new(fragments: Vec<Fragment>, target_duration: f64, live: bool) -> Self {
        let start_sn = fragments.first().map(|f| f.sn).unwrap_or(0);
        let end_sn = fragments.last().map(|f| f.sn).unwrap_or(0);
        let start_cc = fragments.first().map(|f| f.cc).unwrap_or(0);
        let end_cc = fragments.last().map(|f| f.cc).unwrap_or(0);
        let has_program_date_time = fragments.iter().any(|f| f.program_date_time.is_some());
        Self {
            fragments,
            start_sn,
            end_sn,
            start_cc,
            end_cc,
            target_duration,
            live,
            pts_known: false,
            has_program_date_time,
            init_segment: None,
            start_time_offset: None,
        }
    }

    /// Sum of fragment durations.
    pub fn total_duration(&self) -> f64 {
        self.fragments.iter().map(|f| f.duration).sum()
    }

    /// Start of the playlist window (the sliding offset on live streams).
    pub fn sliding(&self) -> f64 {
        self.fragments.first().map(|f| f.start).unwrap_or(0.0)
    }

    /// End of the playlist window.
    pub fn edge(&self) -> f64 {
        self.fragments.last().map(|f| f.end()).unwrap_or(0.0)
    }

    pub fn fragment(&self, sn: u64) -> Option<&Fragment> {
        finder::fragment_by_sn(&self.fragments, sn)
    }

    pub fn fragment_mut(&mut self, sn: u64) -> Option<&mut Fragment> {
        let first_sn = self.fragments.first()?.sn;
        if sn < first_sn {
            return None;
        }
        self.fragments.get_mut((sn - first_sn) as usize)
    }
}

/// Merge an incoming live snapshot with the previous one.
///
/// Fragments present in both windows with the same `(sn, cc)` inherit the
/// old snapshot's parsed timing and lifecycle attributes; fragments past
/// the overlap are chained onto the rebased timeline. Returns `true` when
/// the windows overlap (the new window is on the established timeline).
pub fn merge_details(old: &LevelDetails, new: &mut LevelDetails) -> bool {
    let lo = old.start_sn.max(new.start_sn);
    let hi = old.end_sn.min(new.end_sn);
    if lo > hi {
        new.pts_known = false;
        return false;
    }

    let mut last_aligned: Option<usize> = None;
    let mut any_pts = false;
    for sn in lo..=hi {
        let old_frag = match old.fragment(sn) {
            Some(f) => f,
            None => continue,
        };
        let idx = (sn - new.start_sn) as usize;
        let new_frag = match new.fragments.get_mut(idx) {
            Some(f) => f,
            None => continue,
        };
        if new_frag.cc != old_frag.cc {
            continue;
        }
        new_frag.start = old_frag.start;
        if old_frag.start_pts.is_some() {
            new_frag.start_pts = old_frag.start_pts;
            new_frag.end_pts = old_frag.end_pts;
            new_frag.start_dts = old_frag.start_dts;
            new_frag.end_dts = old_frag.end_dts;
            new_frag.max_start_pts = old_frag.max_start_pts;
            new_frag.duration = old_frag.duration;
            any_pts = true;
        }
        new_frag.delta_pts = old_frag.delta_pts;
        new_frag.dropped = old_frag.dropped;
        new_frag.backtracked = old_frag.backtracked;
        new_frag.elementary_streams = old_frag.elementary_streams;
        new_frag.stats = old_frag.stats.clone();
        last_aligned = Some(idx);
    }

    if let Some(from) = last_aligned {
        chain_starts_forward(&mut new.fragments, from);
        chain_starts_backward(&mut new.fragments, from);
    }

    new.pts_known = old.pts_known && any_pts;
    if old.init_segment.is_some() && new.init_segment.is_none() {
        new.init_segment = old.init_segment.clone();
    }
    true
}

fn chain_starts_forward(fragments: &mut [Fragment], from: usize) {
    for i in from + 1..fragments.len() {
        fragments[i].start = fragments[i - 1].end();
    }
}

fn chain_starts_backward(fragments: &mut [Fragment], from: usize) {
    for i in (0..from).rev() {
        fragments[i].start = fragments[i + 1].start - fragments[i].duration;
    }
}

/// Fold transmuxer-reported timing into a fragment and rebase its
/// neighbors. Returns the drift between the parsed start and the playlist
/// start, so callers can propagate the correction to other levels.
pub fn update_fragment_pts(
    details: &mut LevelDetails,
    sn: u64,
    start_pts: f64,
    end_pts: f64,
    start_dts: f64,
    end_dts: f64,
) -> f64 {
    let first_sn = details.start_sn;
    let idx = match details.fragment_mut(sn) {
        Some(_) => (sn - first_sn) as usize,
        None => return 0.0,
    };

    let frag = &mut details.fragments[idx];
    let (mut start_pts, mut end_pts) = (start_pts, end_pts);
    let (mut start_dts, mut end_dts) = (start_dts, end_dts);
    let mut max_start_pts = start_pts;
    if let (Some(old_start), Some(old_end)) = (frag.start_pts, frag.end_pts) {
        let discrepancy = (old_start - start_pts).abs();
        frag.delta_pts = frag.delta_pts.max(discrepancy);
        max_start_pts = start_pts.max(old_start);
        start_pts = start_pts.min(old_start);
        end_pts = end_pts.max(old_end);
        start_dts = start_dts.min(frag.start_dts.unwrap_or(start_dts));
        end_dts = end_dts.max(frag.end_dts.unwrap_or(end_dts));
    }

    let drift = start_pts - frag.start;
    frag.start = start_pts;
    frag.start_pts = Some(start_pts);
    frag.end_pts = Some(end_pts);
    frag.start_dts = Some(start_dts);
    frag.end_dts = Some(end_dts);
    frag.max_start_pts = Some(max_start_pts);
    frag.duration = end_pts - start_pts;

    chain_starts_forward(&mut details.fragments, idx);
    chain_starts_backward(&mut details.fragments, idx);
    details.pts_known = true;
    drift
}

/// Rebase a fresh snapshot onto the timeline of the last loaded level.
///
/// Used on level switches when the new level has no prior details to merge
/// with: wall-clock timestamps are the precise route; otherwise the first
/// shared discontinuity boundary anchors the shift.
pub fn align_stream(last: &LevelDetails, new: &mut LevelDetails) {
    if last.has_program_date_time && new.has_program_date_time {
        let anchor = last
            .fragments
            .iter()
            .find_map(|f| f.program_date_time.map(|pdt| (pdt, f.start)));
        if let Some((ref_pdt, ref_start)) = anchor {
            for frag in &mut new.fragments {
                if let Some(pdt) = frag.program_date_time {
                    frag.start =
                        ref_start + (pdt - ref_pdt).num_milliseconds() as f64 / 1000.0;
                }
            }
            tracing::debug!("aligned level window by program-date-time");
            return;
        }
    }

    // CC alignment: shift the new window so that the first shared
    // discontinuity boundary lands at the same time in both.
    for cc in new.start_cc..=new.end_cc {
        let (old_anchor, new_anchor) = match (
            finder::find_first_fragment_with_cc(&last.fragments, cc),
            finder::find_first_fragment_with_cc(&new.fragments, cc),
        ) {
            (Some(o), Some(n)) => (o.start, n.start),
            _ => continue,
        };
        let delta = old_anchor - new_anchor;
        for frag in &mut new.fragments {
            frag.start += delta;
        }
        tracing::debug!(cc, delta, "aligned level window by discontinuity boundary");
        return;
    }
}

/// Registry of all levels. Cross-component `(level, sn)` handles resolve
/// through here at call time.
#[derive(Debug, Default)]
pub struct LevelStore {
    levels: Vec<Level>,
    /// Level the scheduler is currently loading from
    current: usize,
    /// Level whose playlist arrived most recently
    last_loaded: Option<usize>,
    /// Current live sync target, absolute stream time
    pub live_sync_position: Option<f64>,
}

impl LevelStore {
    pub fn new(levels: Vec<Level>) -> Self {
        Self {
            levels,
            current: 0,
            last_loaded: None,
            live_sync_position: None,
        }
    }

    pub fn reset(&mut self, levels: Vec<Level>) {
        self.levels = levels;
        self.current = 0;
        self.last_loaded = None;
        self.live_sync_position = None;
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn level(&self, idx: usize) -> Option<&Level> {
        self.levels.get(idx)
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn set_current(&mut self, idx: usize) -> Result<()> {
        if idx >= self.levels.len() {
            return Err(HlsClientError::LevelNotFound {
                level: idx,
                known: self.levels.len(),
            });
        }
        self.current = idx;
        Ok(())
    }

    pub fn last_loaded(&self) -> Option<usize> {
        self.last_loaded
    }

    pub fn current_details(&self) -> Option<&LevelDetails> {
        self.details(self.current)
    }

    pub fn current_details_mut(&mut self) -> Option<&mut LevelDetails> {
        self.details_mut(self.current)
    }

    pub fn details(&self, level: usize) -> Option<&LevelDetails> {
        self.levels.get(level).and_then(|l| l.details.as_ref())
    }

    pub fn details_mut(&mut self, level: usize) -> Option<&mut LevelDetails> {
        self.levels.get_mut(level).and_then(|l| l.details.as_mut())
    }

    /// Resolve a fragment handle to the canonical fragment.
    pub fn fragment(&self, key: FragmentKey) -> Option<&Fragment> {
        self.levels
            .get(key.level)
            .and_then(|l| l.details.as_ref())
            .and_then(|d| d.fragment(key.sn))
    }

    pub fn fragment_mut(&mut self, key: FragmentKey) -> Option<&mut Fragment> {
        self.levels
            .get_mut(key.level)
            .and_then(|l| l.details.as_mut())
            .and_then(|d| d.fragment_mut(key.sn))
    }

    /// Install a freshly loaded playlist snapshot for `level`.
    ///
    /// Live snapshots merge with the previous window when one exists;
    /// otherwise the snapshot is installed as-is and aligned against the
    /// last loaded level. Returns `true` when the snapshot merged onto the
    /// established timeline.
    pub fn on_level_loaded(
        &mut self,
        level: usize,
        mut new_details: LevelDetails,
        config: &StreamConfig,
    ) -> Result<bool> {
        if level >= self.levels.len() {
            return Err(HlsClientError::LevelNotFound {
                level,
                known: self.levels.len(),
            });
        }

        let mut merged = false;
        let prior = self.levels[level].details.take();
        match prior {
            Some(old) if new_details.live => {
                merged = merge_details(&old, &mut new_details);
                if !merged {
                    tracing::warn!(
                        level,
                        old_end_sn = old.end_sn,
                        new_start_sn = new_details.start_sn,
                        "live playlist slid past the previous window, timeline lost"
                    );
                    self.align_against_last_loaded(level, &mut new_details);
                }
            }
            _ => {
                new_details.pts_known = false;
                self.align_against_last_loaded(level, &mut new_details);
            }
        }

        if new_details.live {
            let target = config.live_sync_target(new_details.target_duration);
            let sliding = new_details.sliding();
            self.live_sync_position =
                Some(sliding + (new_details.total_duration() - target).max(0.0));
        }

        tracing::debug!(
            level,
            start_sn = new_details.start_sn,
            end_sn = new_details.end_sn,
            live = new_details.live,
            merged,
            "level details installed"
        );
        self.levels[level].details = Some(new_details);
        self.last_loaded = Some(level);
        Ok(merged)
    }

    fn align_against_last_loaded(&self, level: usize, new_details: &mut LevelDetails) {
        let last = self
            .last_loaded
            .filter(|&l| l != level)
            .and_then(|l| self.levels.get(l))
            .and_then(|l| l.details.as_ref());
        if let Some(last) = last {
            align_stream(last, new_details);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(start_sn: u64, count: u64, sliding: f64, live: bool) -> LevelDetails {
        let fragments = (0..count)
            .map(|i| {
                Fragment::new(
                    0,
                    start_sn + i,
                    0,
                    sliding + i as f64 * 4.0,
                    4.0,
                    format!("f{}.ts", start_sn + i),
                )
            })
            .collect();
        LevelDetails::new(fragments, 4.0, live)
    }

    #[test]
    fn test_details_bounds() {
        let d = details(10, 5, 0.0, false);
        assert_eq!(d.start_sn, 10);
        assert_eq!(d.end_sn, 14);
        assert_eq!(d.total_duration(), 20.0);
        assert_eq!(d.edge(), 20.0);
    }

    #[test]
    fn test_merge_inherits_pts() {
        let mut old = details(10, 5, 100.0, true);
        {
            let f = old.fragment_mut(12).unwrap();
            f.start_pts = Some(108.5);
            f.end_pts = Some(112.5);
            f.backtracked = true;
        }
        old.pts_known = true;

        // new window slid forward by two fragments, starts relative at 0
        let mut new = details(12, 5, 0.0, true);
        let merged = merge_details(&old, &mut new);
        assert!(merged);
        assert!(new.pts_known);

        let f = new.fragment(12).unwrap();
        assert_eq!(f.start_pts, Some(108.5));
        assert!(f.backtracked);
        // rebased onto the old timeline
        assert_eq!(f.start, old.fragment(12).unwrap().start);
        // fragments past the overlap chain onto the rebased timeline
        let last = new.fragment(16).unwrap();
        assert_eq!(last.start, new.fragment(15).unwrap().end());
    }

    #[test]
    fn test_merge_cc_mismatch_skipped() {
        let old = details(10, 3, 0.0, true);
        let mut new = details(11, 3, 0.0, true);
        for f in &mut new.fragments {
            f.cc = 1;
        }
        let merged = merge_details(&old, &mut new);
        // windows overlap by sn but no pair aligns by cc
        assert!(merged);
        assert!(!new.pts_known);
    }

    #[test]
    fn test_merge_no_overlap() {
        let old = details(10, 3, 0.0, true);
        let mut new = details(20, 3, 0.0, true);
        assert!(!merge_details(&old, &mut new));
        assert!(!new.pts_known);
    }

    #[test]
    fn test_update_fragment_pts_drift_and_chain() {
        let mut d = details(10, 5, 0.0, false);
        let drift = update_fragment_pts(&mut d, 12, 8.3, 12.3, 8.3, 12.3);
        assert!((drift - 0.3).abs() < 1e-9);
        let f = d.fragment(12).unwrap();
        assert_eq!(f.start, 8.3);
        assert_eq!(f.start_pts, Some(8.3));
        // neighbors rebased in both directions
        assert!((d.fragment(13).unwrap().start - 12.3).abs() < 1e-9);
        assert!((d.fragment(11).unwrap().start - 4.3).abs() < 1e-9);
        assert!(d.pts_known);
    }

    #[test]
    fn test_update_fragment_pts_clamps_with_existing() {
        let mut d = details(10, 2, 0.0, false);
        update_fragment_pts(&mut d, 10, 0.5, 4.5, 0.5, 4.5);
        // a reload reports slightly different timing
        update_fragment_pts(&mut d, 10, 0.2, 4.4, 0.2, 4.4);
        let f = d.fragment(10).unwrap();
        assert_eq!(f.start_pts, Some(0.2));
        assert_eq!(f.end_pts, Some(4.5));
        assert_eq!(f.max_start_pts, Some(0.5));
        assert!((f.delta_pts - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_align_stream_by_pdt() {
        use chrono::TimeZone;
        let base = chrono::Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap();
        let mut last = details(10, 3, 50.0, true);
        for (i, f) in last.fragments.iter_mut().enumerate() {
            f.program_date_time = Some(base + chrono::Duration::seconds(i as i64 * 4));
        }
        last.has_program_date_time = true;

        let mut new = details(100, 3, 0.0, true);
        for (i, f) in new.fragments.iter_mut().enumerate() {
            // same wall-clock window, 8 seconds later
            f.program_date_time = Some(base + chrono::Duration::seconds(8 + i as i64 * 4));
        }
        new.has_program_date_time = true;

        align_stream(&last, &mut new);
        assert!((new.fragments[0].start - 58.0).abs() < 1e-9);
    }

    #[test]
    fn test_align_stream_by_cc() {
        let mut last = details(10, 4, 30.0, true);
        for f in &mut last.fragments[2..] {
            f.cc = 1;
        }
        let mut new = details(50, 4, 0.0, true);
        for f in &mut new.fragments[1..] {
            f.cc = 1;
        }
        align_stream(&last, &mut new);
        // cc=0 boundary: old starts at 30.0, new at 0.0
        assert!((new.fragments[0].start - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_store_live_sync_position() {
        let mut store = LevelStore::new(vec![Level::new(500_000, "l0.m3u8".into())]);
        let config = StreamConfig::default();
        // 11 fragments of 4s starting at 1000: edge 1044, sync target 12s
        let d = details(10, 11, 1000.0, true);
        store.on_level_loaded(0, d, &config).unwrap();
        let sync = store.live_sync_position.unwrap();
        assert!((sync - 1032.0).abs() < 1e-9);
        assert_eq!(store.last_loaded(), Some(0));
    }

    #[test]
    fn test_store_level_out_of_range() {
        let mut store = LevelStore::new(vec![Level::new(500_000, "l0.m3u8".into())]);
        let config = StreamConfig::default();
        assert!(store
            .on_level_loaded(3, details(0, 2, 0.0, false), &config)
            .is_err());
        assert!(store.set_current(1).is_err());
    }
}
