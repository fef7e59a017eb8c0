//! Fragment selection.
//!
//! The IDLE-state half of the scheduler: decide whether anything should be
//! loaded at all (buffer targets, live window bounds, end of stream), then
//! pick the fragment — live edge sync, PTS search, same-SN stepping, and
//! backtracking all live here. Selection never performs I/O itself; it ends
//! by handing one load to the sequencing step or by doing nothing.

use crate::buffer::{buffer_info, BufferInfo};
use crate::events::Event;
use crate::fragment::finder::{
    find_first_fragment_with_cc, find_fragment_by_pdt, find_fragment_by_pts, fragment_by_sn,
};
use crate::fragment::tracker::FragmentState;
use crate::level::LevelDetails;
use crate::media::ReadyState;
use crate::types::{now_millis, Fragment, FragmentKey};

use super::{SchedulerState, StreamScheduler};

/// What selection decided to load.
enum SelectedLoad {
    /// The level's init segment has no payload yet
    InitSegment { level: usize, url: String },
    /// A media fragment
    Media(Fragment),
}

impl StreamScheduler {
    pub(crate) fn do_tick_idle(&mut self) {
        if self.levels.is_empty() {
            return;
        }
        // media must be attached, unless prefetch is allowed and nothing
        // was requested yet
        if self.media.is_none() && (self.start_frag_requested || !self.config.start_frag_prefetch) {
            return;
        }

        let level = self.levels.current();
        let pos = if self.loaded_metadata {
            self.media
                .as_ref()
                .map(|m| m.lock().current_time())
                .unwrap_or(self.next_load_position)
        } else {
            self.next_load_position
        };

        let level_bitrate = self.levels.level(level).map(|l| l.bitrate).unwrap_or(0);
        let max_buf_len = if level_bitrate > 0 {
            (8.0 * self.config.max_buffer_size as f64 / level_bitrate as f64)
                .max(self.config.max_buffer_length)
        } else {
            self.config.max_buffer_length
        }
        .min(self.max_max_buffer_length)
        .max(0.0);

        let buffered = self.media_buffered();
        let buf = buffer_info(&buffered, pos, self.config.max_buffer_hole);
        if buf.len >= max_buf_len {
            return;
        }

        let (has_details, live) = match self.levels.level(level).and_then(|l| l.details.as_ref()) {
            Some(d) => (true, d.live),
            None => (false, false),
        };
        // a live level whose playlist is not the freshest load is stale:
        // its window may have slid since
        if !has_details || (live && self.levels.last_loaded() != Some(level)) {
            self.state = SchedulerState::WaitingLevel;
            return;
        }

        if self.stream_ended(&buf) {
            tracing::info!("all fragments buffered, signalling end of stream");
            self.bus.emit(Event::BufferEos { kind: None });
            self.state = SchedulerState::Ended;
            return;
        }

        let Some(buffer_end) = self.live_window_check(&buf) else {
            return;
        };

        // choose the fragment inside one details borrow; apply side
        // effects (backtrack marks) after the borrow ends
        let (selected, mark_backtracked) = {
            let details = self
                .levels
                .current_details()
                .expect("details checked above");
            self.select_load(details, buffer_end)
        };
        if let Some(key) = mark_backtracked {
            if let Some(frag) = self.levels.fragment_mut(key) {
                frag.backtracked = true;
            }
        }
        if let Some(selected) = selected {
            self.dispatch_load(selected);
        }
    }

    fn stream_ended(&self, buf: &BufferInfo) -> bool {
        let Some(details) = self.levels.current_details() else {
            return false;
        };
        if details.live {
            return false;
        }
        let last_loaded = self
            .frag_previous
            .as_ref()
            .map_or(false, |p| p.sn == details.end_sn);
        last_loaded
            && buf.next_start.is_none()
            && buf.end >= details.edge() - self.config.max_frag_lookup_tolerance
    }

    /// Live window bounds. Returns the (possibly moved) buffer end to
    /// search from, or `None` when selection should wait this tick.
    fn live_window_check(&mut self, buf: &BufferInfo) -> Option<f64> {
        let (live, frag_count, start, end, total, target_duration, pts_known) = {
            let details = self.levels.current_details()?;
            (
                details.live,
                details.fragments.len(),
                details.sliding(),
                details.edge(),
                details.total_duration(),
                details.target_duration,
                details.pts_known,
            )
        };
        if !live {
            return Some(buf.end);
        }

        if frag_count < self.config.initial_live_manifest_size {
            tracing::debug!(frag_count, "live playlist too short, waiting for more fragments");
            return None;
        }

        let media_ready = self
            .media
            .as_ref()
            .map(|m| m.lock().ready_state() >= ReadyState::HaveMetadata)
            .unwrap_or(false);

        if let Some(max_latency) = self.config.live_max_latency(target_duration) {
            let threshold = (start - self.config.max_frag_lookup_tolerance).max(end - max_latency);
            if buf.end < threshold {
                let target = self.config.live_sync_target(target_duration);
                let sync = start + (total - target).max(0.0);
                self.levels.live_sync_position = Some(sync);
                tracing::warn!(
                    buffer_end = buf.end,
                    sync,
                    "playback too far behind the live edge, jumping to sync position"
                );
                if media_ready {
                    if let Some(media) = &self.media {
                        media.lock().set_current_time(sync);
                    }
                }
                self.next_load_position = sync;
                return Some(sync);
            }
        }

        // playlist momentarily slid back past our buffer; wait for the
        // next refresh instead of re-loading the edge
        if pts_known && buf.end > end && media_ready {
            return None;
        }

        Some(buf.end)
    }

    fn select_load(
        &self,
        details: &LevelDetails,
        buffer_end: f64,
    ) -> (Option<SelectedLoad>, Option<FragmentKey>) {
        // init segment comes first; one with its payload already present
        // needs no load at all
        if let Some(init) = &details.init_segment {
            if init.data.is_none() {
                return (
                    Some(SelectedLoad::InitSegment {
                        level: self.levels.current(),
                        url: init.url.clone(),
                    }),
                    None,
                );
            }
        }

        let chosen = self.choose_fragment(details, buffer_end);
        let Some(chosen) = chosen else {
            return (None, None);
        };
        let (adjusted, mark) = self.adjust_same_sn(details, chosen);
        (adjusted.map(SelectedLoad::Media), mark)
    }

    fn choose_fragment(&self, details: &LevelDetails, buffer_end: f64) -> Option<Fragment> {
        let fragments = &details.fragments;
        let prev = self.frag_previous.as_ref();

        // switching levels on a live playlist whose timeline is not yet
        // PTS-anchored: position search is meaningless, use identity
        if details.live && !details.pts_known {
            if let Some(prev) = prev {
                return self.choose_live_switch_fragment(details, prev);
            }
        }

        let tolerance = if buffer_end > details.edge() - self.config.max_frag_lookup_tolerance {
            0.0
        } else {
            self.config.max_frag_lookup_tolerance
        };
        match find_fragment_by_pts(prev, fragments, buffer_end, tolerance) {
            Some(frag) => Some(frag.clone()),
            None if buffer_end >= details.edge() => fragments.last().cloned(),
            None => None,
        }
    }

    fn choose_live_switch_fragment(
        &self,
        details: &LevelDetails,
        prev: &Fragment,
    ) -> Option<Fragment> {
        let fragments = &details.fragments;

        if details.has_program_date_time {
            if let Some(end_pdt) = prev.end_program_date_time() {
                if let Some(frag) = find_fragment_by_pdt(
                    fragments,
                    end_pdt,
                    self.config.max_frag_lookup_tolerance,
                ) {
                    return Some(frag.clone());
                }
            }
        }

        // successor by sequence number, if the discontinuity domain matches
        if let Some(next) = fragment_by_sn(fragments, prev.sn + 1) {
            if next.cc == prev.cc {
                return Some(next.clone());
            }
        }

        // same discontinuity domain anywhere in the new window
        if let Some(frag) = find_first_fragment_with_cc(fragments, prev.cc) {
            return Some(frag.clone());
        }

        tracing::debug!(
            prev_cc = prev.cc,
            "no identity match after live level switch, starting from mid-window"
        );
        fragments.get(fragments.len() / 2).cloned()
    }

    /// Re-picking the fragment we just loaded means the position search is
    /// stuck on a boundary; step off it, or continue a backtrack chain.
    fn adjust_same_sn(
        &self,
        details: &LevelDetails,
        chosen: Fragment,
    ) -> (Option<Fragment>, Option<FragmentKey>) {
        let Some(prev) = self.frag_previous.as_ref() else {
            return (Some(chosen), None);
        };
        if chosen.sn != prev.sn {
            return (Some(chosen), None);
        }
        let fragments = &details.fragments;
        let same_level = chosen.level == prev.level;

        if !chosen.backtracked {
            if same_level && chosen.sn < details.end_sn {
                if prev.delta_pts > self.config.max_buffer_hole && prev.dropped > 0 {
                    // the previous parse lost leading video frames; the
                    // keyframe lives one fragment back
                    tracing::warn!(
                        sn = chosen.sn,
                        "audio/video gap with dropped frames, stepping back one fragment"
                    );
                    let pred = chosen
                        .sn
                        .checked_sub(1)
                        .and_then(|sn| fragment_by_sn(fragments, sn));
                    return (pred.cloned(), None);
                }
                return (fragment_by_sn(fragments, chosen.sn + 1).cloned(), None);
            }
            return (Some(chosen), None);
        }

        // continuing a backtrack chain
        let next = fragment_by_sn(fragments, chosen.sn + 1);
        if next.map(|n| n.backtracked) == Some(true) {
            // two consecutive backtracks never help; move on
            tracing::warn!(sn = chosen.sn, "giving up backtracking, advancing");
            return (next.cloned(), None);
        }
        match chosen
            .sn
            .checked_sub(1)
            .and_then(|sn| fragment_by_sn(fragments, sn))
        {
            Some(pred) => {
                tracing::debug!(sn = pred.sn, "backtracking to predecessor for a keyframe");
                let mut pred = pred.clone();
                pred.backtracked = true;
                let key = pred.key();
                (Some(pred), Some(key))
            }
            None => (None, None),
        }
    }

    // ------------------------------------------------------------------
    // load sequencing
    // ------------------------------------------------------------------

    fn dispatch_load(&mut self, selected: SelectedLoad) {
        match selected {
            SelectedLoad::InitSegment { level, url } => {
                tracing::debug!(level, url = %url, "loading init segment");
                self.frag_current = None;
                self.state = SchedulerState::FragLoading;
                self.loader.load_init_segment(level, &url);
            }
            SelectedLoad::Media(frag) => self.dispatch_fragment_load(frag),
        }
    }

    fn dispatch_fragment_load(&mut self, frag: Fragment) {
        if frag.encrypted && self.key_loaded_for != Some(frag.key()) {
            tracing::debug!(frag = %frag.key(), "fragment encrypted, requesting key");
            self.frag_current = Some(frag.clone());
            self.state = SchedulerState::KeyLoading;
            self.bus.emit(Event::KeyLoading { frag: frag.key() });
            return;
        }

        let tracked = self.tracker.state(frag.key());
        let fetchable = matches!(tracked, FragmentState::NotLoaded | FragmentState::Partial)
            || frag.backtracked;
        if fetchable {
            let mut frag = frag;
            if self.bitrate_test && !self.start_frag_requested {
                frag.bitrate_test = true;
            }
            self.start_frag_requested = true;
            if !frag.bitrate_test {
                self.next_load_position = frag.start + frag.duration;
            }
            frag.stats = Default::default();
            frag.stats.trequest = Some(now_millis());
            self.update_canonical(&frag);
            self.tracker.frag_loading(&frag);
            tracing::debug!(
                frag = %frag.key(),
                start = frag.start,
                duration = frag.duration,
                bitrate_test = frag.bitrate_test,
                "loading fragment"
            );
            self.loader.load_fragment(&frag);
            self.frag_current = Some(frag);
            self.state = SchedulerState::FragLoading;
        } else if tracked == FragmentState::Appending {
            // an append for this range is still draining; make room and
            // let the next tick retry it
            if self.reduce_max_buffer_length(frag.duration) {
                self.tracker.remove(frag.key());
            }
        } else {
            tracing::trace!(frag = %frag.key(), state = ?tracked, "fragment not fetchable");
        }
    }
}
