//! Level switching primitives.
//!
//! Two strategies, both ending in a buffer flush window. The immediate
//! switch trades a visible rebuffer for instant quality change: pause,
//! drop everything, refill at the new level. The smooth switch keeps
//! playing and only flushes what the new level can re-deliver before the
//! playhead gets there.

use crate::events::Event;
use crate::types::{Fragment, StreamKind};

use super::{SchedulerState, StreamScheduler};

impl StreamScheduler {
    /// Abandon the current level's buffer outright. Playback resumes once
    /// the first replacement fragment lands (see the buffer check).
    pub fn immediate_level_switch(&mut self) {
        tracing::info!(level = self.levels.current(), "immediate level switch");
        if !self.immediate_switch {
            self.immediate_switch = true;
            let paused = self
                .media
                .as_ref()
                .map(|m| {
                    let mut media = m.lock();
                    let paused = media.paused();
                    if !paused {
                        media.pause();
                    }
                    paused
                })
                .unwrap_or(true);
            self.previously_paused = paused;
        }
        self.loader.abort();
        if let Some(frag) = self.frag_current.take() {
            self.tracker.remove(frag.key());
        }
        self.frag_previous = None;
        self.flush_main_buffer(0.0, f64::INFINITY, None);
    }

    /// Switch without interrupting playback: keep everything the playhead
    /// will reach before the new level's first fragment could arrive, and
    /// flush from the first fragment after that point.
    pub fn next_level_switch(&mut self) {
        let Some(media) = self.media.as_ref() else {
            return;
        };
        let (current_time, paused) = {
            let m = media.lock();
            (m.current_time(), m.paused())
        };

        // seconds of playback we expect to burn while fetching one
        // fragment of the new level
        let fetchdelay = if paused || self.frag_last_kbps <= 0.0 {
            0.0
        } else {
            let duration = self
                .frag_current
                .as_ref()
                .or(self.frag_previous.as_ref())
                .map(|f| f.duration)
                .unwrap_or(0.0);
            let next_bitrate = self
                .levels
                .level(self.levels.current())
                .map(|l| l.bitrate)
                .unwrap_or(0);
            duration * next_bitrate as f64 / (1000.0 * self.frag_last_kbps) + 1.0
        };

        let Some(at_delay) = self.tracker.buffered_frag_at(current_time + fetchdelay) else {
            return;
        };
        let Some(next) = self.following_buffered_frag(&at_delay) else {
            return;
        };

        tracing::info!(
            level = self.levels.current(),
            fetchdelay,
            flush_from = next.max_start_pts.unwrap_or(next.start),
            "smooth level switch"
        );
        self.loader.abort();
        if let Some(frag) = self.frag_current.take() {
            self.tracker.remove(frag.key());
        }
        let flush_start = next.max_start_pts.unwrap_or_else(|| next.effective_start());
        self.flush_main_buffer(flush_start, f64::INFINITY, None);
    }

    fn following_buffered_frag(&self, frag: &Fragment) -> Option<Fragment> {
        // a successor buffered right behind this one, hole-tolerant
        self.tracker.buffered_frag_at(frag.effective_end() + 0.5)
    }

    /// Ask the buffer sink to drop a window and wait for the completion.
    pub(crate) fn flush_main_buffer(
        &mut self,
        start_offset: f64,
        end_offset: f64,
        kind: Option<StreamKind>,
    ) {
        self.state = SchedulerState::BufferFlushing;
        self.bus.emit(Event::BufferFlushing {
            start_offset,
            end_offset,
            kind,
        });
    }
}
