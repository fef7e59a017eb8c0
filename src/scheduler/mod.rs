//! The stream scheduler.
//!
//! A tick-driven state machine that couples the playback position, the
//! buffered ranges, and the selected level's playlist into a sequence of
//! fragment load / parse / append decisions. Collaborator completions and
//! bus events re-enter through [`StreamScheduler::handle_event`] and the
//! `on_*` callbacks; a 100 ms tick drives everything else. All state is
//! single-owner, nothing here blocks.

mod parsing;
mod selection;
mod switching;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::{FragmentLoader, Transmuxer};
use crate::buffer::buffer_info;
use crate::config::StreamConfig;
use crate::error::{ErrorDetails, Result};
use crate::events::{AppendedRanges, ErrorData, Event, EventBus};
use crate::fragment::tracker::FragmentTracker;
use crate::gap::GapController;
use crate::level::{Level, LevelStore};
use crate::media::{MediaHandle, ReadyState, TimeRanges};
use crate::types::{Fragment, PlaylistKind, StreamKind};

/// Tick period of the scheduler.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Nudge applied after an immediate level switch to kick the decoder into
/// picking up the replacement fragments.
const IMMEDIATE_SWITCH_NUDGE_SECS: f64 = 0.0001;

/// States of the scheduling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started, or stopped
    Stopped,
    /// Ready to select the next fragment
    Idle,
    /// Selected level has no playlist details yet
    WaitingLevel,
    /// Waiting for the pending fragment's decryption key
    KeyLoading,
    /// A fragment load is in flight
    FragLoading,
    /// A failed load is waiting for its backoff deadline
    FragLoadingWaitingRetry,
    /// Transmux of the loaded payload is in flight
    Parsing,
    /// Parsed payload handed to the buffer sink, appends draining
    Parsed,
    /// A requested buffer flush has not completed yet
    BufferFlushing,
    /// No more fragments to load
    Ended,
    /// Fatal error; ticks halt until an explicit restart
    Error,
}

/// The adaptive segment scheduler.
pub struct StreamScheduler {
    pub(crate) config: StreamConfig,
    pub(crate) bus: EventBus,
    pub(crate) state: SchedulerState,
    pub(crate) levels: LevelStore,
    pub(crate) tracker: Arc<FragmentTracker>,
    gap: GapController,
    pub(crate) loader: Box<dyn FragmentLoader>,
    pub(crate) transmuxer: Box<dyn Transmuxer>,
    pub(crate) media: Option<MediaHandle>,

    /// Runtime copy of the hard buffer cap, halved under buffer pressure
    pub(crate) max_max_buffer_length: f64,

    /// Start position; negative until resolved (live sync or explicit)
    pub(crate) start_position: f64,
    /// Where the next load should continue when the media element cannot
    /// tell us (not attached, metadata not loaded)
    pub(crate) next_load_position: f64,
    pub(crate) last_current_time: f64,
    pub(crate) loaded_metadata: bool,

    pub(crate) frag_current: Option<Fragment>,
    pub(crate) frag_previous: Option<Fragment>,
    frag_playing: Option<Fragment>,

    started: bool,
    pub(crate) start_frag_requested: bool,
    pub(crate) bitrate_test: bool,
    pub(crate) frag_load_error: u32,
    pub(crate) retry_date: Option<Instant>,
    pub(crate) frag_last_kbps: f64,

    pub(crate) immediate_switch: bool,
    pub(crate) previously_paused: bool,
    pub(crate) alt_audio: bool,
    pending_audio_switch_alt: bool,

    /// At least one payload of the current fragment was sent to the sink
    pub(crate) appended: bool,
    /// The level's own init segment payload was already forwarded since the
    /// last transmuxer reset
    pub(crate) init_segment_sent: bool,
    /// Key availability for the pending encrypted fragment
    pub(crate) key_loaded_for: Option<crate::types::FragmentKey>,
}

impl StreamScheduler {
    pub fn new(
        config: StreamConfig,
        loader: Box<dyn FragmentLoader>,
        transmuxer: Box<dyn Transmuxer>,
    ) -> Result<Self> {
        config.validate()?;
        let max_max_buffer_length = config.max_max_buffer_length;
        let start_position = config.start_position.unwrap_or(-1.0);
        Ok(Self {
            config,
            bus: EventBus::new(),
            state: SchedulerState::Stopped,
            levels: LevelStore::default(),
            tracker: Arc::new(FragmentTracker::new()),
            gap: GapController::new(),
            loader,
            transmuxer,
            media: None,
            max_max_buffer_length,
            start_position,
            next_load_position: 0.0,
            last_current_time: 0.0,
            loaded_metadata: false,
            frag_current: None,
            frag_previous: None,
            frag_playing: None,
            started: false,
            start_frag_requested: false,
            bitrate_test: false,
            frag_load_error: 0,
            retry_date: None,
            frag_last_kbps: 0.0,
            immediate_switch: false,
            previously_paused: false,
            alt_audio: false,
            pending_audio_switch_alt: false,
            appended: false,
            init_segment_sent: false,
            key_loaded_for: None,
        })
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn current_level(&self) -> usize {
        self.levels.current()
    }

    /// Select the level the next load will come from. ABR and manual
    /// quality selection both go through here.
    pub fn set_level(&mut self, level: usize) -> Result<()> {
        self.levels.set_current(level)
    }

    /// Shared fragment lifecycle table, for an alternate-audio consumer.
    pub fn tracker(&self) -> Arc<FragmentTracker> {
        Arc::clone(&self.tracker)
    }

    /// Remove and return all events emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.bus.drain()
    }

    pub fn attach_media(&mut self, media: MediaHandle) {
        self.media = Some(media);
        self.loaded_metadata = false;
        self.gap.reset();
        self.tick();
    }

    pub fn detach_media(&mut self) {
        self.loader.abort();
        if let Some(frag) = self.frag_current.take() {
            self.tracker.remove(frag.key());
        }
        self.transmuxer.reset_init_segment();
        self.init_segment_sent = false;
        self.media = None;
        self.loaded_metadata = false;
        self.started = false;
        self.state = SchedulerState::Stopped;
        tracing::debug!("media detached");
    }

    /// Begin (or resume) loading, optionally at an explicit position.
    pub fn start_load(&mut self, start_position: Option<f64>) {
        self.started = true;
        self.start_frag_requested = false;
        self.frag_load_error = 0;
        self.retry_date = None;
        if let Some(pos) = start_position {
            self.start_position = pos;
        } else if let Some(pos) = self.config.start_position {
            self.start_position = pos;
        }
        self.next_load_position = self.start_position.max(0.0);
        self.last_current_time = self.start_position.max(0.0);
        self.state = SchedulerState::Idle;
        tracing::debug!(start_position = self.start_position, "start load");
        self.tick();
    }

    pub fn stop_load(&mut self) {
        self.loader.abort();
        if let Some(frag) = self.frag_current.take() {
            self.tracker.remove(frag.key());
        }
        self.frag_previous = None;
        self.started = false;
        self.retry_date = None;
        self.state = SchedulerState::Stopped;
        tracing::debug!("stop load");
    }

    /// One pass of the state machine. Runs every 100 ms and after every
    /// relevant event; cheap no-op in the waiting states.
    pub fn tick(&mut self) {
        match self.state {
            SchedulerState::Idle => self.do_tick_idle(),
            SchedulerState::WaitingLevel => {
                if self.levels.current_details().is_some() {
                    tracing::debug!("level details arrived, leaving WaitingLevel");
                    self.state = SchedulerState::Idle;
                }
            }
            SchedulerState::FragLoadingWaitingRetry => {
                let due = self
                    .retry_date
                    .map(|date| Instant::now() >= date)
                    .unwrap_or(true);
                let seeking = self
                    .media
                    .as_ref()
                    .map(|m| m.lock().seeking())
                    .unwrap_or(false);
                if due || seeking {
                    tracing::info!("retry deadline reached, back to fragment selection");
                    self.retry_date = None;
                    self.state = SchedulerState::Idle;
                }
            }
            SchedulerState::BufferFlushing => {
                // a flush invalidates any failure streak
                self.frag_load_error = 0;
            }
            _ => {}
        }
        self.check_buffer();
        self.check_fragment_changed();
    }

    /// Buffered ranges of the attached media element, empty before attach.
    pub(crate) fn media_buffered(&self) -> TimeRanges {
        self.media
            .as_ref()
            .map(|m| m.lock().buffered())
            .unwrap_or_else(TimeRanges::empty)
    }

    // ------------------------------------------------------------------
    // buffer health (runs on every tick)
    // ------------------------------------------------------------------

    fn check_buffer(&mut self) {
        let Some(media) = self.media.clone() else {
            return;
        };
        let (ready_state, current_time, buffered, paused) = {
            let m = media.lock();
            (m.ready_state(), m.current_time(), m.buffered(), m.paused())
        };
        if ready_state < ReadyState::HaveMetadata {
            return;
        }

        if !self.loaded_metadata && !buffered.is_empty() {
            self.loaded_metadata = true;
            let start = self.start_position.max(0.0);
            if (current_time - start).abs() > f64::EPSILON {
                tracing::debug!(start, "first data buffered, seeking to start position");
                media.lock().set_current_time(start);
            }
            self.last_current_time = start;
        } else if self.immediate_switch {
            // waiting for the first post-switch fragment; once it is
            // buffered, nudge the decoder onto the new data and resume
            if buffered.contains(current_time) {
                media
                    .lock()
                    .set_current_time(current_time - IMMEDIATE_SWITCH_NUDGE_SECS);
                if !self.previously_paused && paused {
                    media.lock().play();
                }
                self.immediate_switch = false;
                tracing::debug!("immediate level switch completed");
            }
        } else {
            self.gap.poll(&media, &mut self.bus);
        }
    }

    // ------------------------------------------------------------------
    // fragment change / level switch detection
    // ------------------------------------------------------------------

    fn check_fragment_changed(&mut self) {
        let Some(media) = self.media.as_ref() else {
            return;
        };
        let (ready_state, seeking, current_time) = {
            let m = media.lock();
            (m.ready_state(), m.seeking(), m.current_time())
        };
        if ready_state < ReadyState::HaveCurrentData || seeking {
            return;
        }
        if current_time <= self.last_current_time {
            return;
        }
        self.last_current_time = current_time;

        let playing = self
            .tracker
            .buffered_frag_at(current_time)
            .or_else(|| self.tracker.buffered_frag_at(current_time + 0.1));
        let Some(frag) = playing else {
            return;
        };
        let changed = self
            .frag_playing
            .as_ref()
            .map(|p| p.key() != frag.key())
            .unwrap_or(true);
        if changed {
            let level_changed = self
                .frag_playing
                .as_ref()
                .map(|p| p.level != frag.level)
                .unwrap_or(false);
            tracing::debug!(frag = %frag.key(), "playback progressed into fragment");
            self.bus.emit(Event::FragChanged { frag: frag.key() });
            if level_changed {
                self.bus.emit(Event::LevelSwitched { level: frag.level });
            }
            self.frag_playing = Some(frag);
        }
    }

    // ------------------------------------------------------------------
    // media element callbacks
    // ------------------------------------------------------------------

    pub fn on_media_seeking(&mut self) {
        let Some(media) = self.media.as_ref() else {
            return;
        };
        let current_time = media.lock().current_time();

        if self.state == SchedulerState::Ended {
            // seeking revives a finished stream
            self.state = SchedulerState::Idle;
        }
        if self.state == SchedulerState::FragLoading {
            // abort an in-flight fragment that cannot serve the seek target
            let covers = self.frag_current.as_ref().map(|frag| {
                let tolerance = self.config.max_frag_lookup_tolerance;
                current_time >= frag.start - tolerance
                    && current_time < frag.start + frag.duration + tolerance
            });
            if covers == Some(false) {
                tracing::debug!(current_time, "seek outside in-flight fragment, aborting load");
                self.loader.abort();
                if let Some(frag) = self.frag_current.take() {
                    self.tracker.remove(frag.key());
                }
                self.state = SchedulerState::Idle;
            }
        } else if self.state == SchedulerState::FragLoadingWaitingRetry {
            self.retry_date = None;
            self.state = SchedulerState::Idle;
        }
        if self.loaded_metadata {
            self.next_load_position = current_time;
        }
        self.last_current_time = current_time;
        self.gap.reset();
        self.tick();
    }

    pub fn on_media_seeked(&mut self) {
        if let Some(media) = self.media.as_ref() {
            self.last_current_time = media.lock().current_time();
        }
        self.tick();
    }

    pub fn on_media_ended(&mut self) {
        // restarting playback begins from the start of the stream
        self.start_position = 0.0;
        self.last_current_time = 0.0;
    }

    // ------------------------------------------------------------------
    // event dispatch
    // ------------------------------------------------------------------

    /// Deliver one inbound event. Invalid `(state, event)` pairs are
    /// ignored; duplicate delivery is harmless.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::ManifestLoading => self.on_manifest_loading(),
            Event::ManifestParsed { levels } => self.on_manifest_parsed(levels),
            Event::LevelLoaded { level, details } => self.on_level_loaded(level, details),
            Event::LevelsUpdated { levels } => {
                let current = self.levels.current().min(levels.len().saturating_sub(1));
                self.levels.reset(levels);
                let _ = self.levels.set_current(current);
            }
            Event::KeyLoaded { frag } => self.on_key_loaded(frag),
            Event::FragLoadEmergencyAborted => self.on_frag_load_emergency_aborted(),
            // source buffers exist now; nothing to do until data flows
            Event::BufferCreated { .. } => {}
            Event::BufferAppended {
                parent,
                pending,
                ranges,
            } => self.on_buffer_appended(parent, pending, ranges),
            Event::BufferFlushed => self.on_buffer_flushed(),
            Event::AudioTrackSwitching { id, url } => self.on_audio_track_switching(id, url),
            Event::AudioTrackSwitched { id } => self.on_audio_track_switched(id),
            Event::Error(data) => self.on_error(data),
            // outbound-only events looping back are ignored
            _ => {}
        }
    }

    fn on_manifest_loading(&mut self) {
        tracing::debug!("new manifest loading, resetting stream state");
        self.stop_load();
        self.levels.reset(Vec::new());
        self.tracker.remove_all();
        self.frag_previous = None;
        self.frag_playing = None;
        self.bitrate_test = false;
        self.immediate_switch = false;
        self.alt_audio = false;
        self.init_segment_sent = false;
        self.key_loaded_for = None;
        self.max_max_buffer_length = self.config.max_max_buffer_length;
        self.bus.emit(Event::BufferReset);
    }

    fn on_manifest_parsed(&mut self, levels: Vec<Level>) {
        let auto_start = self.config.start_level.is_none();
        let start_level = self
            .config
            .start_level
            .filter(|&l| l < levels.len())
            .unwrap_or(0);
        self.bitrate_test = auto_start && self.config.test_bandwidth && levels.len() > 1;
        self.levels.reset(levels);
        let _ = self.levels.set_current(start_level);
        self.start_frag_requested = false;
        tracing::info!(
            levels = self.levels.len(),
            start_level,
            bitrate_test = self.bitrate_test,
            "manifest parsed"
        );
        if self.started {
            self.state = SchedulerState::Idle;
            self.tick();
        }
    }

    fn on_level_loaded(&mut self, level: usize, details: crate::level::LevelDetails) {
        let live = details.live;
        match self.levels.on_level_loaded(level, details, &self.config) {
            Ok(_merged) => {}
            Err(err) => {
                tracing::warn!(level, %err, "discarding playlist for unknown level");
                return;
            }
        }
        self.bus.emit(Event::LevelUpdated { level });

        // resolve the start position on the first playlist
        if self.start_position < 0.0 {
            if live {
                if let Some(sync) = self.levels.live_sync_position {
                    self.start_position = sync;
                    self.next_load_position = sync;
                    tracing::debug!(sync, "start position resolved to live sync point");
                }
            } else {
                let offset = self
                    .levels
                    .level(level)
                    .and_then(|l| l.details.as_ref())
                    .and_then(|d| d.start_time_offset)
                    .unwrap_or(0.0);
                self.start_position = offset;
                self.next_load_position = offset;
            }
        }

        if self.state == SchedulerState::WaitingLevel {
            self.state = SchedulerState::Idle;
        }
        self.tick();
    }

    fn on_key_loaded(&mut self, frag: crate::types::FragmentKey) {
        if self.state != SchedulerState::KeyLoading {
            return;
        }
        let pending = self.frag_current.as_ref().map(|f| f.key());
        if pending != Some(frag) {
            tracing::debug!(frag = %frag, "stale key completion discarded");
            return;
        }
        self.key_loaded_for = Some(frag);
        self.state = SchedulerState::Idle;
        self.tick();
    }

    fn on_frag_load_emergency_aborted(&mut self) {
        // the ABR controller already told the loader to abort
        if let Some(frag) = self.frag_current.take() {
            self.tracker.remove(frag.key());
        }
        self.retry_date = None;
        self.frag_load_error = 0;
        self.state = SchedulerState::Idle;
        self.tick();
    }

    fn on_buffer_appended(&mut self, parent: PlaylistKind, pending: usize, ranges: AppendedRanges) {
        if parent != PlaylistKind::Main {
            return;
        }
        if let Some(audio) = &ranges.audio {
            self.tracker.detect_evicted(StreamKind::Audio, audio);
        }
        if let Some(video) = &ranges.video {
            self.tracker.detect_evicted(StreamKind::Video, video);
        }
        if pending == 0 && self.appended && self.state == SchedulerState::Parsed {
            self.on_frag_fully_buffered(ranges);
        }
    }

    fn on_buffer_flushed(&mut self) {
        let buffered = self.media_buffered();
        self.tracker.detect_evicted(StreamKind::Audio, &buffered);
        self.tracker.detect_evicted(StreamKind::Video, &buffered);
        if self.state == SchedulerState::BufferFlushing {
            // fragments on both sides of the flush window are gone; forget
            // the chain so selection starts from the buffer, not from
            // history
            self.frag_previous = None;
            self.state = SchedulerState::Idle;
            self.tick();
        }
    }

    fn on_audio_track_switching(&mut self, id: usize, url: Option<String>) {
        let alt = url.is_some();
        self.pending_audio_switch_alt = alt;
        tracing::debug!(id, alt, "audio track switching");
        if !alt {
            // back to main audio: the muxed stream must regenerate its init
            // segment and restart cleanly from the current position
            self.loader.abort();
            if let Some(frag) = self.frag_current.take() {
                self.tracker.remove(frag.key());
            }
            self.frag_previous = None;
            self.transmuxer.reset_init_segment();
            self.init_segment_sent = false;
            self.alt_audio = false;
            if self.started && self.state != SchedulerState::Stopped {
                self.state = SchedulerState::Idle;
                self.tick();
            }
        }
    }

    fn on_audio_track_switched(&mut self, id: usize) {
        if self.pending_audio_switch_alt {
            // the alternate rendition owns audio now; drop the muxed audio
            // we appended so the two cannot fight over the same range
            self.bus.emit(Event::BufferFlushing {
                start_offset: 0.0,
                end_offset: f64::INFINITY,
                kind: Some(StreamKind::Audio),
            });
            self.alt_audio = true;
        }
        tracing::debug!(id, alt = self.alt_audio, "audio track switched");
        self.tick();
    }

    // ------------------------------------------------------------------
    // error handling and retry
    // ------------------------------------------------------------------

    fn on_error(&mut self, data: ErrorData) {
        // errors scoped to another stream are not ours to recover
        if data.parent == Some(PlaylistKind::Audio) {
            return;
        }
        match data.details {
            details if details.is_fragment_load_error() => self.on_frag_load_error(data),
            ErrorDetails::LevelLoadError | ErrorDetails::LevelLoadTimeout => {
                if data.fatal {
                    self.halt_on_fatal(&data);
                } else if self.state == SchedulerState::WaitingLevel && !data.level_retry {
                    self.state = SchedulerState::Idle;
                }
            }
            ErrorDetails::BufferFullError => self.on_buffer_full_error(),
            ErrorDetails::BufferAppendError => {
                // appends cannot be retried; the sink is in an unknown state
                self.halt_on_fatal(&data);
            }
            _ => {
                if data.fatal {
                    self.halt_on_fatal(&data);
                }
            }
        }
    }

    fn on_frag_load_error(&mut self, data: ErrorData) {
        // only the fragment we have in flight concerns us
        let current = self.frag_current.as_ref().map(|f| f.key());
        if data.frag.is_some() && data.frag != current {
            return;
        }
        if data.fatal {
            self.halt_on_fatal(&data);
            return;
        }
        if let Some(key) = data.frag {
            self.tracker.remove(key);
        }
        // the failed fragment still needs loading; rewind the probe so the
        // retry re-selects it instead of its successor
        if let Some(cur) = &self.frag_current {
            self.next_load_position = self.next_load_position.min(cur.start);
        }
        if self.frag_load_error < self.config.frag_loading_max_retry {
            let delay = retry_delay_ms(self.frag_load_error, &self.config);
            self.retry_date = Some(Instant::now() + Duration::from_millis(delay));
            self.frag_load_error += 1;
            tracing::warn!(
                details = ?data.details,
                attempt = self.frag_load_error,
                delay_ms = delay,
                "fragment load failed, retry scheduled"
            );
            self.state = SchedulerState::FragLoadingWaitingRetry;
        } else {
            tracing::error!(details = ?data.details, "fragment retry budget exhausted");
            let mut fatal = ErrorData::new(data.details);
            fatal.fatal = true;
            fatal.frag = data.frag.or(current);
            fatal.parent = Some(PlaylistKind::Main);
            self.bus.emit(Event::Error(fatal));
            self.state = SchedulerState::Error;
        }
    }

    fn on_buffer_full_error(&mut self) {
        let buffered = self.media_buffered();
        let current_time = self
            .media
            .as_ref()
            .map(|m| m.lock().current_time())
            .unwrap_or(0.0);
        let info = buffer_info(&buffered, current_time, self.config.max_buffer_hole);
        if info.len > 0.0 {
            // the playhead still has data: loading too far ahead, shrink
            // the target window instead of touching the buffer
            if self.reduce_max_buffer_length(self.config.max_buffer_length) {
                self.state = SchedulerState::Idle;
            }
        } else {
            tracing::warn!("buffer full with nothing at the playhead, flushing everything");
            self.loader.abort();
            if let Some(frag) = self.frag_current.take() {
                self.tracker.remove(frag.key());
            }
            self.flush_main_buffer(0.0, f64::INFINITY, None);
        }
    }

    fn halt_on_fatal(&mut self, data: &ErrorData) {
        tracing::error!(details = ?data.details, "fatal error, scheduler halted");
        self.loader.abort();
        self.frag_current = None;
        self.retry_date = None;
        self.state = SchedulerState::Error;
    }

    /// Halve the runtime buffer cap, flooring at the configured target.
    pub(crate) fn reduce_max_buffer_length(&mut self, min_length: f64) -> bool {
        let floor = self.config.max_buffer_length.max(min_length);
        let halved = self.max_max_buffer_length / 2.0;
        if halved >= floor {
            self.max_max_buffer_length = halved;
            tracing::warn!(
                max_max_buffer_length = self.max_max_buffer_length,
                "buffer pressure, halving ahead-buffer cap"
            );
            true
        } else {
            false
        }
    }

    /// Propagate snapshot mutations back to the canonical fragment.
    pub(crate) fn update_canonical(&mut self, frag: &Fragment) {
        if let Some(canonical) = self.levels.fragment_mut(frag.key()) {
            *canonical = frag.clone();
        }
    }
}

/// Backoff before retry `attempt` (zero-based): `2^attempt` times the base
/// delay, capped at the configured maximum.
pub(crate) fn retry_delay_ms(attempt: u32, config: &StreamConfig) -> u64 {
    2u64.saturating_pow(attempt)
        .saturating_mul(config.frag_loading_retry_delay)
        .min(config.frag_loading_max_retry_timeout)
}

/// Drive a scheduler with the standard tick from a tokio task.
///
/// ```ignore
/// let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn(run_ticker(scheduler.clone(), stop_rx));
/// // ... later ...
/// stop_tx.send(true).ok();
/// ```
pub async fn run_ticker(
    scheduler: Arc<parking_lot::Mutex<StreamScheduler>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => scheduler.lock().tick(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let mut config = StreamConfig::default();
        config.frag_loading_retry_delay = 500;
        config.frag_loading_max_retry_timeout = 4000;
        assert_eq!(retry_delay_ms(0, &config), 500);
        assert_eq!(retry_delay_ms(1, &config), 1000);
        assert_eq!(retry_delay_ms(2, &config), 2000);
        assert_eq!(retry_delay_ms(3, &config), 4000);
        // capped from here on
        assert_eq!(retry_delay_ms(4, &config), 4000);
        assert_eq!(retry_delay_ms(10, &config), 4000);
    }
}
