//! Event bus contract.
//!
//! One tagged-variant event type covers everything the core consumes from
//! and emits toward its collaborators. The scheduler receives inbound
//! events through `StreamScheduler::handle_event` and pushes outbound
//! events into its [`EventBus`]; the embedding application drains the bus
//! and routes each event to the collaborator it concerns. Handlers never
//! run concurrently with each other or with a tick, and the scheduler is
//! written to tolerate repeated or stale delivery of any event.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::api::ParsedTrack;
use crate::error::ErrorDetails;
use crate::level::{Level, LevelDetails};
use crate::media::TimeRanges;
use crate::types::{FragmentKey, LoadStats, PlaylistKind, StreamKind};

/// Payload of an `Error` event, inbound or outbound.
#[derive(Debug, Clone)]
pub struct ErrorData {
    pub details: ErrorDetails,
    pub fatal: bool,
    /// Fragment the error is scoped to, when any
    pub frag: Option<FragmentKey>,
    /// Stream the error is scoped to, when any
    pub parent: Option<PlaylistKind>,
    /// For level errors: the playlist collaborator is still retrying on its
    /// own, so the scheduler should keep waiting
    pub level_retry: bool,
}

impl ErrorData {
    pub fn new(details: ErrorDetails) -> Self {
        Self {
            details,
            fatal: false,
            frag: None,
            parent: None,
            level_retry: false,
        }
    }
}

/// Buffered ranges per elementary stream, reported by the buffer sink when
/// an append drains.
#[derive(Debug, Clone, Default)]
pub struct AppendedRanges {
    pub audio: Option<TimeRanges>,
    pub video: Option<TimeRanges>,
}

/// Whether an appended payload is media data or codec-init bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendContent {
    Data,
    InitSegment,
}

/// The event taxonomy between the core and its collaborators.
#[derive(Debug, Clone)]
pub enum Event {
    // -- consumed by the scheduler --
    /// A new manifest fetch started; all per-stream state resets
    ManifestLoading,
    /// Master playlist parsed into quality levels
    ManifestParsed { levels: Vec<Level> },
    /// A level playlist (re)loaded
    LevelLoaded { level: usize, details: LevelDetails },
    /// The level list changed (codec filtering, redundant-stream failover)
    LevelsUpdated { levels: Vec<Level> },
    /// Decryption key for the pending fragment is available
    KeyLoaded { frag: FragmentKey },
    /// ABR aborted the in-flight load to escape a stall
    FragLoadEmergencyAborted,
    /// Buffer sink created its source buffers
    BufferCreated { tracks: Vec<StreamKind> },
    /// One append drained; `pending` appends remain queued
    BufferAppended {
        parent: PlaylistKind,
        pending: usize,
        ranges: AppendedRanges,
    },
    /// A requested flush finished
    BufferFlushed,
    /// Audio track switch requested; `url` is set for alternate renditions
    AudioTrackSwitching { id: usize, url: Option<String> },
    /// Audio track switch committed
    AudioTrackSwitched { id: usize },

    // -- emitted by the scheduler --
    /// Drop all source buffers (manifest reload)
    BufferReset,
    /// Codec declaration for the buffer sink, before the first append
    BufferCodecs { tracks: Vec<ParsedTrack> },
    /// Parsed payload for the buffer sink
    BufferAppending {
        kind: StreamKind,
        data: Bytes,
        parent: PlaylistKind,
        content: AppendContent,
    },
    /// Flush a buffered window
    BufferFlushing {
        start_offset: f64,
        end_offset: f64,
        kind: Option<StreamKind>,
    },
    /// No more fragments will be appended
    BufferEos { kind: Option<StreamKind> },
    /// The pending fragment needs its decryption key
    KeyLoading { frag: FragmentKey },
    /// Playback progressed into a different fragment
    FragChanged { frag: FragmentKey },
    /// A fragment is fully appended and confirmed buffered
    FragBuffered {
        frag: FragmentKey,
        stats: LoadStats,
        id: PlaylistKind,
    },
    /// Transmuxer produced an init segment for this fragment
    FragParsingInitSegment { frag: FragmentKey },
    /// Timed ID3 metadata extracted from the fragment
    FragParsingMetadata { frag: FragmentKey, data: Bytes },
    /// SEI / CEA user data extracted from the fragment
    FragParsingUserdata { frag: FragmentKey, data: Bytes },
    /// First PTS of a discontinuity domain discovered
    InitPtsFound { frag: FragmentKey, init_pts: f64 },
    /// A level's details changed (playlist merge)
    LevelUpdated { level: usize },
    /// Parsed timing shifted a level's timeline
    LevelPtsUpdated { level: usize, drift: f64 },
    /// Playback progressed into a fragment of a different level
    LevelSwitched { level: usize },

    // -- both directions --
    /// Error report; consumed for load failures, emitted for buffer and
    /// stall conditions
    Error(ErrorData),
}

/// Outbound event queue.
///
/// The source inverts control through a dynamic pub/sub bus; here the
/// scheduler owns a queue and the single-threaded embedding drains it
/// after every tick or event delivery.
#[derive(Debug, Default)]
pub struct EventBus {
    queue: VecDeque<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: Event) {
        tracing::trace!(?event, "emit");
        self.queue.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }

    /// Remove and return all queued events, oldest first.
    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_fifo() {
        let mut bus = EventBus::new();
        bus.emit(Event::ManifestLoading);
        bus.emit(Event::BufferReset);
        assert_eq!(bus.len(), 2);
        assert!(matches!(bus.pop(), Some(Event::ManifestLoading)));
        assert!(matches!(bus.pop(), Some(Event::BufferReset)));
        assert!(bus.pop().is_none());
    }

    #[test]
    fn test_bus_drain() {
        let mut bus = EventBus::new();
        bus.emit(Event::BufferFlushed);
        let drained = bus.drain();
        assert_eq!(drained.len(), 1);
        assert!(bus.is_empty());
    }
}
