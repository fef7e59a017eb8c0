//! Core data model for the scheduling core.
//!
//! Fragments are identified by `(level, sn)`. The canonical `Fragment` for a
//! given key lives in its level's `LevelDetails`; every other component holds
//! either a `FragmentKey` or a cloned snapshot and resolves back through the
//! level store when it needs to mutate.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a fragment: quality level index plus the sequence number
/// within that level's playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    /// Index into the level list
    pub level: usize,
    /// Media sequence number, monotone within a level
    pub sn: u64,
}

impl std::fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.level, self.sn)
    }
}

/// Which playlist a fragment or buffer operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    /// Main (video or muxed audio+video) stream
    Main,
    /// Alternate audio rendition
    Audio,
}

/// A source-buffer / elementary-stream identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Audio,
    Video,
}

/// Which elementary streams a parsed fragment actually carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ElementaryStreams {
    pub audio: bool,
    pub video: bool,
}

impl ElementaryStreams {
    pub fn contains(&self, kind: StreamKind) -> bool {
        match kind {
            StreamKind::Audio => self.audio,
            StreamKind::Video => self.video,
        }
    }
}

/// Timing and byte counters for one fragment load, in milliseconds since the
/// Unix epoch. `loaded`/`total` are byte counts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadStats {
    /// Load requested
    pub trequest: Option<u64>,
    /// First byte received
    pub tfirst: Option<u64>,
    /// Last byte received
    pub tload: Option<u64>,
    /// Transmux finished
    pub tparsed: Option<u64>,
    /// All source-buffer appends drained
    pub tbuffered: Option<u64>,
    /// Bytes received so far
    pub loaded: u64,
    /// Total bytes, when known up front
    pub total: u64,
}

/// Milliseconds since the Unix epoch, for `LoadStats` stamps.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One media fragment of one quality level.
///
/// Playlist-derived fields are set by the playlist collaborator; the
/// PTS/DTS block is filled in after transmux and refined on every reload.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Owning level index
    pub level: usize,
    /// Sequence number, contiguous from `start_sn` to `end_sn` in a level
    pub sn: u64,
    /// Discontinuity counter, non-decreasing along the playlist
    pub cc: u32,
    /// Playlist-relative start time in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Fetch URL
    pub url: String,
    /// True when the payload needs a decryption key before parsing
    pub encrypted: bool,
    /// Wall-clock timestamp of the first sample, when the playlist carries
    /// EXT-X-PROGRAM-DATE-TIME
    pub program_date_time: Option<DateTime<Utc>>,

    /// First presentation timestamp observed by the transmuxer
    pub start_pts: Option<f64>,
    /// Last presentation timestamp observed by the transmuxer
    pub end_pts: Option<f64>,
    /// First decode timestamp
    pub start_dts: Option<f64>,
    /// Last decode timestamp
    pub end_dts: Option<f64>,
    /// Latest of the per-track start PTS values; flush windows for smooth
    /// level switches start here
    pub max_start_pts: Option<f64>,
    /// Gap between audio and video start PTS
    pub delta_pts: f64,
    /// Video frames dropped before the first keyframe
    pub dropped: u32,
    /// Set while the predecessor is being reloaded to recover a keyframe;
    /// cleared only by a successful reload without drops
    pub backtracked: bool,
    /// Streams the parsed payload actually contained
    pub elementary_streams: ElementaryStreams,
    /// Load/parse/append timing and byte counters
    pub stats: LoadStats,
    /// True when this load is a bandwidth probe that will not be buffered
    pub bitrate_test: bool,
}

impl Fragment {
    pub fn new(level: usize, sn: u64, cc: u32, start: f64, duration: f64, url: String) -> Self {
        Self {
            level,
            sn,
            cc,
            start,
            duration,
            url,
            encrypted: false,
            program_date_time: None,
            start_pts: None,
            end_pts: None,
            start_dts: None,
            end_dts: None,
            max_start_pts: None,
            delta_pts: 0.0,
            dropped: 0,
            backtracked: false,
            elementary_streams: ElementaryStreams::default(),
            stats: LoadStats::default(),
            bitrate_test: false,
        }
    }

    pub fn key(&self) -> FragmentKey {
        FragmentKey {
            level: self.level,
            sn: self.sn,
        }
    }

    /// Playlist-relative end time.
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }

    /// Wall-clock timestamp just past the last sample.
    pub fn end_program_date_time(&self) -> Option<DateTime<Utc>> {
        self.program_date_time
            .map(|pdt| pdt + ChronoDuration::milliseconds((self.duration * 1000.0) as i64))
    }

    /// Start of the time range the parsed payload covers. Falls back to the
    /// playlist start before the first parse.
    pub fn effective_start(&self) -> f64 {
        self.start_pts.unwrap_or(self.start)
    }

    /// End of the time range the parsed payload covers.
    pub fn effective_end(&self) -> f64 {
        self.end_pts.unwrap_or(self.start + self.duration)
    }
}

/// Codec-init bytes required before media fragments of a level can be
/// decoded (EXT-X-MAP). `data` is filled in by the fragment loader.
#[derive(Debug, Clone)]
pub struct InitSegment {
    pub url: String,
    pub data: Option<Bytes>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fragment_end() {
        let frag = Fragment::new(0, 10, 0, 40.0, 4.0, "f10.ts".into());
        assert_eq!(frag.end(), 44.0);
        assert_eq!(frag.effective_start(), 40.0);
        assert_eq!(frag.effective_end(), 44.0);
    }

    #[test]
    fn test_fragment_effective_range_prefers_pts() {
        let mut frag = Fragment::new(0, 10, 0, 40.0, 4.0, "f10.ts".into());
        frag.start_pts = Some(40.2);
        frag.end_pts = Some(44.1);
        assert_eq!(frag.effective_start(), 40.2);
        assert_eq!(frag.effective_end(), 44.1);
    }

    #[test]
    fn test_end_program_date_time() {
        let mut frag = Fragment::new(0, 1, 0, 0.0, 6.0, "f1.ts".into());
        let pdt = Utc.with_ymd_and_hms(2023, 5, 1, 12, 0, 0).unwrap();
        frag.program_date_time = Some(pdt);
        let end = frag.end_program_date_time().unwrap();
        assert_eq!((end - pdt).num_milliseconds(), 6000);
    }
}
