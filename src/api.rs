//! Collaborator interfaces.
//!
//! The scheduling core never performs I/O. Fetching and transmuxing are
//! asynchronous collaborators: the core issues work through these traits
//! and receives completions later, as calls back into the scheduler
//! (`on_frag_loaded`, `on_init_segment_loaded`, `on_transmux_complete`) or
//! as `Error` events on the bus. Every completion carries the `(level, sn)`
//! it belongs to; the scheduler drops completions that no longer match the
//! in-flight context.

use bytes::Bytes;

use crate::types::{Fragment, FragmentKey, LoadStats, StreamKind};

/// Fetches fragment and init-segment payloads.
///
/// At most one fragment load is in flight per scheduler at any time.
pub trait FragmentLoader: Send {
    /// Begin fetching a media fragment.
    fn load_fragment(&mut self, frag: &Fragment);

    /// Begin fetching a level's init segment.
    fn load_init_segment(&mut self, level: usize, url: &str);

    /// Abort the in-flight load, if any. Completions delivered after an
    /// abort are discarded by the context check.
    fn abort(&mut self);
}

/// A completed fragment fetch.
#[derive(Debug, Clone)]
pub struct FragLoadResult {
    pub key: FragmentKey,
    pub payload: Bytes,
    pub stats: LoadStats,
}

/// Repackages fetched payloads (MPEG-TS or fMP4) into appendable tracks.
pub trait Transmuxer: Send {
    /// Feed a fetched fragment payload. The result arrives later via
    /// `StreamScheduler::on_transmux_complete`.
    fn push(&mut self, frag: &Fragment, payload: Bytes);

    /// Drop codec state so the next pushed fragment regenerates its init
    /// segment (audio track switches, detach).
    fn reset_init_segment(&mut self);
}

/// One remuxed elementary-stream payload of a fragment.
#[derive(Debug, Clone)]
pub struct RemuxedTrack {
    pub kind: StreamKind,
    pub data: Bytes,
    pub start_pts: f64,
    pub end_pts: f64,
    pub start_dts: f64,
    pub end_dts: f64,
    /// Frames discarded before the first keyframe (video only)
    pub dropped: u32,
}

/// Codec initialization data produced by the transmuxer.
#[derive(Debug, Clone)]
pub struct ParsedInitSegment {
    pub tracks: Vec<ParsedTrack>,
}

/// One track declaration inside a parsed init segment.
#[derive(Debug, Clone)]
pub struct ParsedTrack {
    pub kind: StreamKind,
    /// RFC 6381 codec string, e.g. `avc1.64001f`
    pub codec: String,
    /// Container the payload will be appended as, e.g. `mp4`
    pub container: String,
    pub data: Bytes,
}

/// Everything the transmuxer produced for one fragment.
#[derive(Debug, Clone)]
pub struct TransmuxResult {
    /// Fragment this result belongs to; checked against the in-flight load
    pub key: FragmentKey,
    /// Present when codec state was (re)generated
    pub init_segment: Option<ParsedInitSegment>,
    pub audio: Option<RemuxedTrack>,
    pub video: Option<RemuxedTrack>,
    /// Timed ID3 payloads, forwarded opaquely
    pub metadata: Option<Bytes>,
    /// Closed-caption / SEI user data, forwarded opaquely
    pub userdata: Option<Bytes>,
    /// First PTS of the discontinuity domain, when newly discovered
    pub init_pts: Option<f64>,
}

impl TransmuxResult {
    pub fn new(key: FragmentKey) -> Self {
        Self {
            key,
            init_segment: None,
            audio: None,
            video: None,
            metadata: None,
            userdata: None,
            init_pts: None,
        }
    }
}
