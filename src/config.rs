//! Scheduler configuration
//!
//! All tunables recognized by the scheduling core, loadable from TOML or
//! JSON. Durations are seconds unless the field name says otherwise.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{HlsClientError, Result};

/// Configuration for the stream scheduler and its helper components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Target ahead-buffer in seconds. The scheduler stops requesting
    /// fragments once this much media is buffered past the playhead.
    pub max_buffer_length: f64,

    /// Hard cap on the ahead-buffer in seconds. Halved at runtime when the
    /// buffer sink reports a full buffer (never below `max_buffer_length`).
    pub max_max_buffer_length: f64,

    /// Ahead-buffer cap in bytes, converted to seconds through the current
    /// level bitrate.
    pub max_buffer_size: u64,

    /// Maximum gap in seconds between buffered ranges that is still treated
    /// as contiguous.
    pub max_buffer_hole: f64,

    /// Slack in seconds around fragment boundaries when matching a buffer
    /// end position to a fragment.
    pub max_frag_lookup_tolerance: f64,

    /// Target latency behind the live edge in seconds. When unset, the
    /// latency is `live_sync_duration_count` target durations.
    pub live_sync_duration: Option<f64>,

    /// Target latency behind the live edge in fragment target durations.
    pub live_sync_duration_count: u32,

    /// Latency in seconds past which playback jumps back to the sync
    /// position. When unset, derived from `live_max_latency_duration_count`.
    pub live_max_latency_duration: Option<f64>,

    /// Catch-up threshold in fragment target durations. Unset means no
    /// latency bound.
    pub live_max_latency_duration_count: Option<u32>,

    /// Minimum number of fragments a live playlist must hold before the
    /// first fragment is requested.
    pub initial_live_manifest_size: usize,

    /// Allow the first fragment fetch before a media element is attached.
    pub start_frag_prefetch: bool,

    /// Forced start level. `None` selects automatically.
    pub start_level: Option<usize>,

    /// When the start level is automatic, load the first fragment of level 0
    /// as a bandwidth probe before committing to a level.
    pub test_bandwidth: bool,

    /// Number of retries for a failed fragment or key load before the error
    /// escalates to fatal.
    pub frag_loading_max_retry: u32,

    /// Initial retry delay in milliseconds; doubled on each attempt.
    pub frag_loading_retry_delay: u64,

    /// Upper bound on the retry delay in milliseconds.
    pub frag_loading_max_retry_timeout: u64,

    /// Overrides the audio codec declared by the level playlist.
    pub default_audio_codec: Option<String>,

    /// Initial playback position in seconds. `None` means start of stream
    /// for VoD and the live sync position for live.
    pub start_position: Option<f64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffer_length: 30.0,
            max_max_buffer_length: 600.0,
            max_buffer_size: 60 * 1000 * 1000, // 60 MB
            max_buffer_hole: 0.5,
            max_frag_lookup_tolerance: 0.25,
            live_sync_duration: None,
            live_sync_duration_count: 3,
            live_max_latency_duration: None,
            live_max_latency_duration_count: None,
            initial_live_manifest_size: 1,
            start_frag_prefetch: false,
            start_level: None,
            test_bandwidth: true,
            frag_loading_max_retry: 6,
            frag_loading_retry_delay: 1000,
            frag_loading_max_retry_timeout: 64000,
            default_audio_codec: None,
            start_position: None,
        }
    }
}

impl StreamConfig {
    /// Load configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: StreamConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: StreamConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Check cross-field consistency.
    ///
    /// The catch-up threshold must sit strictly beyond the sync target,
    /// otherwise the scheduler would oscillate between seeking to the sync
    /// position and immediately being over the latency bound again.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_length <= 0.0 {
            return Err(HlsClientError::Config(
                "max_buffer_length must be positive".into(),
            ));
        }
        if self.max_max_buffer_length < self.max_buffer_length {
            return Err(HlsClientError::Config(
                "max_max_buffer_length must be >= max_buffer_length".into(),
            ));
        }
        if self.max_buffer_hole < 0.0 {
            return Err(HlsClientError::Config("max_buffer_hole must be >= 0".into()));
        }
        if let Some(count) = self.live_max_latency_duration_count {
            if count <= self.live_sync_duration_count {
                return Err(HlsClientError::Config(
                    "live_max_latency_duration_count must be > live_sync_duration_count".into(),
                ));
            }
        }
        if let (Some(max), Some(sync)) = (self.live_max_latency_duration, self.live_sync_duration) {
            if max <= sync {
                return Err(HlsClientError::Config(
                    "live_max_latency_duration must be > live_sync_duration".into(),
                ));
            }
        }
        Ok(())
    }

    /// Target latency behind the live edge, in seconds.
    pub fn live_sync_target(&self, target_duration: f64) -> f64 {
        self.live_sync_duration
            .unwrap_or(self.live_sync_duration_count as f64 * target_duration)
    }

    /// Latency bound behind the live edge, in seconds, if one is configured.
    pub fn live_max_latency(&self, target_duration: f64) -> Option<f64> {
        self.live_max_latency_duration
            .or_else(|| {
                self.live_max_latency_duration_count
                    .map(|c| c as f64 * target_duration)
            })
    }
}
