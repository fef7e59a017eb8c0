use thiserror::Error;

/// Main error type for the HLS client core
#[derive(Error, Debug)]
pub enum HlsClientError {
    /// A standard I/O error (config file loading)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed from TOML
    #[error("TOML config error: {0}")]
    TomlConfig(#[from] toml::de::Error),

    /// Configuration could not be parsed from JSON
    #[error("JSON config error: {0}")]
    JsonConfig(#[from] serde_json::Error),

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A level index outside the known level list was referenced
    #[error("Level not found: level={level}, known={known}")]
    LevelNotFound { level: usize, known: usize },

    /// A fragment referenced by `(level, sn)` is not in the level's window
    #[error("Fragment not found: level={level}, sn={sn}")]
    FragmentNotFound { level: usize, sn: u64 },

    /// An operation that needs an attached media element ran without one
    #[error("No media element attached")]
    NoMedia,

    /// A playlist update violated a data-model invariant
    #[error("Invalid playlist: {0}")]
    InvalidPlaylist(String),
}

/// Error taxonomy carried on the event bus.
///
/// These are the `details` of an `Error` event, split along the recovery
/// strategies of the scheduler: transient fragment/key errors are retried
/// with exponential backoff, transient level errors re-enter IDLE, buffer
/// pressure shrinks or flushes the ahead-buffer, and anything marked fatal
/// halts the scheduler until an explicit restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDetails {
    /// Fragment body could not be fetched
    FragLoadError,
    /// Fragment fetch exceeded the loader's deadline
    FragLoadTimeout,
    /// Decryption key could not be fetched
    KeyLoadError,
    /// Key fetch exceeded the loader's deadline
    KeyLoadTimeout,
    /// Level playlist could not be refreshed
    LevelLoadError,
    /// Level playlist refresh exceeded the loader's deadline
    LevelLoadTimeout,
    /// The buffer sink rejected an append because the media buffer is full
    BufferFullError,
    /// The buffer sink failed to append parsed data
    BufferAppendError,
    /// Gap controller skipped the playhead over an unrecoverable hole
    BufferSeekOverHole,
    /// Gap controller nudged a stalled playhead inside a buffered range
    BufferNudgeOnStall,
    /// Playback stalled and the nudge budget is exhausted
    BufferStalledError,
    /// Fragment retry budget exhausted or unrecoverable internal state
    InternalException,
}

impl ErrorDetails {
    /// True for fragment-scoped load failures that follow the
    /// retry/backoff envelope.
    pub fn is_fragment_load_error(&self) -> bool {
        matches!(
            self,
            ErrorDetails::FragLoadError
                | ErrorDetails::FragLoadTimeout
                | ErrorDetails::KeyLoadError
                | ErrorDetails::KeyLoadTimeout
        )
    }
}

pub type Result<T> = std::result::Result<T, HlsClientError>;
