//! Error types
//!
//! Control-plane calls (attach, kick, stat) surface [`HubError`]. Media parsing
//! failures surface [`MediaError`] and are normally logged and dropped by the
//! hub rather than propagated. Relay connectors report [`RelayError`].

/// Errors from stream-group control operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// A producer of some variant is already attached to the group
    #[error("stream {stream} already has a producer: {existing}")]
    ProducerAlreadyPresent { stream: String, existing: String },

    /// The session id does not carry a known (protocol, role) prefix
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// The group has been disposed and accepts no new sessions
    #[error("group disposed: {0}")]
    Disposed(String),
}

/// Errors from media parsing and remuxing
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("invalid AVC packet")]
    InvalidAvcPacket,

    #[error("invalid HEVC packet")]
    InvalidHevcPacket,

    #[error("invalid AAC packet")]
    InvalidAacPacket,

    /// A NAL unit length prefix points past the end of the payload
    #[error("truncated NAL unit: need {needed} bytes, have {available}")]
    TruncatedNalu { needed: usize, available: usize },

    /// An audio frame arrived before the audio specific config
    #[error("audio frame before audio config")]
    MissingAudioConfig,

    #[error("empty payload")]
    EmptyPayload,
}

/// Errors from relay pull/push connections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("relay stream to {url} ended: {reason}")]
    Stream { url: String, reason: String },

    /// Tick was driven from outside a tokio runtime, so no task could be spawned
    #[error("no async runtime available to run relay task")]
    NoRuntime,

    #[error("relay is not configured")]
    NotConfigured,
}

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;
