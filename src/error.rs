//! Error types for the voxlink client

use thiserror::Error;

use crate::connection::ConnectionState;

/// Result type alias for voxlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voxlink client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Opening or writing to the duplex channel failed
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame was sent while the channel is not open
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection is already live or pending
    #[error("connection already {0}")]
    AlreadyConnected(ConnectionState),

    /// No pong has been seen within the staleness window
    #[error("link degraded: no pong for {stale_for_ms} ms")]
    DegradedLink {
        /// Milliseconds since the last pong (or since the monitor started)
        stale_for_ms: u64,
    },

    /// Microphone acquisition or recorder failure
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Malformed inbound frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Decoding or playing a chunk failed
    #[error(transparent)]
    Playback(#[from] PlaybackError),

    /// Audio output is locked by the runtime and needs a user gesture
    #[error("playback blocked for message {message_id} after {attempts} unlock attempts")]
    PlaybackBlocked {
        /// Message waiting for output
        message_id: String,
        /// Failed unlock attempts so far
        attempts: u32,
    },

    /// Encoding captured audio failed
    #[error("audio codec error: {0}")]
    Codec(String),

    /// `send_audio` was called with no finished utterance
    #[error("no finished recording to send")]
    NoRecording,

    /// The client actor has shut down
    #[error("client closed")]
    ClientClosed,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid endpoint URL
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

/// Microphone acquisition failures, distinguished so the caller can tell the
/// user what to do about each one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The user or the OS refused microphone access
    #[error("microphone permission denied: allow microphone access to use voice input")]
    PermissionDenied,

    /// No input device is present
    #[error("no microphone device found")]
    DeviceNotFound,

    /// The device exists but another application holds it
    #[error("microphone is in use by another application: close it and retry")]
    DeviceBusy,

    /// The requested capture constraints cannot be satisfied
    #[error("audio constraints not supported: {0}")]
    ConstraintsUnsupported(String),

    /// Any other capture failure
    #[error("audio input unavailable: {0}")]
    Unavailable(String),
}

/// Failures while decoding or playing one audio chunk
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    /// Payload could not be decoded
    #[error("audio decode error: {0}")]
    Decode(String),

    /// Output device failure
    #[error("audio output error: {0}")]
    Output(String),

    /// Runtime refused autonomous output
    #[error("audio output blocked until user interaction")]
    Blocked,
}
