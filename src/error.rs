//! Error types for the capture relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed control messages from the producer.
///
/// These are recovered locally by the decoder: the offending line is
/// dropped and decoding resumes at the next delimiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Control line is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    #[error("Message has no \"type\" field")]
    MissingType,

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("Control line exceeds {0} bytes without a delimiter")]
    LineTooLong(usize),
}

/// Commands rejected before anything is written to the producer
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Invalid process id: {0:?}")]
    InvalidPid(String),

    #[error("A capture is already in progress for pid {0}")]
    CaptureInProgress(u32),
}

/// Failures of the byte channel to or from the producer process
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to spawn producer {path}: {reason}")]
    Spawn { path: String, reason: String },

    #[error("Producer channel is closed")]
    ChannelClosed,

    #[error("Write to producer failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("Read from producer failed: {0}")]
    ReadFailed(#[source] std::io::Error),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Audio output errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::CpalError(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
