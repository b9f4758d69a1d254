//! Crate-wide error taxonomy.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the session core.
///
/// Variants map onto the error taxonomy named by the design: configuration,
/// transport, codec, filter, validation, processor and task-runner errors
/// are distinct so callers can match on kind instead of parsing messages.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The session is missing a required input or output transport, or
    /// some other precondition of `Serve` was not met.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A transport's `Next`/`Send` failed for a reason other than EOF.
    #[error("transport error on {transport}: {message}")]
    Transport { transport: String, message: String },

    /// A codec name was not found in the registry.
    #[error("codec not supported: {0}")]
    CodecNotSupported(String),

    /// A decoder function returned an error.
    #[error("decode error: {0}")]
    Decode(String),

    /// An encoder function returned an error.
    #[error("encode error: {0}")]
    Encode(String),

    /// A filter rejected or failed on a packet.
    #[error("filter error: {0}")]
    Filter(String),

    /// The built-in packet validator rejected a packet.
    #[error("validation error: {0}")]
    Validation(String),

    /// A processor's `Process` call returned an error.
    #[error("processor {name} failed: {message}")]
    Processor { name: String, message: String },

    /// The task runner's executor exceeded its timeout.
    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The task runner's work queue is unavailable (pool stopped or absent).
    #[error("task queue unavailable: {0}")]
    TaskQueueUnavailable(String),

    /// Passthrough for ambient I/O failures (e.g. a host loading
    /// `SessionConfig` from a file before handing it to the session).
    #[error("io error: {0}")]
    Io(String),

    /// Passthrough for ambient (de)serialization failures.
    #[error("serialization error: {0}")]
    Json(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

impl Error {
    /// `true` for errors that should terminate the transport loop that
    /// raised them (decode/encode/filter/transport), `false` for errors
    /// that are reported but do not halt the pipeline (validation,
    /// processor).
    pub fn is_fatal_to_loop(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::Decode(_) | Error::Encode(_) | Error::Filter(_)
        )
    }
}
