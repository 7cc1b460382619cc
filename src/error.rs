//! Error types for rsocket-mux.

use thiserror::Error;

/// Failure to turn bytes into a frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer bytes are available than the frame declares. Buffer more and retry.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// The bytes can never form a valid frame. Fatal for the connection.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::Malformed(reason.into())
    }
}

/// Main error type for all rsocket-mux operations.
#[derive(Debug, Error)]
pub enum RSocketError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Frame codec failure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Locally detected misuse of the protocol (bad request-n, oversized route, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame illegal for the current state of a stream.
    #[error("Protocol violation on stream {stream_id}: {reason}")]
    ProtocolViolation { stream_id: u32, reason: String },

    /// PAYLOAD received while the granted credit was exhausted.
    #[error("Flow control violation on stream {stream_id}")]
    FlowControlViolation { stream_id: u32 },

    /// No handler registered for the route.
    #[error("No handler for route: {0}")]
    NoSuchRoute(String),

    /// Route registered twice.
    #[error("Route already registered: {0}")]
    DuplicateRoute(String),

    /// The route exists but its handler cannot serve this interaction model.
    #[error("Route {route} does not support {model}")]
    ModelMismatch { route: String, model: &'static str },

    /// A handler failed while producing its result.
    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    /// Every stream id of the local parity is in use.
    #[error("Stream id space exhausted")]
    IdSpaceExhausted,

    /// Stream id not present in the stream table.
    #[error("Stream {0} not found")]
    StreamNotFound(u32),

    /// ERROR frame received from the peer.
    #[error("Remote error 0x{code:03X}: {message}")]
    Remote { code: u32, message: String },

    /// The stream was cancelled before it produced a result.
    #[error("Stream cancelled")]
    Cancelled,

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl RSocketError {
    /// Build a handler failure from any message.
    pub fn handler(message: impl Into<String>) -> Self {
        RSocketError::HandlerFailure(message.into())
    }

    pub(crate) fn violation(stream_id: u32, reason: impl Into<String>) -> Self {
        RSocketError::ProtocolViolation {
            stream_id,
            reason: reason.into(),
        }
    }

    /// Error code to put on the wire when this error ends a stream.
    pub fn wire_code(&self) -> u32 {
        use crate::protocol::error_code;

        match self {
            RSocketError::NoSuchRoute(_) | RSocketError::ModelMismatch { .. } => {
                error_code::INVALID
            }
            RSocketError::Remote { code, .. } => *code,
            RSocketError::Cancelled => error_code::CANCELED,
            _ => error_code::APPLICATION_ERROR,
        }
    }

    /// Message to put on the wire when this error ends a stream.
    pub fn wire_message(&self) -> String {
        match self {
            RSocketError::HandlerFailure(message) => message.clone(),
            RSocketError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using RSocketError.
pub type Result<T> = std::result::Result<T, RSocketError>;
