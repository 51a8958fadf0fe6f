//! Error types for protocol operations

use crate::message::{ErrorCode, ErrorDetails};
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid frame format
    #[error("invalid frame format")]
    InvalidFrame,

    /// Frame too large
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// The transport went away; every in-flight call fails with this
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid stream ID
    #[error("invalid stream ID: {0}")]
    InvalidStreamId(u32),

    /// Frame arrived out of order on a stream
    #[error("out of order frame on stream {stream_id}: expected sequence {expected}, got {actual}")]
    OutOfOrder {
        /// Stream the frame belongs to
        stream_id: u32,
        /// Sequence number the stream expected next
        expected: u32,
        /// Sequence number that arrived
        actual: u32,
    },

    /// The peer sent more than its window allowed
    #[error("flow control violation on stream {0}")]
    FlowControlViolation(u32),

    /// Transport I/O failure
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    /// The peer answered the call with an error
    #[error(transparent)]
    Remote(ErrorDetails),

    /// The peer answered with a response that does not fit the call
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ProtocolError {
    /// Whether the error means the transport itself is gone
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}

impl From<ErrorDetails> for ProtocolError {
    fn from(details: ErrorDetails) -> Self {
        Self::Remote(details)
    }
}

impl From<&ProtocolError> for ErrorDetails {
    fn from(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Serialization(msg) => ErrorDetails::new(ErrorCode::InvalidRequest, msg.clone()),
            ProtocolError::InvalidFrame | ProtocolError::InvalidStreamId(_) | ProtocolError::OutOfOrder { .. } => {
                ErrorDetails::new(ErrorCode::InvalidRequest, error.to_string())
            }
            ProtocolError::FrameTooLarge { .. } | ProtocolError::FlowControlViolation(_) => {
                ErrorDetails::new(ErrorCode::ResourceExhausted, error.to_string())
            }
            ProtocolError::Remote(details) => details.clone(),
            ProtocolError::ConnectionClosed | ProtocolError::Io(_) | ProtocolError::UnexpectedResponse(_) => {
                ErrorDetails::new(ErrorCode::Internal, error.to_string())
            }
        }
    }
}
