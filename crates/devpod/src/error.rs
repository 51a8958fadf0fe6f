//! Error types for the devpod library

use crate::transfer::TransferStage;
use devpod_inject::{ExecError, InjectError};
use devpod_proto::{ErrorDetails, ProtocolError};
use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for devpod operations
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The agent never completed the ping round trip
    #[error("ping client: agent did not reach the server within {timeout:?}")]
    HandshakeTimeout {
        /// Configured ping timeout
        timeout: Duration,
    },

    /// The ping round trip failed for another reason
    #[error("ping client: agent failed to launch or reach the server")]
    Handshake {
        /// What went wrong
        #[source]
        source: BoxError,
    },

    /// The transport went away
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed traffic on the control channel
    #[error("control channel protocol error")]
    Protocol(#[source] ProtocolError),

    /// The other side answered the call with an error
    #[error(transparent)]
    Remote(ErrorDetails),

    /// Bootstrapping the agent failed
    #[error("bootstrap agent ({} phase)", .0.phase())]
    Inject(#[from] InjectError),

    /// The agent command failed after the handshake
    #[error("agent command failed")]
    Agent(#[source] ExecError),

    /// Directory transfer failed
    #[error("{stage}")]
    Transfer {
        /// Stage that failed
        stage: TransferStage,
        /// Underlying error
        #[source]
        source: BoxError,
    },

    /// Local I/O error
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The session was cancelled
    #[error("session cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Whether this is the "agent did not start" class of failure
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::HandshakeTimeout { .. } | Self::Handshake { .. })
    }

    /// Wrap `source` as a failure of `stage`
    pub fn transfer(stage: TransferStage, source: impl Into<BoxError>) -> Self {
        Self::Transfer {
            stage,
            source: source.into(),
        }
    }
}

impl From<ProtocolError> for TunnelError {
    fn from(error: ProtocolError) -> Self {
        match error {
            ProtocolError::ConnectionClosed => Self::ConnectionClosed,
            ProtocolError::Remote(details) => Self::Remote(details),
            other => Self::Protocol(other),
        }
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}
