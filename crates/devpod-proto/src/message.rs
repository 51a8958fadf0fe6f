//! Tunnel request and response messages
//!
//! The agent is the caller on this channel: every [`Request`] originates in the
//! injected agent and every [`Response`] is produced by the operator-side server.

use crate::ProtocolError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Request message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Handshake; must be the first call on a connection
    Ping,

    /// Log line pushed by the agent
    Log {
        /// Severity of the line
        level: LogLevel,
        /// Line text
        message: String,
    },

    /// Ask for the serialized workspace payload
    Workspace,

    /// Deliver the final result of the operation
    SendResult {
        /// JSON encoded result
        result: String,
    },

    /// Stream the local workspace folder as a tar archive
    StreamWorkspace,

    /// Clone the workspace repository on the operator host and stream it
    StreamGitClone,

    /// Stream an allowed local mount as a tar archive
    StreamMount {
        /// Mount name as configured on the operator side
        mount: String,
    },
}

impl Request {
    /// Short name used in logs and error context
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Log { .. } => "log",
            Self::Workspace => "workspace",
            Self::SendResult { .. } => "send-result",
            Self::StreamWorkspace => "stream-workspace",
            Self::StreamGitClone => "stream-git-clone",
            Self::StreamMount { .. } => "stream-mount",
        }
    }

    /// Whether the server answers with a chunk stream
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::StreamWorkspace | Self::StreamGitClone | Self::StreamMount { .. }
        )
    }

    /// Create a log request
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }
}

/// Response message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Acknowledgement without data
    Empty,

    /// Serialized workspace payload
    WorkspaceInfo {
        /// Opaque JSON document
        json: String,
    },

    /// One piece of a streamed archive
    Chunk {
        /// Raw archive bytes
        content: Bytes,
    },
}

/// Log severity. `Done` marks successful completion and is filtered like `Info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    /// Debug output
    Debug,
    /// Informational output
    Info,
    /// Something looks off
    Warning,
    /// Something failed
    Error,
    /// Operation finished successfully
    Done,
}

impl LogLevel {
    /// Ordering used for threshold checks
    pub fn severity(self) -> u8 {
        match self {
            Self::Debug => 0,
            Self::Info | Self::Done => 1,
            Self::Warning => 2,
            Self::Error => 3,
        }
    }

    /// Whether a line at this level passes the given threshold
    pub fn enabled(self, threshold: LogLevel) -> bool {
        self.severity() >= threshold.severity()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// Error details carried by an `ERROR` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Additional context data
    pub context: HashMap<String, String>,
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Invalid request format
    InvalidRequest,
    /// Request arrived before the handshake
    NotReady,
    /// A one-shot operation already happened
    AlreadyExists,
    /// Requested item does not exist
    NotFound,
    /// Access to the requested item is denied
    PermissionDenied,
    /// Operation is not offered by this server
    Unsupported,
    /// Resource exhausted
    ResourceExhausted,
    /// Server-side failure
    Internal,
}

impl ErrorDetails {
    /// Create a new error details
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Context value attached under `key`
    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ErrorDetails {}

/// Encode a message body as MessagePack
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    rmp_serde::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Decode a MessagePack message body
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
