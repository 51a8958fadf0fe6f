//! # devpod protocol
//!
//! Wire-level building blocks of the devpod control channel: length-prefixed
//! MessagePack frames, the tunnel request/response messages, the per-call
//! stream multiplexer and the stdio stream adapter that turns a reader/writer
//! pair into a connection.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Tunnel request and response messages
pub mod message;

/// Frame codec for async streams
pub mod codec;

/// Per-call stream multiplexing
pub mod stream;

/// Stdio stream adapter
pub mod stdio;

/// Error types for protocol operations
pub mod error;

pub use codec::{FrameCodec, FrameWriter};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags};
pub use message::{ErrorCode, ErrorDetails, LogLevel, Request, Response};
pub use stdio::StdioStream;
pub use stream::{FlowControlConfig, SendWindow, StreamHandle, StreamMultiplexer, StreamState};
