//! # devpod
//!
//! Agent bootstrap and the control channel between the operator CLI and the
//! agent it injects into a workspace host.
//!
//! Roles on the channel are inverted compared to a usual network service:
//! the operator CLI cannot be reached from the target, so it hosts the
//! [`ControlPlaneServer`] on the stdio of the agent process it spawned, and
//! the agent uses a [`ControlPlaneClient`] to call back inward over that pipe.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use devpod_inject as inject;
pub use devpod_proto as proto;

/// Error types
pub mod error;

/// Workspace payload and source description
pub mod workspace;

/// Operator-side control plane server
pub mod server;

/// Agent-side control plane client
pub mod client;

/// Logging through the control channel
pub mod logger;

/// Directory transfer over chunk streams
pub mod transfer;

/// One agent invocation end to end
pub mod session;

pub use client::{ChunkReader, ControlPlaneClient};
pub use error::TunnelError;
pub use logger::{Logger, TracingLogger, TunnelLogger};
pub use server::{ChunkSink, ControlPlaneServer, Handshake, TunnelService, WorkspaceTunnel};
pub use session::{Session, SessionBuilder, SessionConfig, SessionSummary};
pub use transfer::{receive_directory, send_directory, TransferStage};
pub use workspace::{WorkspaceInfo, WorkspaceSource};

/// Result type alias for devpod operations
pub type Result<T> = std::result::Result<T, TunnelError>;
