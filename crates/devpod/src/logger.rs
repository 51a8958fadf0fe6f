//! Logging through the control channel
//!
//! The agent's stdout is the transport, so its progress reaches the operator
//! as log calls. Lines below the active level never leave the process.

use crate::client::ControlPlaneClient;
use crate::server::emit_agent_log;
use async_trait::async_trait;
use devpod_proto::LogLevel;
use tracing::trace;

/// Leveled log sink
#[async_trait]
pub trait Logger: Send + Sync {
    /// Lowest level that is written
    fn level(&self) -> LogLevel;

    /// Write one line unconditionally
    async fn write(&self, level: LogLevel, message: &str);

    /// Write `message` if `level` passes the threshold
    async fn log(&self, level: LogLevel, message: &str) {
        if level.enabled(self.level()) {
            self.write(level, message).await;
        }
    }

    /// Log at debug level
    async fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message).await
    }

    /// Log at info level
    async fn info(&self, message: &str) {
        self.log(LogLevel::Info, message).await
    }

    /// Log at warning level
    async fn warn(&self, message: &str) {
        self.log(LogLevel::Warning, message).await
    }

    /// Log at error level
    async fn error(&self, message: &str) {
        self.log(LogLevel::Error, message).await
    }

    /// Report successful completion
    async fn done(&self, message: &str) {
        self.log(LogLevel::Done, message).await
    }
}

/// Sends log lines to the operator as log calls
#[derive(Debug, Clone)]
pub struct TunnelLogger {
    client: ControlPlaneClient,
    level: LogLevel,
}

impl TunnelLogger {
    /// Log through `client` at `level` and above
    pub fn new(client: ControlPlaneClient, level: LogLevel) -> Self {
        Self { client, level }
    }
}

#[async_trait]
impl Logger for TunnelLogger {
    fn level(&self) -> LogLevel {
        self.level
    }

    async fn write(&self, level: LogLevel, message: &str) {
        // losing a line must not fail the operation
        if let Err(e) = self.client.log(level, message).await {
            trace!(%level, "log line not delivered: {}", e);
        }
    }
}

/// Writes log lines to the local tracing subscriber
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    level: LogLevel,
}

impl TracingLogger {
    /// Log at `level` and above
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl Logger for TracingLogger {
    fn level(&self) -> LogLevel {
        self.level
    }

    async fn write(&self, level: LogLevel, message: &str) {
        emit_agent_log(level, message);
    }
}
