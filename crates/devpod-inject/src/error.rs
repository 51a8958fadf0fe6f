//! Error types for execution and agent bootstrap

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of a command run through an [`Exec`](crate::Exec) backend
#[derive(Debug, Error)]
pub enum ExecError {
    /// The backend program could not be started
    #[error("failed to start {program}")]
    Spawn {
        /// Program that failed to start
        program: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The command ran and exited unsuccessfully
    #[error("{}", exit_message(.code, .stderr))]
    Exit {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// Captured stderr, if the caller collected it
        stderr: String,
    },

    /// The cancellation token fired and the process was killed
    #[error("command cancelled")]
    Cancelled,

    /// Feeding stdin failed
    #[error("process I/O error")]
    Io(#[from] io::Error),
}

impl ExecError {
    /// Attach captured stderr to an exit error
    pub fn with_stderr(self, captured: impl Into<String>) -> Self {
        match self {
            Self::Exit { code, .. } => Self::Exit {
                code,
                stderr: captured.into(),
            },
            other => other,
        }
    }

    /// Exit code of an [`ExecError::Exit`]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => *code,
            _ => None,
        }
    }
}

fn exit_message(code: &Option<i32>, stderr: &str) -> String {
    let status = match code {
        Some(code) => format!("command exited with status {}", code),
        None => "command was killed by a signal".to_string(),
    };
    let stderr = stderr.trim();
    if stderr.is_empty() {
        status
    } else {
        format!("{}: {}", status, stderr)
    }
}

/// Failure while fetching an agent binary
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The HTTP client could not be built
    #[error("build http client")]
    Client(#[source] reqwest::Error),

    /// The request failed, on the last client tried
    #[error("request {url}")]
    Request {
        /// Artifact URL
        url: String,
        /// Error of the last attempt
        #[source]
        source: reqwest::Error,
    },

    /// The download could not be stored in the cache
    #[error("write cache file {}", .path.display())]
    Cache {
        /// File being written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Bootstrap step an error happened in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Checking whether the agent is already installed
    Probe,
    /// Finding out the remote CPU architecture
    DetectArch,
    /// Obtaining the binary bytes
    Download,
    /// Copying the binary to the target
    Upload,
    /// Starting the agent command
    Launch,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Probe => "probe",
            Self::DetectArch => "architecture-detect",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Launch => "launch",
        };
        f.write_str(name)
    }
}

/// Agent bootstrap errors, each tagged with its [`Phase`]
#[derive(Debug, Error)]
pub enum InjectError {
    /// Probe command could not be run
    #[error("probe agent at {path}")]
    Probe {
        /// Remote agent path
        path: String,
        /// Last probe failure
        #[source]
        source: ExecError,
    },

    /// `uname -m` failed
    #[error("detect remote architecture")]
    DetectArch(#[source] ExecError),

    /// The remote reported an architecture no agent is built for
    #[error("unsupported remote architecture {machine:?}")]
    UnsupportedArch {
        /// Output of `uname -m`
        machine: String,
    },

    /// Download failed
    #[error("download devpod")]
    Download(#[source] DownloadError),

    /// The target could not download the agent itself
    #[error("download agent on target from {url}")]
    RemoteDownload {
        /// Artifact URL
        url: String,
        /// Output of the failed download command
        #[source]
        source: ExecError,
    },

    /// The binary could not be read locally
    #[error("open agent binary {}", .path.display())]
    OpenBinary {
        /// File that was opened
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Copying the binary to the target failed
    #[error("upload agent to {path}")]
    Upload {
        /// Remote agent path
        path: String,
        /// Underlying error
        #[source]
        source: ExecError,
    },

    /// The agent command failed
    #[error("launch agent")]
    Launch(#[source] ExecError),

    /// The shared bootstrap deadline passed
    #[error("{phase} timed out after {timeout:?}")]
    Timeout {
        /// Phase that was running
        phase: Phase,
        /// Configured timeout
        timeout: Duration,
    },
}

impl InjectError {
    /// Phase this error belongs to
    pub fn phase(&self) -> Phase {
        match self {
            Self::Probe { .. } => Phase::Probe,
            Self::DetectArch(_) | Self::UnsupportedArch { .. } => Phase::DetectArch,
            Self::Download(_) | Self::RemoteDownload { .. } | Self::OpenBinary { .. } => Phase::Download,
            Self::Upload { .. } => Phase::Upload,
            Self::Launch(_) => Phase::Launch,
            Self::Timeout { phase, .. } => *phase,
        }
    }

    /// Whether the failure came from the cancellation token
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Probe { source: ExecError::Cancelled, .. }
                | Self::DetectArch(ExecError::Cancelled)
                | Self::RemoteDownload { source: ExecError::Cancelled, .. }
                | Self::Upload { source: ExecError::Cancelled, .. }
                | Self::Launch(ExecError::Cancelled)
        )
    }
}
