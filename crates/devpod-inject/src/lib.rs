//! # devpod inject
//!
//! Command execution backends and the agent bootstrap that runs over them.
//! Nothing here assumes inbound reachability of a target: probing, uploading
//! and launching all ride on one [`Exec`] capability.

#![warn(missing_docs)]

/// Command execution backends
pub mod exec;

/// Agent bootstrap
pub mod inject;

/// Agent binary download cache
pub mod download;

/// Error types
pub mod error;

pub use download::{artifact_url, BinaryCache, Fallback, Fetch, HttpFetcher, ReqwestFetcher};
pub use error::{DownloadError, ExecError, InjectError, Phase};
pub use exec::{
    exec_output, shell_quote, DockerExec, Exec, ExecReader, ExecWriter, LocalExec, OutputBuffer, SshConfig,
    SshExec,
};
pub use inject::{
    download_script, probe_script, Arch, InjectConfig, InjectOutcome, Injector, DEFAULT_DOWNLOAD_URL, DEFAULT_REMOTE_PATH,
    DOWNLOAD_URL_ENV,
};
