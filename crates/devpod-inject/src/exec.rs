//! Command execution backends
//!
//! [`Exec`] is the one capability the bootstrap and tunnel layers need from a
//! target: run a shell command with attached stdin, stdout and stderr. Local
//! processes, SSH sessions and container exec all implement it the same way.

use crate::ExecError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Boxed stdin source handed to a backend
pub type ExecReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed stdout/stderr sink handed to a backend
pub type ExecWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Run a command somewhere.
///
/// Implementations must kill the command when `cancel` fires and shut
/// `stdout` down once the command exits, so readers observe end of stream.
/// A non-zero exit is reported as [`ExecError::Exit`].
#[async_trait]
pub trait Exec: Send + Sync {
    /// Run `command` through a POSIX shell on the target
    async fn exec(
        &self,
        cancel: CancellationToken,
        command: &str,
        stdin: Option<ExecReader>,
        stdout: ExecWriter,
        stderr: ExecWriter,
    ) -> Result<(), ExecError>;
}

#[async_trait]
impl<T: Exec + ?Sized> Exec for Arc<T> {
    async fn exec(
        &self,
        cancel: CancellationToken,
        command: &str,
        stdin: Option<ExecReader>,
        stdout: ExecWriter,
        stderr: ExecWriter,
    ) -> Result<(), ExecError> {
        (**self).exec(cancel, command, stdin, stdout, stderr).await
    }
}

/// Run `command` and collect its stdout. Stderr is attached to exit errors.
pub async fn exec_output(
    exec: &dyn Exec,
    cancel: CancellationToken,
    command: &str,
    stdin: Option<ExecReader>,
) -> Result<String, ExecError> {
    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();

    exec.exec(
        cancel,
        command,
        stdin,
        Box::new(stdout.clone()),
        Box::new(stderr.clone()),
    )
    .await
    .map_err(|e| e.with_stderr(stderr.to_string_lossy()))?;

    Ok(stdout.to_string_lossy())
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Spawn `command` and pump its stdio until it exits or `cancel` fires
async fn run_process(
    mut command: Command,
    cancel: CancellationToken,
    stdin: Option<ExecReader>,
    mut stdout: ExecWriter,
    mut stderr: ExecWriter,
) -> Result<(), ExecError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|source| ExecError::Spawn { program, source })?;

    let feeder = match (stdin, child.stdin.take()) {
        (Some(mut input), Some(mut pipe)) => Some(tokio::spawn(async move {
            let copied = tokio::io::copy(&mut input, &mut pipe).await;
            let _ = pipe.shutdown().await;
            copied
        })),
        _ => None,
    };

    let child_stdout = child.stdout.take();
    let child_stderr = child.stderr.take();

    let pump_stdout = async move {
        if let Some(mut out) = child_stdout {
            if let Err(e) = tokio::io::copy(&mut out, &mut stdout).await {
                trace!(error = %e, "stdout pump stopped");
            }
        }
        let _ = stdout.shutdown().await;
    };
    let pump_stderr = async move {
        if let Some(mut err) = child_stderr {
            if let Err(e) = tokio::io::copy(&mut err, &mut stderr).await {
                trace!(error = %e, "stderr pump stopped");
            }
        }
        let _ = stderr.flush().await;
    };

    // the child moves in here; dropping this future kills it
    let run = async move {
        let (status, (), ()) = tokio::join!(child.wait(), pump_stdout, pump_stderr);
        status
    };

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("command cancelled, killing process");
            if let Some(feeder) = feeder {
                feeder.abort();
            }
            return Err(ExecError::Cancelled);
        }
        status = run => status?,
    };

    if let Some(feeder) = feeder {
        if feeder.is_finished() {
            if let Ok(Err(e)) = feeder.await {
                // a failed feed only matters if the command did not notice
                if status.success() {
                    return Err(ExecError::Io(e));
                }
            }
        } else {
            feeder.abort();
        }
    }

    if status.success() {
        Ok(())
    } else {
        Err(ExecError::Exit {
            code: status.code(),
            stderr: String::new(),
        })
    }
}

/// Run commands on the local host through `sh -c`
#[derive(Debug, Clone, Default)]
pub struct LocalExec {
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl LocalExec {
    /// Create a local executor
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable for every command
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Run commands from `dir`
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Exec for LocalExec {
    async fn exec(
        &self,
        cancel: CancellationToken,
        command: &str,
        stdin: Option<ExecReader>,
        stdout: ExecWriter,
        stderr: ExecWriter,
    ) -> Result<(), ExecError> {
        debug!(command, "running local command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).envs(&self.env);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        run_process(cmd, cancel, stdin, stdout, stderr).await
    }
}

/// SSH configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// SSH key path
    pub key_path: Option<PathBuf>,
    /// SSH options
    pub options: HashMap<String, String>,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            key_path: None,
            options: HashMap::new(),
            connect_timeout: 30,
        }
    }
}

impl SshConfig {
    /// Parse `[user@]host[:port]`
    pub fn from_target(target: &str) -> Self {
        let mut config = Self::default();
        let mut host = target;

        if let Some((user, rest)) = target.split_once('@') {
            config.username = user.to_string();
            host = rest;
        }

        if let Some((name, port)) = host.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                config.port = port;
                host = name;
            }
        }

        config.host = host.to_string();
        config
    }

    /// Build SSH command arguments, without the remote command
    pub fn build_ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout),
            "-p".to_string(),
            self.port.to_string(),
        ];

        if let Some(key_path) = &self.key_path {
            args.push("-i".to_string());
            args.push(key_path.to_string_lossy().to_string());
        }

        // sorted so the command line is stable
        let mut options: Vec<_> = self.options.iter().collect();
        options.sort();
        for (key, value) in options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(format!("{}@{}", self.username, self.host));
        args
    }
}

/// Run commands over an `ssh` subprocess
#[derive(Debug, Clone)]
pub struct SshExec {
    config: SshConfig,
    program: String,
}

impl SshExec {
    /// Create an SSH executor
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            program: "ssh".to_string(),
        }
    }

    /// Use a different ssh client binary
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// SSH configuration
    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

#[async_trait]
impl Exec for SshExec {
    async fn exec(
        &self,
        cancel: CancellationToken,
        command: &str,
        stdin: Option<ExecReader>,
        stdout: ExecWriter,
        stderr: ExecWriter,
    ) -> Result<(), ExecError> {
        let args = self.config.build_ssh_args();
        debug!("Executing SSH command: {} {} {}", self.program, args.join(" "), command);

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).arg(command);
        run_process(cmd, cancel, stdin, stdout, stderr).await
    }
}

/// Run commands inside a running container through `docker exec`
#[derive(Debug, Clone)]
pub struct DockerExec {
    container: String,
    user: Option<String>,
    program: String,
}

impl DockerExec {
    /// Create an executor for `container`
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            user: None,
            program: "docker".to_string(),
        }
    }

    /// Run as `user` inside the container
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Use a different container CLI (e.g. `podman`)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn build_args(&self, command: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "-i".to_string()];
        if let Some(user) = &self.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        args.push(self.container.clone());
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
        args
    }
}

#[async_trait]
impl Exec for DockerExec {
    async fn exec(
        &self,
        cancel: CancellationToken,
        command: &str,
        stdin: Option<ExecReader>,
        stdout: ExecWriter,
        stderr: ExecWriter,
    ) -> Result<(), ExecError> {
        debug!(container = %self.container, command, "running container command");
        let mut cmd = Command::new(&self.program);
        cmd.args(self.build_args(command));
        run_process(cmd, cancel, stdin, stdout, stderr).await
    }
}

/// In-memory sink shared between clones
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Contents as text
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
