//! Agent bootstrap over an [`Exec`] channel

use crate::download::{artifact_url, BinaryCache, Fetch, HttpFetcher};
use crate::exec::{exec_output, shell_quote, Exec, ExecReader, ExecWriter};
use crate::{ExecError, InjectError, Phase};
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Install location of the agent on targets
pub const DEFAULT_REMOTE_PATH: &str = "/tmp/devpod";

/// Release location agent builds are downloaded from
pub const DEFAULT_DOWNLOAD_URL: &str = "https://github.com/loft-sh/devpod/releases/latest/download";

/// Environment variable overriding the download location
pub const DOWNLOAD_URL_ENV: &str = "DEVPOD_AGENT_URL";

const PROBE_ATTEMPTS: usize = 3;

/// CPU architecture an agent is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86-64
    Amd64,
    /// 64-bit ARM
    Arm64,
}

impl Arch {
    /// Map `uname -m` output to an architecture
    pub fn from_uname(machine: &str) -> Option<Self> {
        match machine.trim().to_ascii_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Some(Self::Amd64),
            "aarch64" | "arm64" | "armv8" | "armv8l" | "aarch64_be" => Some(Self::Arm64),
            _ => None,
        }
    }

    /// Architecture of the running process
    pub fn host() -> Option<Self> {
        Self::from_uname(std::env::consts::ARCH)
    }

    /// Name used in artifact names
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bootstrap settings
#[derive(Debug, Clone)]
pub struct InjectConfig {
    /// Install path on the target
    pub remote_path: String,
    /// Base URL of agent builds
    pub download_url: String,
    /// Local download cache
    pub cache_dir: PathBuf,
    /// Let the target download the agent before trying to copy it over
    pub prefer_download: bool,
    /// Deadline shared by probe, detection, download and upload
    pub timeout: Duration,
    /// Skip architecture detection
    pub force_arch: Option<Arch>,
    /// Binary used for self-copy, defaults to the running executable
    pub local_binary: Option<PathBuf>,
}

impl Default for InjectConfig {
    fn default() -> Self {
        let download_url = std::env::var(DOWNLOAD_URL_ENV)
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_DOWNLOAD_URL.to_string());

        Self {
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            download_url,
            cache_dir: std::env::temp_dir().join("devpod-cache"),
            prefer_download: false,
            timeout: Duration::from_secs(300),
            force_arch: None,
            local_binary: None,
        }
    }
}

impl InjectConfig {
    /// Set the install path
    pub fn with_remote_path(mut self, path: impl Into<String>) -> Self {
        self.remote_path = path.into();
        self
    }

    /// Set the download base URL
    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    /// Set the cache directory
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Prefer a download on the target over copying the binary
    pub fn with_prefer_download(mut self, prefer: bool) -> Self {
        self.prefer_download = prefer;
        self
    }

    /// Set the bootstrap deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Force the target architecture
    pub fn with_force_arch(mut self, arch: Arch) -> Self {
        self.force_arch = Some(arch);
        self
    }

    /// Use this binary for self-copy
    pub fn with_local_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_binary = Some(path.into());
        self
    }
}

/// Shell test that succeeds when the agent at `path` is missing or broken
pub fn probe_script(path: &str) -> String {
    format!(
        r#"[ "$({} version >/dev/null 2>&1 && echo true || echo false)" = "false" ]"#,
        shell_quote(path)
    )
}

/// Shell command making the target fetch the agent at `url` into `path`
/// with curl, or wget when curl is missing
pub fn download_script(url: &str, path: &str) -> String {
    let staging = shell_quote(&format!("{}.{}", path, Uuid::new_v4().simple()));
    format!(
        "(curl -fsSL {url} -o {staging} || wget -q -O {staging} {url}) && chmod +x {staging} && mv -f {staging} {target} || {{ rm -f {staging}; exit 1; }}",
        url = shell_quote(url),
        staging = staging,
        target = shell_quote(path)
    )
}

/// What [`Injector::inject`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    /// The probe found a working agent
    AlreadyInstalled,
    /// A binary was uploaded
    Installed {
        /// Architecture of the uploaded build
        arch: Arch,
    },
    /// The target downloaded the build itself
    Downloaded {
        /// Architecture of the downloaded build
        arch: Arch,
    },
}

/// Makes sure a working agent exists on a target and starts it
#[derive(Debug)]
pub struct Injector<F = HttpFetcher> {
    config: InjectConfig,
    cache: BinaryCache<F>,
}

impl Injector<HttpFetcher> {
    /// Create an injector downloading over HTTP
    pub fn new(config: InjectConfig) -> Result<Self, InjectError> {
        let fetcher = HttpFetcher::with_tls_fallback().map_err(InjectError::Download)?;
        Ok(Self::with_fetcher(config, fetcher))
    }
}

impl<F: Fetch> Injector<F> {
    /// Create an injector with a custom artifact source
    pub fn with_fetcher(config: InjectConfig, fetcher: F) -> Self {
        let cache = BinaryCache::new(config.cache_dir.clone(), config.download_url.clone(), fetcher);
        Self { config, cache }
    }

    /// Bootstrap settings
    pub fn config(&self) -> &InjectConfig {
        &self.config
    }

    /// Shell command running the installed agent with `args`
    pub fn agent_command<S: AsRef<str>>(&self, args: &[S]) -> String {
        let mut command = shell_quote(&self.config.remote_path);
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg.as_ref()));
        }
        command
    }

    /// Ensure the agent is installed. An installed agent costs one probe and
    /// nothing else.
    pub async fn inject(&self, exec: &dyn Exec, cancel: &CancellationToken) -> Result<InjectOutcome, InjectError> {
        let deadline = Instant::now() + self.config.timeout;

        let install_needed = self.phase(deadline, Phase::Probe, self.probe(exec, cancel)).await?;
        if !install_needed {
            debug!(path = %self.config.remote_path, "agent already installed");
            return Ok(InjectOutcome::AlreadyInstalled);
        }

        let arch = match self.config.force_arch {
            Some(arch) => arch,
            None => {
                self.phase(deadline, Phase::DetectArch, detect_arch(exec, cancel))
                    .await?
            }
        };

        let outcome = if self.config.prefer_download {
            match self.download_on_target(exec, cancel, deadline, arch).await {
                Ok(()) => InjectOutcome::Downloaded { arch },
                Err(e) if is_final(&e) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "download on target failed, copying agent instead");
                    self.copy(exec, cancel, deadline, arch).await?;
                    InjectOutcome::Installed { arch }
                }
            }
        } else {
            match self.copy(exec, cancel, deadline, arch).await {
                Ok(()) => InjectOutcome::Installed { arch },
                Err(e) if is_final(&e) => return Err(e),
                Err(e) => {
                    warn!(error = %e, "copying agent failed, downloading on target instead");
                    self.download_on_target(exec, cancel, deadline, arch).await?;
                    InjectOutcome::Downloaded { arch }
                }
            }
        };

        info!(path = %self.config.remote_path, %arch, ?outcome, "installed devpod agent");
        Ok(outcome)
    }

    /// Run the installed agent with `args`. Only cancellation bounds this.
    pub async fn launch<S: AsRef<str>>(
        &self,
        exec: &dyn Exec,
        cancel: CancellationToken,
        args: &[S],
        stdin: Option<ExecReader>,
        stdout: ExecWriter,
        stderr: ExecWriter,
    ) -> Result<(), InjectError> {
        let command = self.agent_command(args);
        debug!(%command, "launching agent");
        exec.exec(cancel, &command, stdin, stdout, stderr)
            .await
            .map_err(InjectError::Launch)
    }

    async fn phase<T>(
        &self,
        deadline: Instant,
        phase: Phase,
        work: impl Future<Output = Result<T, InjectError>>,
    ) -> Result<T, InjectError> {
        match tokio::time::timeout_at(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(InjectError::Timeout {
                phase,
                timeout: self.config.timeout,
            }),
        }
    }

    /// `true` when the agent has to be installed
    async fn probe(&self, exec: &dyn Exec, cancel: &CancellationToken) -> Result<bool, InjectError> {
        let script = probe_script(&self.config.remote_path);
        let mut last_error = None;

        for attempt in 1..=PROBE_ATTEMPTS {
            match exec_output(exec, cancel.clone(), &script, None).await {
                Ok(_) => return Ok(true),
                Err(ExecError::Exit { code: Some(1), .. }) => return Ok(false),
                Err(ExecError::Cancelled) => {
                    last_error = Some(ExecError::Cancelled);
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "agent probe failed");
                    last_error = Some(e);
                }
            }
        }

        Err(InjectError::Probe {
            path: self.config.remote_path.clone(),
            source: last_error.unwrap_or(ExecError::Cancelled),
        })
    }

    /// Obtain the binary locally and stream it over
    async fn copy(
        &self,
        exec: &dyn Exec,
        cancel: &CancellationToken,
        deadline: Instant,
        arch: Arch,
    ) -> Result<(), InjectError> {
        let binary = self.phase(deadline, Phase::Download, self.obtain_binary(arch)).await?;
        self.phase(deadline, Phase::Upload, self.upload(exec, cancel, binary))
            .await
    }

    /// Have the target fetch its own build
    async fn download_on_target(
        &self,
        exec: &dyn Exec,
        cancel: &CancellationToken,
        deadline: Instant,
        arch: Arch,
    ) -> Result<(), InjectError> {
        let url = artifact_url(&self.config.download_url, arch);
        let script = download_script(&url, &self.config.remote_path);
        info!(%url, path = %self.config.remote_path, "downloading devpod agent on target");

        let work = async {
            exec_output(exec, cancel.clone(), &script, None)
                .await
                .map(|_| ())
                .map_err(|source| InjectError::RemoteDownload { url, source })
        };
        self.phase(deadline, Phase::Download, work).await
    }

    /// Self-copy when the host can run the target's build, download otherwise
    async fn obtain_binary(&self, arch: Arch) -> Result<Bytes, InjectError> {
        let self_copy = cfg!(target_os = "linux") && Arch::host() == Some(arch);

        if self.config.prefer_download || !self_copy {
            match self.cache.fetch(arch).await {
                Ok(path) => return read_binary(path).await,
                Err(e) if self_copy => {
                    warn!(error = %e, "download failed, copying local binary instead");
                }
                Err(e) => return Err(InjectError::Download(e)),
            }
        }

        let path = match &self.config.local_binary {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|source| InjectError::OpenBinary {
                path: PathBuf::from("/proc/self/exe"),
                source,
            })?,
        };
        read_binary(path).await
    }

    async fn upload(&self, exec: &dyn Exec, cancel: &CancellationToken, binary: Bytes) -> Result<(), InjectError> {
        let target = shell_quote(&self.config.remote_path);
        let staging = shell_quote(&format!("{}.{}", self.config.remote_path, Uuid::new_v4().simple()));
        let command = format!(
            "cat > {staging} && chmod +x {staging} && mv -f {staging} {target}",
            staging = staging,
            target = target
        );

        info!(bytes = binary.len(), path = %self.config.remote_path, "uploading devpod agent");
        let stdin: ExecReader = Box::new(std::io::Cursor::new(binary));
        exec_output(exec, cancel.clone(), &command, Some(stdin))
            .await
            .map(|_| ())
            .map_err(|source| InjectError::Upload {
                path: self.config.remote_path.clone(),
                source,
            })
    }
}

/// Errors no second install path can recover from
fn is_final(error: &InjectError) -> bool {
    error.is_cancelled() || matches!(error, InjectError::Timeout { .. })
}

/// The one place the target architecture is decided
async fn detect_arch(exec: &dyn Exec, cancel: &CancellationToken) -> Result<Arch, InjectError> {
    let machine = exec_output(exec, cancel.clone(), "uname -m", None)
        .await
        .map_err(InjectError::DetectArch)?;

    let arch = Arch::from_uname(&machine).ok_or_else(|| InjectError::UnsupportedArch {
        machine: machine.trim().to_string(),
    })?;
    debug!(%arch, "detected remote architecture");
    Ok(arch)
}

async fn read_binary(path: PathBuf) -> Result<Bytes, InjectError> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(source) => Err(InjectError::OpenBinary { path, source }),
    }
}
