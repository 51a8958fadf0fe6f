//! Operator side of `devpod up`

use crate::cli::UpArgs;
use anyhow::{bail, Context, Result};
use devpod::inject::{DockerExec, Exec, InjectConfig, LocalExec, SshConfig, SshExec};
use devpod::{ControlPlaneServer, SessionBuilder, WorkspaceInfo, WorkspaceSource, WorkspaceTunnel};
use serde_json::json;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where the agent runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// This host
    Local,
    /// `[user@]host[:port]` over ssh
    Ssh(String),
    /// A running container
    Docker(String),
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(target: &str) -> Result<Self> {
        if target == "local" {
            return Ok(Self::Local);
        }
        if let Some(host) = target.strip_prefix("ssh://").filter(|host| !host.is_empty()) {
            return Ok(Self::Ssh(host.to_string()));
        }
        if let Some(container) = target.strip_prefix("docker://").filter(|c| !c.is_empty()) {
            return Ok(Self::Docker(container.to_string()));
        }
        bail!(
            "unsupported target {:?}, expected local, ssh://[user@]host[:port] or docker://container",
            target
        )
    }
}

impl Target {
    /// Command execution backend reaching this target
    pub fn exec(&self, args: &UpArgs) -> Box<dyn Exec> {
        match self {
            Self::Local => Box::new(LocalExec::new()),
            Self::Ssh(host) => {
                let mut config = SshConfig::from_target(host);
                config.key_path = args.identity_file.clone();
                Box::new(SshExec::new(config))
            }
            Self::Docker(container) => {
                let mut exec = DockerExec::new(container.clone());
                if let Some(user) = &args.user {
                    exec = exec.with_user(user.clone());
                }
                Box::new(exec)
            }
        }
    }
}

/// Content source selected by the flags
pub fn workspace_source(args: &UpArgs) -> Result<WorkspaceSource> {
    if let Some(repository) = &args.git_repository {
        return Ok(WorkspaceSource::git(repository.clone(), args.git_branch.clone()));
    }

    let folder = match &args.source {
        Some(folder) => folder.clone(),
        None => std::env::current_dir().context("resolve current directory")?,
    };
    let folder = folder
        .canonicalize()
        .with_context(|| format!("resolve source folder {}", folder.display()))?;
    Ok(WorkspaceSource::local_folder(folder))
}

/// Arguments for `agent up` on the target
pub fn agent_args(args: &UpArgs, workspace: &WorkspaceInfo, debug: bool) -> Result<Vec<String>> {
    let mut agent_args = vec![
        "agent".to_string(),
        "up".to_string(),
        "--target-dir".to_string(),
        args.target_dir.clone(),
        "--workspace-info".to_string(),
        workspace.encode()?,
        "--ping-timeout".to_string(),
        args.ping_timeout.to_string(),
    ];
    if let Some(repository) = &args.git_repository {
        agent_args.push("--git-repository".to_string());
        agent_args.push(repository.clone());
    }
    if let Some(branch) = &args.git_branch {
        agent_args.push("--git-branch".to_string());
        agent_args.push(branch.clone());
    }
    if debug {
        agent_args.push("--debug".to_string());
    }
    Ok(agent_args)
}

/// Bootstrap the agent on the target, serve it and print its result
pub async fn run(args: UpArgs, debug: bool) -> Result<()> {
    let target: Target = args.target.parse()?;
    let source = workspace_source(&args)?;

    let id = args.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let workspace = WorkspaceInfo::from_value(&json!({
        "id": id,
        "source": {
            "localFolder": source.local_folder,
            "gitRepository": source.git_repository,
            "gitBranch": source.git_branch,
        },
        "targetDir": args.target_dir,
    }));

    let mut inject = InjectConfig::default()
        .with_remote_path(args.agent_path.clone())
        .with_prefer_download(args.prefer_download)
        .with_timeout(Duration::from_secs(args.timeout));
    if let Some(url) = &args.download_url {
        inject = inject.with_download_url(url.clone());
    }

    let session = SessionBuilder::new()
        .with_inject(inject)
        .with_bootstrap(!args.no_inject)
        .with_ping_timeout(Duration::from_secs(args.ping_timeout))
        .with_agent_args(agent_args(&args, &workspace, debug)?)
        .build()?;

    let server = ControlPlaneServer::new(WorkspaceTunnel::new().with_workspace(workspace).with_source(source));
    let exec = target.exec(&args);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping agent");
            interrupt.cancel();
        }
    });

    let summary = session.run(exec.as_ref(), &server, cancel).await?;
    if let Some(outcome) = summary.bootstrap {
        debug!(?outcome, "bootstrap finished");
    }

    let result = server
        .service()
        .take_result()
        .context("agent finished without sending a result")?;
    println!("{}", result);
    Ok(())
}
