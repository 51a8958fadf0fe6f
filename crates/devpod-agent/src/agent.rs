//! Remote side of `devpod up`
//!
//! Runs on the workspace host with stdin/stdout wired to the operator's
//! control plane. Everything the agent wants to say goes through the channel;
//! tracing output stays on stderr.

use crate::cli::AgentUpArgs;
use anyhow::{Context, Result};
use devpod::proto::LogLevel;
use devpod::{receive_directory, ControlPlaneClient, Logger, TransferStage, TunnelLogger, WorkspaceInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// How the workspace content reached this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentSource {
    /// Cloned here
    RemoteClone,
    /// Cloned on the operator host and streamed
    StreamedClone,
    /// Streamed from the operator's local folder
    StreamedFolder,
}

/// Result reported to the operator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    /// Where the content landed
    pub target_dir: PathBuf,
    /// How it got there
    pub content_source: ContentSource,
    /// The workspace payload the agent worked on
    pub workspace: serde_json::Value,
}

/// Serve `agent up`: connect back over stdio, place the content, report the result
pub async fn run_up(args: AgentUpArgs, level: LogLevel) -> Result<()> {
    let client = ControlPlaneClient::from_stdio(true, Duration::from_secs(args.ping_timeout))
        .await
        .context("ping client")?;
    let logger = TunnelLogger::new(client.clone(), level);

    let outcome = prepare(&client, &logger, &args).await;
    if let Err(e) = &outcome {
        logger.error(&format!("{:#}", e)).await;
    }
    outcome
}

async fn prepare(client: &ControlPlaneClient, logger: &dyn Logger, args: &AgentUpArgs) -> Result<()> {
    let workspace = match &args.workspace_info {
        Some(encoded) => WorkspaceInfo::decode(encoded).context("decode workspace info")?,
        None => client.workspace().await.context("fetch workspace info")?,
    };

    tokio::fs::create_dir_all(&args.target_dir)
        .await
        .with_context(|| format!("create {}", args.target_dir.display()))?;
    logger
        .info(&format!("Preparing workspace in {}", args.target_dir.display()))
        .await;

    let content_source = match &args.git_repository {
        Some(repository) => {
            match clone_here(repository, args.git_branch.as_deref(), &args.target_dir).await {
                Ok(()) => ContentSource::RemoteClone,
                Err(e) => {
                    logger
                        .warn(&format!(
                            "git clone on the workspace host failed ({:#}), streaming a local clone instead",
                            e
                        ))
                        .await;
                    let reader = client.stream_git_clone().await?;
                    receive_directory(reader, &args.target_dir, TransferStage::LocalCloning).await?;
                    ContentSource::StreamedClone
                }
            }
        }
        None => {
            let reader = client.stream_workspace().await?;
            receive_directory(reader, &args.target_dir, TransferStage::ReadWorkspace).await?;
            ContentSource::StreamedFolder
        }
    };
    debug!(?content_source, "workspace content in place");

    let result = AgentResult {
        target_dir: args.target_dir.clone(),
        content_source,
        workspace: workspace.parse()?,
    };
    client
        .send_result(serde_json::to_string(&result)?)
        .await
        .context("send result")?;

    logger.done("Workspace is ready").await;
    Ok(())
}

async fn clone_here(repository: &str, branch: Option<&str>, target: &Path) -> Result<()> {
    let mut command = Command::new("git");
    command.args(["clone", "--depth", "1"]);
    if let Some(branch) = branch {
        command.args(["--branch", branch]);
    }
    command.arg(repository).arg(target);

    let output = command.output().await.context("run git")?;
    if !output.status.success() {
        anyhow::bail!(
            "git clone exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
