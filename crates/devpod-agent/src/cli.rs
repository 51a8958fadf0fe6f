//! Command line of the `devpod` binary
//!
//! `up` runs on the operator's machine. `agent up` is what the operator
//! launches on the target once the agent is installed.

use clap::{Args, Parser, Subcommand};
use devpod::inject::DEFAULT_REMOTE_PATH;
use std::path::PathBuf;

/// Top-level arguments
#[derive(Parser, Debug)]
#[command(name = "devpod")]
#[command(about = "Bootstrap the devpod agent on a workspace host and talk to it over stdio", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,

    /// Print full error chains
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Log debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Operator commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the version
    Version,

    /// Prepare a workspace on a target host
    Up(UpArgs),

    /// Commands run by the injected agent
    Agent {
        /// Agent side command
        #[command(subcommand)]
        command: AgentCommands,
    },
}

/// Commands only the injected agent runs
#[derive(Subcommand, Debug)]
pub enum AgentCommands {
    /// Receive the workspace content on this host
    Up(AgentUpArgs),
}

/// Arguments of `devpod up`: the target, the content source and the
/// bootstrap settings
#[derive(Args, Debug, Clone)]
pub struct UpArgs {
    /// Where to run the agent: local, ssh://[user@]host[:port] or docker://container
    #[arg(long, default_value = "local")]
    pub target: String,

    /// Local folder with the workspace content, defaults to the current directory
    #[arg(long, conflicts_with = "git_repository")]
    pub source: Option<PathBuf>,

    /// Repository to check out instead of a local folder
    #[arg(long)]
    pub git_repository: Option<String>,

    /// Branch of the repository
    #[arg(long, requires = "git_repository")]
    pub git_branch: Option<String>,

    /// Directory on the target receiving the content
    #[arg(long, default_value = "/tmp/devpod-workspace")]
    pub target_dir: String,

    /// Workspace id, random when omitted
    #[arg(long)]
    pub id: Option<String>,

    /// Agent install path on the target
    #[arg(long, default_value = DEFAULT_REMOTE_PATH)]
    pub agent_path: String,

    /// Base URL of agent builds
    #[arg(long, env = "DEVPOD_AGENT_URL")]
    pub download_url: Option<String>,

    /// Have the target download the agent before trying to copy it
    #[arg(long)]
    pub prefer_download: bool,

    /// Assume the agent is already installed at --agent-path
    #[arg(long)]
    pub no_inject: bool,

    /// Bootstrap timeout in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Seconds the agent gets to reach back
    #[arg(long, default_value_t = 30)]
    pub ping_timeout: u64,

    /// SSH identity file for ssh targets
    #[arg(long)]
    pub identity_file: Option<PathBuf>,

    /// Container user for docker targets
    #[arg(long)]
    pub user: Option<String>,
}

/// Arguments of `devpod agent up`, passed by the operator
#[derive(Args, Debug, Clone)]
pub struct AgentUpArgs {
    /// Directory receiving the workspace content
    #[arg(long)]
    pub target_dir: PathBuf,

    /// Encoded workspace payload; fetched from the operator when omitted
    #[arg(long)]
    pub workspace_info: Option<String>,

    /// Repository to clone on this host
    #[arg(long)]
    pub git_repository: Option<String>,

    /// Branch of the repository
    #[arg(long, requires = "git_repository")]
    pub git_branch: Option<String>,

    /// Seconds to wait for the operator's answer to ping
    #[arg(long, default_value_t = 30)]
    pub ping_timeout: u64,
}
