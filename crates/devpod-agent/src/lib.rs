//! # devpod agent
//!
//! The `devpod` binary. `up` runs on the operator host, bootstraps the agent
//! on a target and serves it; `agent up` is what runs on the target.

/// Command-line interface
pub mod cli;

/// Remote side of `devpod up`
pub mod agent;

/// Operator side of `devpod up`
pub mod up;

use anyhow::Result;
use cli::{AgentCommands, Cli, Commands};
use devpod::proto::LogLevel;

/// Version string reported by `devpod version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the selected command
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Version => {
            println!("{}", VERSION);
            Ok(())
        }
        Commands::Up(args) => up::run(args, cli.debug).await,
        Commands::Agent {
            command: AgentCommands::Up(args),
        } => {
            let level = if cli.debug { LogLevel::Debug } else { LogLevel::Info };
            agent::run_up(args, level).await
        }
    }
}
