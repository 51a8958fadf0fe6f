//! devpod binary

use clap::Parser;
use devpod_agent::cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // stdout carries the control channel in agent mode
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(std::io::stderr)
        .init();

    let verbose = cli.verbose;
    let code = match devpod_agent::run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            if verbose {
                eprintln!("Error: {:?}", e);
            } else {
                eprintln!("Error: {:#}", e);
            }
            1
        }
    };

    // a pending stdin read would hold up runtime shutdown
    std::process::exit(code);
}
