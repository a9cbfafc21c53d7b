//! sync-daemon: bidirectional file synchronizer between a local
//! directory and a running container, for live-reload development.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sync_daemon::config::{SyncConfig, WatchMode};
use sync_daemon::container::DockerCli;
use sync_daemon::session::SyncSession;

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Live bidirectional sync between a local directory and a container")]
struct Args {
    /// Container id or name
    container: String,

    /// Local directory to sync
    local: PathBuf,

    /// Remote directory inside the container; relative paths resolve
    /// against the container's working directory
    remote: String,

    /// Path of the watcher agent binary to inject into the container
    #[arg(long)]
    agent: Option<PathBuf>,

    /// Use snapshot polling instead of native filesystem events
    #[arg(long)]
    poll: bool,

    /// Force a re-scan of recently active directories every N seconds,
    /// for event sources that drop events
    #[arg(long, value_name = "SECONDS")]
    fallback_sync_interval: Option<u64>,

    /// Print a line for every transferred file
    #[arg(long)]
    debug: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,sync_daemon=debug"
    } else {
        "info,sync_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = SyncConfig::new(&args.container, args.local, &args.remote);
    if let Some(agent) = args.agent {
        config.agent_binary = agent;
    }
    if args.poll {
        config.watch_mode = WatchMode::Poll;
    }
    config.fallback_sync_interval = args.fallback_sync_interval.map(Duration::from_secs);
    config.debug = args.debug;

    let api = Arc::new(DockerCli::new());
    let cancel = CancellationToken::new();

    let mut session = SyncSession::start(api, config, cancel.clone()).await?;
    info!("Sync running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            line = session.status.recv() => {
                match line {
                    Some(line) => println!("{line}"),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                cancel.cancel();
                break;
            }
        }
    }

    session.join().await;
    info!("Shutting down");
    Ok(())
}
