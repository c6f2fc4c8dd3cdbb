//! zk2fs: mirrors a coordination namespace onto the local filesystem.
//!
//! Syncs the configured subtrees, marks the mirror ready, then keeps it
//! current from watch deliveries until the session is lost or a delivery
//! fails. Both are fatal: the process exits and its supervisor restarts it
//! for a full resync.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, trace};
use tracing_subscriber::EnvFilter;

use zk2fs::{load_snapshot, sync_all, Config};
use zksync::SyncEngine;

#[derive(Parser, Debug)]
#[command(name = "zk2fs")]
#[command(about = "Mirror a coordination namespace to the filesystem")]
struct Args {
    /// Output directory
    #[arg(short, long)]
    root: PathBuf,

    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON namespace snapshot to serve as the coordination service.
    ///
    /// Required: zk2fs has no networked coordination client and mirrors
    /// from a snapshot only.
    #[arg(short, long)]
    snapshot: PathBuf,

    /// Sync once and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,zk2fs=debug,zksync=debug"
    } else {
        "info,zk2fs=info,zksync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting zk2fs");
    info!("Mirror root: {:?}", args.root);

    let config = Config::load(args.config.as_deref())?;
    let coordinator = load_snapshot(&args.snapshot)?;

    let mut engine = SyncEngine::new(Arc::new(coordinator), &args.root)?;
    let _event_log = engine.events().subscribe(|event| {
        if let Ok(json) = serde_json::to_string(event) {
            trace!(target: "zk2fs::events", "{}", json);
        }
    });
    sync_all(&mut engine, &config).await?;
    engine.mark_ready()?;

    if args.once {
        info!("Initial sync complete, exiting");
        return Ok(());
    }

    info!("Mirror running. Press Ctrl+C to stop.");

    tokio::select! {
        result = engine.run() => {
            if let Err(e) = result {
                error!("Fatal: {}", e);
                std::process::exit(1);
            }
        }

        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_required() {
        let err = Args::try_parse_from(["zk2fs", "--root", "/tmp/mirror"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_parse_args() {
        let args = Args::try_parse_from([
            "zk2fs",
            "--root",
            "/tmp/mirror",
            "--snapshot",
            "ns.json",
            "--once",
        ])
        .unwrap();
        assert_eq!(args.snapshot, PathBuf::from("ns.json"));
        assert!(args.config.is_none());
        assert!(args.once);
    }
}
