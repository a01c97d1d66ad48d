//! UmlSync server: hosts collaborative diagrams over WebSocket.
//!
//! Diagrams are opened on first join and closed once their last view
//! leaves. With `--snapshot-dir` they survive restarts.

mod args;

use std::str::FromStr;

use clap::Parser;
use log::{info, LevelFilter};
use umlsync_collab::SyncServer;

use args::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = LevelFilter::from_str(&args.log_level).unwrap_or_else(|_| {
        eprintln!("invalid log level '{}', using info", args.log_level);
        LevelFilter::Info
    });
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = args.server_config();
    let persistent = config.snapshot_dir.is_some();
    info!(
        "starting umlsync server on {} (snapshots: {})",
        config.bind_addr,
        config
            .snapshot_dir
            .as_ref()
            .map_or_else(|| "off".to_string(), |dir| dir.display().to_string())
    );
    let server = SyncServer::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    if persistent {
        let saved = server.registry().save_all().await;
        info!("saved {saved} diagram snapshot(s)");
    }
    Ok(())
}
