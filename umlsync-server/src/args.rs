//! Command-line arguments for the sync server.

use std::path::PathBuf;

use clap::Parser;
use umlsync_collab::{RetentionPolicy, ServerConfig};

/// Collaborative UML diagram sync server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "UMLSYNC_BIND", default_value = "127.0.0.1:9090")]
    pub bind: String,

    /// Directory for diagram snapshots; omit to keep diagrams in memory only
    #[arg(long, env = "UMLSYNC_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Snapshot every N versions (0 disables automatic snapshots)
    #[arg(long, default_value_t = 100)]
    pub snapshot_every: u64,

    /// Keep only the newest N log entries per diagram
    #[arg(long)]
    pub keep_last: Option<usize>,

    /// Events buffered per view before a slow view starts skipping
    #[arg(long, default_value_t = 1024)]
    pub broadcast_capacity: usize,

    /// Log level (off, error, warn, info, debug, trace); RUST_LOG overrides
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity,
            snapshot_dir: self.snapshot_dir.clone(),
            snapshot_every: (self.snapshot_every > 0).then_some(self.snapshot_every),
            retention: self.keep_last.map(RetentionPolicy::KeepLast),
        }
    }
}
