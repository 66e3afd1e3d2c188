//! Tandem sync server entry point.
//!
//! Usage: tandem-server [--bind <addr>] [--data-dir <path>]
//!
//! Without --data-dir, file contents live in memory and are lost on exit.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tandem_collab::{ServerConfig, ServerError, SyncServer};

/// Real-time collaborative text sync server.
#[derive(Parser, Debug)]
#[command(name = "tandem-server")]
#[command(about = "WebSocket server keeping shared text documents in sync")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "TANDEM_BIND", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory for file contents and snapshots.
    #[arg(long, env = "TANDEM_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Quiet period before edits are written to the store.
    #[arg(long, env = "TANDEM_DEBOUNCE_MS", default_value = "2000")]
    debounce_ms: u64,

    /// Maximum concurrent sessions per room.
    #[arg(long, env = "TANDEM_MAX_PEERS", default_value = "100")]
    max_peers: usize,

    /// Outbound frames buffered per session before it is disconnected.
    #[arg(long, env = "TANDEM_QUEUE_CAPACITY", default_value = "256")]
    queue_capacity: usize,

    /// Skip the binary snapshot log on flush.
    #[arg(long)]
    no_snapshots: bool,

    /// Snapshot records kept per file.
    #[arg(long, env = "TANDEM_SNAPSHOT_RETENTION", default_value = "3")]
    snapshot_retention: usize,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            max_sessions_per_room: self.max_peers,
            queue_capacity: self.queue_capacity,
            debounce: Duration::from_millis(self.debounce_ms),
            snapshots: !self.no_snapshots,
            snapshot_retention: self.snapshot_retention,
            storage_path: self.data_dir,
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    match &config.storage_path {
        Some(path) => log::info!("using RocksDB store at {}", path.display()),
        None => log::warn!("no --data-dir given, file contents are kept in memory only"),
    }

    let server = SyncServer::from_config(config)?;
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
            server.shutdown().await;
            Ok(())
        }
    }
}
