//! Mergeline server binary.
//!
//! # Usage
//!
//! ```bash
//! # In-memory log and snapshots, self-signed certificate (development)
//! mergeline-server --bind 0.0.0.0:4433
//!
//! # Persistent log and snapshots, TLS certificate
//! mergeline-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem --data-dir /var/lib/mergeline
//! ```

use std::path::PathBuf;

use clap::Parser;
use mergeline_server::{
    GatewayConfig, Server, ServerRuntimeConfig,
    storage::{MemoryLog, MemoryPubSub, MemorySnapshotStore, RedbStore},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Database file inside `--data-dir`.
const DATABASE_FILE: &str = "mergeline.redb";

/// Mergeline collaborative-editing relay
#[derive(Parser, Debug)]
#[command(name = "mergeline-server")]
#[command(about = "Mergeline operation sequencing and fanout relay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Directory for the persistent log and snapshots (in-memory if unset)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Maximum concurrently joined sessions
    #[arg(long, default_value = "10000")]
    max_sessions: usize,

    /// Buffered operations per session before it is evicted
    #[arg(long, default_value = "256")]
    session_inbox: usize,

    /// Command inbox size of each document room
    #[arg(long, default_value = "1024")]
    room_inbox: usize,

    /// Largest accepted operation payload, in bytes
    #[arg(long, default_value = "1048576")]
    max_payload: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %args.bind, "mergeline server starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("no TLS certificate provided, using self-signed certificate");
    }

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        data_dir: args.data_dir,
        gateway: GatewayConfig {
            max_sessions: args.max_sessions,
            session_inbox_capacity: args.session_inbox,
            room_inbox_capacity: args.room_inbox,
            max_payload_size: args.max_payload,
        },
    };

    if let Some(dir) = config.data_dir.clone() {
        std::fs::create_dir_all(&dir)?;
        let store = RedbStore::open(dir.join(DATABASE_FILE))?;
        tracing::info!(path = %dir.display(), "using persistent log and snapshots");

        let server = Server::bind(config, store.clone(), store, MemoryPubSub::new())?;
        tracing::info!(addr = %server.local_addr()?, "server listening");
        server.run().await?;
    } else {
        tracing::warn!("no data directory, log and snapshots are in memory");

        let server =
            Server::bind(config, MemoryLog::new(), MemorySnapshotStore::new(), MemoryPubSub::new())?;
        tracing::info!(addr = %server.local_addr()?, "server listening");
        server.run().await?;
    }

    Ok(())
}
