use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use relay_server::ServerConfig;
use relay_store::{Database, MessageStore, SqliteMessageStore};
use relay_telemetry::TelemetryConfig;

#[derive(Debug, Parser)]
#[command(name = "relay", about = "Room-based WebSocket chat relay")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    relay_telemetry::init_telemetry(TelemetryConfig::default());

    let db_path = Path::new("chat.db");
    let db = Database::open(db_path)
        .with_context(|| format!("failed to open history database {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "history database opened");
    let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(db));

    let config = ServerConfig {
        bind: args.bind,
        ..Default::default()
    };
    let handle = relay_server::start(config, Some(store))
        .await
        .context("failed to start relay server")?;
    tracing::info!(addr = %handle.local_addr(), "relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
