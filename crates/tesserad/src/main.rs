//! tesserad — the Tessera daemon.
//!
//! # Usage
//!
//! ```text
//! tesserad --config /etc/tessera/tessera.toml --listen 0.0.0.0:8080 --data-dir /var/lib/tessera
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessera_core::{TesseraConfig, UserDirectory};
use tessera_state::StateStore;
use tesserad::{build_router, spawn_loops, Controller};

#[derive(Parser)]
#[command(name = "tesserad", about = "Tessera control plane and scheduler daemon")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the HTTP API and orchid.
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/tessera")]
    data_dir: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tesserad=info,tessera=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => {
            info!(path = ?path, "loading config");
            TesseraConfig::from_file(path)?
        }
        None => TesseraConfig::default(),
    };

    std::fs::create_dir_all(&cli.data_dir)?;
    let db_path = cli.data_dir.join("tessera.redb");
    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let controller = Controller::new(config, state, UserDirectory::default())?;

    // ── Background loops ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_loops(&controller, shutdown_rx);

    // ── API server ─────────────────────────────────────────────

    let router = build_router(controller.clone());
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(addr = %cli.listen, "API server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler failed; shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in handles {
        let _ = handle.await;
    }
    controller.shutdown().await;

    info!("tesserad stopped");
    Ok(())
}
