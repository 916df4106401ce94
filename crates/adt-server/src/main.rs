use adt_core::logging::init_logging;
use adt_server::config::{load_config, ServerConfig};
use adt_server::{router, AppState};
use adt_storage::SqliteStore;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_file = init_logging("adt-server", config.debug, &config.log_dir);
    if let Some(path) = &log_file {
        info!(event = "log_file", path = %path.display());
    }
    if let Err(err) = run(config).await {
        error!(event = "server_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    let store = SqliteStore::open(&config.database)
        .with_context(|| format!("cannot open database {}", config.database.display()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;

    info!(
        event = "server_start",
        addr = %addr,
        database = %config.database.display(),
        strict_protocol = ?config.parse_policy
    );

    let state = AppState::new(config, Arc::new(store));
    let app = router(state);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "server_shutdown");
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server stopped")?;
    Ok(())
}
