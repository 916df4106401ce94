use adt_agent::config::{load_config, AgentConfig};
use adt_agent::registration::{ws_url, ApiClient};
use adt_agent::state::AgentState;
use adt_agent::{machine, ConnectionManager, ManagerConfig, ShellExecutor};
use adt_core::logging::init_logging;
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_file = init_logging("adt-agent", config.debug, &config.log_dir);
    if let Some(path) = &log_file {
        info!(event = "log_file", path = %path.display());
    }
    if let Err(err) = run(config).await {
        error!(event = "agent_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let mut state = AgentState::load_or_init(&config.state_file, config.server_url.as_deref())
        .context("cannot load agent state")?;
    let client = ApiClient::new(&state.server_url)?;
    client
        .healthcheck()
        .await
        .context("coordinator healthcheck failed")?;

    if !state.is_registered() {
        let machine = machine::collect();
        state.id = client
            .register(&machine)
            .await
            .context("agent registration failed")?;
        state
            .save(&config.state_file)
            .context("cannot persist agent id")?;
        info!(event = "agent_registered", agent_id = state.id, hostname = %machine.hostname);
    }

    let url = ws_url(&state.server_url, state.id)?;
    info!(event = "agent_start", agent_id = state.id, url = %url);
    let manager = ConnectionManager::new(
        ManagerConfig {
            url,
            reconnect: config.reconnect.clone(),
            parse_policy: config.parse_policy,
            duplicate_policy: config.duplicate_policy,
            outbound_capacity: config.queue_capacity,
        },
        Arc::new(ShellExecutor::default()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "agent_shutdown");
        let _ = shutdown_tx.send(true);
    });
    manager.run(shutdown_rx).await.context("command channel")?;
    Ok(())
}
