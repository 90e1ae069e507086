use anyhow::Context;
use dock_core::logging::{init_logging, LogConfig};
use dock_hub::{config::load_config, Hub, HubConfig};
use dock_storage::DockStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&LogConfig {
        component: "dock-hub".to_string(),
        debug: config.debug,
        log_dir: config.log_dir.clone(),
    });
    if let Err(err) = run(config).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: HubConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid addr {}", config.addr))?;

    let store = DockStore::open(&config.db_path)
        .with_context(|| format!("open {}", config.db_path.display()))?;
    store.migrate().context("migrate store")?;
    let hub = Hub::new(Arc::new(store), &config);

    if config.agent_token.is_empty() {
        info!(event = "agent_link_disabled", reason = "no agent token configured");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(event = "hub_start", addr = %addr, db = %config.db_path.display());

    let booting = hub.clone();
    let own_port = config.own_port();
    tokio::spawn(async move { booting.boot(own_port).await });
    if let Some(interval) = config.reconcile_interval {
        hub.spawn_reconciler(interval);
    }
    if let Some(interval) = config.ping_interval {
        hub.link.clone().start_ping(interval);
    }

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };
    axum::serve(
        listener,
        hub.router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("serve")?;
    Ok(())
}
