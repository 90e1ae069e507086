//! Dashboard-side service: owns the store, runs projects locally or hands
//! them to a connected agent, and serves the thin action surface.

use axum::Router;
use dock_core::{LogStore, ProjectRegistry};
use dock_storage::DockStore;
use dock_supervisor::{
    default_probe, EventBus, LogSink, PortProbe, ProcessControl, Supervisor, SupervisorConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub mod agent_link;
pub mod config;
pub mod dispatch;
pub mod routes;

pub use agent_link::{AgentConnection, AgentIdentity, AgentLink, AgentLinkConfig};
pub use config::HubConfig;
pub use dispatch::{DispatchTimeouts, Dispatcher};

/// Every long-lived service of the hub, built once at startup.
#[derive(Clone)]
pub struct Hub {
    pub store: Arc<DockStore>,
    pub supervisor: Supervisor,
    pub link: Arc<AgentLink>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Hub {
    pub fn new(store: Arc<DockStore>, config: &HubConfig) -> Self {
        Self::with_probe(store, config, default_probe(), SupervisorConfig::default())
    }

    pub fn with_probe(
        store: Arc<DockStore>,
        config: &HubConfig,
        probe: Arc<dyn PortProbe>,
        supervisor_config: SupervisorConfig,
    ) -> Self {
        let logs = LogSink::with_retention(
            Some(store.clone() as Arc<dyn LogStore>),
            supervisor_config.log_cap,
            supervisor_config.trim_batch,
        );
        let events = EventBus::new();
        let supervisor = Supervisor::new(
            store.clone() as Arc<dyn ProjectRegistry>,
            logs.clone(),
            events.clone(),
            probe,
            supervisor_config,
        );
        let link = Arc::new(AgentLink::new(
            AgentLinkConfig {
                token: config.agent_token.clone(),
                max_frame_bytes: config.max_frame_bytes,
                write_timeout: config.write_timeout,
            },
            store.clone(),
            logs,
            events,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            supervisor.clone(),
            link.clone(),
            DispatchTimeouts {
                command: config.command_timeout,
                job: config.job_timeout,
            },
        ));
        Self {
            store,
            supervisor,
            link,
            dispatcher,
        }
    }

    pub fn router(&self) -> Router {
        routes::router(routes::AppState {
            dispatcher: self.dispatcher.clone(),
            link: self.link.clone(),
        })
    }

    /// Startup pass: correct stale `running` rows, then bring up auto-boot
    /// projects on this host.
    pub async fn boot(&self, own_port: Option<u16>) {
        self.supervisor.reconcile().await;
        let report = self.supervisor.autoboot(own_port).await;
        info!(
            event = "autoboot_finished",
            started = report.started.len(),
            adopted = report.adopted.len(),
            failed = report.failed.len()
        );
    }

    pub fn spawn_reconciler(&self, interval: Duration) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                dispatcher.reconcile().await;
            }
        });
    }
}
