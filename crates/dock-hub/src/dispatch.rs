use crate::agent_link::AgentLink;
use async_trait::async_trait;
use dock_core::protocol::{
    new_request_id, AgentCommand, AgentEvent, AppConfig, ProbeResult, ProbeableApp, ScannedApp,
};
use dock_core::{DockError, Project, ProjectId, ProjectRegistry, ProjectStatus, StatusChange};
use dock_supervisor::{ProbeReport, ProcessControl, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct DispatchTimeouts {
    /// Start, stop, restart and the read-only queries.
    pub command: Duration,
    /// Install and build, which run to completion before the agent replies.
    pub job: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(30),
            job: Duration::from_secs(600),
        }
    }
}

/// Routes each operation to the connected agent, or runs it on this host
/// when no agent has said hello. Commands are never queued for an agent that
/// is not there.
pub struct Dispatcher {
    supervisor: Supervisor,
    link: Arc<AgentLink>,
    timeouts: DispatchTimeouts,
}

impl Dispatcher {
    pub fn new(supervisor: Supervisor, link: Arc<AgentLink>, timeouts: DispatchTimeouts) -> Self {
        Self {
            supervisor,
            link,
            timeouts,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    async fn remote(&self) -> bool {
        self.link.is_connected().await
    }

    fn project(&self, id: ProjectId) -> Result<Project, DockError> {
        self.supervisor
            .registry()
            .project(id)?
            .ok_or(DockError::NotFound(id))
    }

    async fn remote_ack(
        &self,
        id: ProjectId,
        timeout: Duration,
        command: impl FnOnce(String, AppConfig) -> AgentCommand,
    ) -> Result<(), DockError> {
        let project = self.project(id)?;
        let command = command(new_request_id(), AppConfig::from(&project));
        let kind = command.kind();
        info!(event = "dispatch_remote", project_id = id, kind);
        match self.link.send_command(command, timeout).await? {
            AgentEvent::Ack { ok: true, .. } => Ok(()),
            AgentEvent::Ack {
                ok: false, error, ..
            } => Err(DockError::RemoteRejected(
                error.unwrap_or_else(|| format!("Agent refused {kind}")),
            )),
            other => Err(unexpected_reply(kind, &other)),
        }
    }

    /// Writes remote observations that differ from what is stored.
    fn apply_observations(&self, results: &[ProbeResult]) -> usize {
        let registry = self.supervisor.registry();
        let events = self.supervisor.events();
        let mut updated = 0;
        for result in results {
            let current = match registry.project(result.app_id) {
                Ok(Some(project)) => project,
                Ok(None) => continue,
                Err(err) => {
                    warn!(event = "observation_load_failed", project_id = result.app_id, error = %err);
                    continue;
                }
            };
            if current.status == result.status && current.pid == result.pid {
                continue;
            }
            let change = StatusChange::new(result.status).with_pid(result.pid);
            match registry.apply_status(result.app_id, &change) {
                Ok(()) => {
                    events.status(result.app_id, result.status, result.pid);
                    updated += 1;
                }
                Err(err) => {
                    warn!(event = "observation_write_failed", project_id = result.app_id, error = %err)
                }
            }
        }
        updated
    }

    async fn reconcile_remote(&self) -> Result<usize, DockError> {
        let running = self
            .supervisor
            .registry()
            .projects_with_status(ProjectStatus::Running)?;
        let command = AgentCommand::Reconcile {
            request_id: new_request_id(),
            running_apps: running.iter().map(ProbeableApp::from).collect(),
        };
        match self.link.send_command(command, self.timeouts.command).await? {
            AgentEvent::ReconcileResult { statuses, .. } => Ok(self.apply_observations(&statuses)),
            other => Err(unexpected_reply("reconcile", &other)),
        }
    }

    async fn probe_remote(&self) -> Result<ProbeReport, DockError> {
        let apps: Vec<ProbeableApp> = self
            .supervisor
            .registry()
            .projects()?
            .iter()
            .filter(|project| project.port.is_some())
            .map(ProbeableApp::from)
            .collect();
        let probed = apps.len();
        let command = AgentCommand::Probe {
            request_id: new_request_id(),
            apps,
        };
        match self.link.send_command(command, self.timeouts.command).await? {
            AgentEvent::ProbeResult { results, .. } => Ok(ProbeReport {
                probed,
                updated: self.apply_observations(&results),
            }),
            other => Err(unexpected_reply("probe", &other)),
        }
    }

    /// Projects the agent finds under its scan root.
    pub async fn scan(&self) -> Result<Vec<ScannedApp>, DockError> {
        let command = AgentCommand::Scan {
            request_id: new_request_id(),
        };
        match self.link.send_command(command, self.timeouts.command).await? {
            AgentEvent::ScanResult { apps, .. } => Ok(apps),
            other => Err(unexpected_reply("scan", &other)),
        }
    }

    /// Reads a file on the agent's machine, relative to its scan root.
    pub async fn read_file(&self, path: &str) -> Result<String, DockError> {
        let command = AgentCommand::ReadFile {
            request_id: new_request_id(),
            path: path.to_string(),
        };
        match self.link.send_command(command, self.timeouts.command).await? {
            AgentEvent::FileContent { content, .. } => Ok(content),
            AgentEvent::Ack {
                ok: false, error, ..
            } => Err(DockError::RemoteRejected(
                error.unwrap_or_else(|| "Agent could not read the file".to_string()),
            )),
            other => Err(unexpected_reply("readFile", &other)),
        }
    }

    pub async fn vacant_port(&self, used: &[u16]) -> Result<Option<u16>, DockError> {
        if !self.remote().await {
            return self.supervisor.find_vacant_port(used).await;
        }
        let mut used_ports: Vec<u16> = self
            .supervisor
            .registry()
            .projects()?
            .iter()
            .filter_map(|project| project.port)
            .collect();
        used_ports.extend_from_slice(used);
        used_ports.sort_unstable();
        used_ports.dedup();
        let command = AgentCommand::VacantPort {
            request_id: new_request_id(),
            used_ports,
        };
        match self.link.send_command(command, self.timeouts.command).await? {
            AgentEvent::VacantPort { port, .. } => Ok(Some(port)),
            other => Err(unexpected_reply("vacantPort", &other)),
        }
    }
}

fn unexpected_reply(kind: &str, event: &AgentEvent) -> DockError {
    let found = serde_json::to_value(event)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    DockError::RemoteRejected(format!("Unexpected {found} reply to {kind}"))
}

#[async_trait]
impl ProcessControl for Dispatcher {
    async fn start(&self, id: ProjectId) -> Result<(), DockError> {
        if !self.remote().await {
            return self.supervisor.start(id).await;
        }
        self.remote_ack(id, self.timeouts.command, |request_id, app| AgentCommand::Start {
            request_id,
            app,
        })
        .await
    }

    async fn stop(&self, id: ProjectId) -> Result<(), DockError> {
        if !self.remote().await {
            return self.supervisor.stop(id).await;
        }
        self.remote_ack(id, self.timeouts.command, |request_id, app| AgentCommand::Stop {
            request_id,
            app,
        })
        .await
    }

    async fn restart(&self, id: ProjectId) -> Result<(), DockError> {
        if !self.remote().await {
            return self.supervisor.restart(id).await;
        }
        self.remote_ack(id, self.timeouts.command, |request_id, app| {
            AgentCommand::Restart { request_id, app }
        })
        .await
    }

    async fn install(&self, id: ProjectId) -> Result<(), DockError> {
        if !self.remote().await {
            return self.supervisor.install(id).await;
        }
        self.remote_ack(id, self.timeouts.job, |request_id, app| AgentCommand::Install {
            request_id,
            app,
        })
        .await
    }

    async fn build(&self, id: ProjectId, then_start: bool) -> Result<(), DockError> {
        if !self.remote().await {
            return self.supervisor.build(id, then_start).await;
        }
        self.remote_ack(id, self.timeouts.job, |request_id, app| AgentCommand::Build {
            request_id,
            app,
            then_start,
        })
        .await
    }

    async fn reconcile(&self) {
        if !self.remote().await {
            self.supervisor.reconcile().await;
            return;
        }
        match self.reconcile_remote().await {
            Ok(updated) => info!(event = "remote_reconcile_finished", updated),
            Err(err) => warn!(event = "remote_reconcile_failed", error = %err),
        }
    }

    async fn probe_ports(&self) -> Result<ProbeReport, DockError> {
        if !self.remote().await {
            return self.supervisor.probe_ports().await;
        }
        self.probe_remote().await
    }
}
