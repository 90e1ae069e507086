//! Turns hub commands into supervisor calls on this machine.

use dock_core::protocol::{AgentCommand, AgentEvent, AppConfig, ProbeResult, ProbeableApp, ScannedApp};
use dock_core::{DockError, ProjectId, ProjectStatus};
use dock_supervisor::process::is_pid_alive;
use dock_supervisor::{MemoryRegistry, Supervisor};
use futures_util::future::join_all;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_READ_BYTES: u64 = 256 * 1024;

#[derive(Clone)]
pub struct CommandHandler {
    supervisor: Supervisor,
    registry: Arc<MemoryRegistry>,
    scan_root: PathBuf,
}

impl CommandHandler {
    pub fn new(supervisor: Supervisor, registry: Arc<MemoryRegistry>, scan_root: PathBuf) -> Self {
        Self {
            supervisor,
            registry,
            scan_root,
        }
    }

    /// The reply for `command`. Every command gets one; `ping` gets `pong`.
    pub async fn handle(&self, command: AgentCommand) -> AgentEvent {
        let kind = command.kind();
        match command {
            AgentCommand::Ping => AgentEvent::Pong,
            AgentCommand::Start { request_id, app } => {
                let result = self.with_app(&app, |id| self.supervisor.start(id)).await;
                self.ack(&request_id, kind, result)
            }
            AgentCommand::Stop { request_id, app } => {
                let result = self.with_app(&app, |id| self.supervisor.stop(id)).await;
                self.ack(&request_id, kind, result)
            }
            AgentCommand::Restart { request_id, app } => {
                let result = self.with_app(&app, |id| self.supervisor.restart(id)).await;
                self.ack(&request_id, kind, result)
            }
            AgentCommand::Install { request_id, app } => {
                let result = self.with_app(&app, |id| self.supervisor.install(id)).await;
                self.ack(&request_id, kind, result)
            }
            AgentCommand::Build {
                request_id,
                app,
                then_start,
            } => {
                let result = self
                    .with_app(&app, |id| self.supervisor.build(id, then_start))
                    .await;
                self.ack(&request_id, kind, result)
            }
            AgentCommand::Scan { request_id } => AgentEvent::ScanResult {
                request_id,
                apps: scan_projects(&self.scan_root).await,
            },
            AgentCommand::Probe { request_id, apps } => AgentEvent::ProbeResult {
                request_id,
                results: self.probe(&apps).await,
            },
            AgentCommand::Reconcile {
                request_id,
                running_apps,
            } => AgentEvent::ReconcileResult {
                request_id,
                statuses: self.reconcile(&running_apps).await,
            },
            AgentCommand::ReadFile { request_id, path } => {
                match read_under_root(&self.scan_root, &path).await {
                    Ok(content) => AgentEvent::FileContent {
                        request_id,
                        content,
                    },
                    Err(message) => {
                        warn!(event = "read_file_refused", path = %path, error = %message);
                        AgentEvent::ack(&request_id, Err(message))
                    }
                }
            }
            AgentCommand::VacantPort {
                request_id,
                used_ports,
            } => match self.supervisor.find_vacant_port(&used_ports).await {
                Ok(Some(port)) => AgentEvent::VacantPort { request_id, port },
                Ok(None) => AgentEvent::ack(&request_id, Err("No vacant port".to_string())),
                Err(err) => AgentEvent::ack(&request_id, Err(err.to_string())),
            },
        }
    }

    async fn with_app<F, Fut>(&self, app: &AppConfig, run: F) -> Result<(), DockError>
    where
        F: FnOnce(ProjectId) -> Fut,
        Fut: std::future::Future<Output = Result<(), DockError>>,
    {
        self.registry.upsert_facts(app.to_project())?;
        run(app.id).await
    }

    fn ack(&self, request_id: &str, kind: &str, result: Result<(), DockError>) -> AgentEvent {
        match result {
            Ok(()) => {
                info!(event = "command_ok", request_id, kind);
                AgentEvent::ack(request_id, Ok(()))
            }
            Err(err) => {
                warn!(event = "command_failed", request_id, kind, error = %err);
                AgentEvent::ack(request_id, Err(err.to_string()))
            }
        }
    }

    async fn probe(&self, apps: &[ProbeableApp]) -> Vec<ProbeResult> {
        let projects: Vec<_> = apps
            .iter()
            .map(|app| app.to_project(ProjectStatus::Stopped))
            .collect();
        join_all(projects.iter().map(|project| self.supervisor.observe(project)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Every app the hub believes is running gets a verdict, even when only
    /// its pid is known.
    async fn reconcile(&self, apps: &[ProbeableApp]) -> Vec<ProbeResult> {
        let projects: Vec<_> = apps
            .iter()
            .map(|app| app.to_project(ProjectStatus::Running))
            .collect();
        let observed = join_all(projects.iter().map(|project| self.supervisor.observe(project))).await;
        projects
            .iter()
            .zip(observed)
            .map(|(project, observed)| {
                observed.unwrap_or_else(|| match project.pid.filter(|pid| is_pid_alive(*pid)) {
                    Some(pid) => ProbeResult {
                        app_id: project.id,
                        status: ProjectStatus::Running,
                        pid: Some(pid),
                    },
                    None => ProbeResult {
                        app_id: project.id,
                        status: ProjectStatus::Stopped,
                        pid: None,
                    },
                })
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct PackageName {
    name: Option<String>,
}

/// Immediate sub-directories of `root` that hold a `package.json`.
pub async fn scan_projects(root: &Path) -> Vec<ScannedApp> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(event = "scan_failed", root = %root.display(), error = %err);
            return Vec::new();
        }
    };
    let mut apps = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Ok(manifest) = tokio::fs::read_to_string(dir.join("package.json")).await else {
            continue;
        };
        let dir_name = entry.file_name().to_string_lossy().to_string();
        let name = serde_json::from_str::<PackageName>(&manifest)
            .ok()
            .and_then(|package| package.name)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(dir_name);
        apps.push(ScannedApp {
            name,
            local_path: dir.to_string_lossy().to_string(),
            port: None,
            package_manager: None,
            dev_command: None,
        });
    }
    apps.sort_by(|a, b| a.local_path.cmp(&b.local_path));
    apps
}

/// Reads a text file that resolves to somewhere under `root`.
pub async fn read_under_root(root: &Path, requested: &str) -> Result<String, String> {
    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|err| format!("Scan root unavailable: {err}"))?;
    let candidate = root.join(requested);
    let resolved = tokio::fs::canonicalize(&candidate)
        .await
        .map_err(|_| format!("File not found: {requested}"))?;
    if !resolved.starts_with(&root) {
        return Err(format!("Path outside scan root: {requested}"));
    }
    let metadata = tokio::fs::metadata(&resolved)
        .await
        .map_err(|err| err.to_string())?;
    if !metadata.is_file() {
        return Err(format!("Not a file: {requested}"));
    }
    if metadata.len() > MAX_READ_BYTES {
        return Err(format!("File too large: {} bytes", metadata.len()));
    }
    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|err| err.to_string())?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}
