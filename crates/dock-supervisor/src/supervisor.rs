use crate::events::EventBus;
use crate::log_sink::{LogSink, DEFAULT_LOG_CAP, DEFAULT_TRIM_BATCH};
use crate::probe::{http_client, is_http_up, PortProbe};
use crate::process::{classify_exit, is_pid_alive, ProcessGroup};
use crate::ProcessControl;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dock_core::protocol::ProbeResult;
use dock_core::{
    DockError, LogStream, Project, ProjectId, ProjectRegistry, ProjectStatus, StatusChange,
};
use futures_util::future::join_all;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Wait between the graceful and the forceful signal.
    pub stop_grace: Duration,
    /// Liveness polling interval while stopping processes we did not spawn.
    pub stop_poll: Duration,
    pub port_discovery_delay: Duration,
    pub restart_settle: Duration,
    pub http_timeout: Duration,
    pub log_cap: u64,
    pub trim_batch: u64,
    pub shell: PathBuf,
    pub vacant_port_start: u16,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            stop_poll: Duration::from_millis(100),
            port_discovery_delay: Duration::from_secs(3),
            restart_settle: Duration::from_millis(500),
            http_timeout: Duration::from_millis(2500),
            log_cap: DEFAULT_LOG_CAP,
            trim_batch: DEFAULT_TRIM_BATCH,
            shell: PathBuf::from("/bin/bash"),
            vacant_port_start: 3000,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub stopped: Vec<ProjectId>,
    pub ports_discovered: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub probed: usize,
    pub updated: usize,
}

#[derive(Debug, Default)]
pub struct AutobootReport {
    pub started: Vec<ProjectId>,
    pub adopted: Vec<ProjectId>,
    pub failed: Vec<(ProjectId, DockError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LaunchKind {
    Dev,
    Production,
}

struct ManagedProcess {
    group: ProcessGroup,
    started_at: DateTime<Utc>,
    generation: u64,
    exited: watch::Receiver<bool>,
}

/// Owns every child process this host spawned, one per project.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    registry: Arc<dyn ProjectRegistry>,
    logs: LogSink,
    events: EventBus,
    probe: Arc<dyn PortProbe>,
    http: reqwest::Client,
    config: SupervisorConfig,
    processes: Mutex<HashMap<ProjectId, ManagedProcess>>,
    /// Projects between their first `starting` write and their entry in
    /// `processes`.
    launching: Mutex<HashSet<ProjectId>>,
    generation: AtomicU64,
}

/// Holds a project's launch reservation until dropped.
struct LaunchSlot<'a> {
    launching: &'a Mutex<HashSet<ProjectId>>,
    id: ProjectId,
}

impl Drop for LaunchSlot<'_> {
    fn drop(&mut self) {
        self.launching
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.id);
    }
}

impl Supervisor {
    pub fn new(
        registry: Arc<dyn ProjectRegistry>,
        logs: LogSink,
        events: EventBus,
        probe: Arc<dyn PortProbe>,
        config: SupervisorConfig,
    ) -> Self {
        let http = http_client(config.http_timeout);
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                logs,
                events,
                probe,
                http,
                config,
                processes: Mutex::new(HashMap::new()),
                launching: Mutex::new(HashSet::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ProjectRegistry> {
        &self.inner.registry
    }

    pub fn logs(&self) -> &LogSink {
        &self.inner.logs
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn is_managed(&self, id: ProjectId) -> bool {
        self.processes().contains_key(&id)
    }

    pub fn managed_pid(&self, id: ProjectId) -> Option<u32> {
        self.processes().get(&id).map(|managed| managed.group.leader())
    }

    pub fn managed_ids(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self.processes().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<ProjectId, ManagedProcess>> {
        self.inner
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `id` for a launch. Fails while the project is managed or another
    /// launch holds the slot, so a losing caller never touches its status.
    fn reserve_launch(&self, id: ProjectId) -> Result<LaunchSlot<'_>, DockError> {
        let mut launching = self
            .inner
            .launching
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if launching.contains(&id) || self.processes().contains_key(&id) {
            return Err(DockError::AlreadyRunning);
        }
        launching.insert(id);
        Ok(LaunchSlot {
            launching: &self.inner.launching,
            id,
        })
    }

    fn is_current(&self, id: ProjectId, generation: u64) -> bool {
        self.processes()
            .get(&id)
            .is_some_and(|managed| managed.generation == generation)
    }

    fn load(&self, id: ProjectId) -> Result<Project, DockError> {
        self.inner.registry.project(id)?.ok_or(DockError::NotFound(id))
    }

    fn transition(&self, id: ProjectId, change: StatusChange) -> Result<(), DockError> {
        self.inner.registry.apply_status(id, &change)?;
        self.inner
            .events
            .status(id, change.status, change.event_pid());
        Ok(())
    }

    fn note_transition(&self, id: ProjectId, change: StatusChange) {
        let status = change.status;
        if let Err(err) = self.transition(id, change) {
            warn!(event = "status_write_failed", project_id = id, status = %status, error = %err);
        }
    }

    fn log(&self, id: ProjectId, stream: LogStream, message: impl Into<String>) {
        self.inner.logs.record(id, stream, message);
    }

    fn record_port(&self, id: ProjectId, port: u16) -> bool {
        match self.inner.registry.set_port(id, port) {
            Ok(()) => {
                self.inner.events.port(id, port);
                self.log(id, LogStream::System, format!("Detected port {port}"));
                info!(event = "port_discovered", project_id = id, port);
                true
            }
            Err(err) => {
                warn!(event = "port_write_failed", project_id = id, port, error = %err);
                false
            }
        }
    }

    fn shell_command(&self, command: &str, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.inner.config.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn forward_output(&self, id: ProjectId, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let logs = self.inner.logs.clone();
            tasks.push(tokio::spawn(forward_lines(stdout, logs, id, LogStream::Stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = self.inner.logs.clone();
            tasks.push(tokio::spawn(forward_lines(stderr, logs, id, LogStream::Stderr)));
        }
        tasks
    }

    /// Starts the project's dev command as a new process group.
    pub async fn start(&self, id: ProjectId) -> Result<(), DockError> {
        if self.is_managed(id) {
            return Err(DockError::AlreadyRunning);
        }
        let project = self.load(id)?;
        let command = project
            .dev_command()
            .ok_or(DockError::NotConfigured("dev command"))?
            .to_string();
        let cwd = working_dir(&project)?;
        if let Some(port) = project.port {
            // Listening state decides; owners may be unreadable under another user.
            if self.inner.probe.is_listening(port).await {
                let owners = self.inner.probe.pids_on_port(port).await;
                info!(event = "start_refused_port_busy", project_id = id, port, owners = ?owners);
                return Err(DockError::PortInUse(port));
            }
        }
        self.launch(&project, &command, &cwd, LaunchKind::Dev).await
    }

    async fn launch(
        &self,
        project: &Project,
        command: &str,
        cwd: &Path,
        kind: LaunchKind,
    ) -> Result<(), DockError> {
        let id = project.id;
        let _slot = self.reserve_launch(id)?;
        let started_at = Utc::now();
        self.transition(
            id,
            StatusChange::new(ProjectStatus::Starting)
                .with_pid(None)
                .clear_error()
                .started_at(started_at),
        )?;
        match kind {
            LaunchKind::Dev => self.log(id, LogStream::System, format!("Starting: {command}")),
            LaunchKind::Production => self.log(
                id,
                LogStream::System,
                format!("Build done, starting production server: {command}"),
            ),
        }

        let mut cmd = self.shell_command(command, cwd);
        cmd.process_group(0);
        if let Some(port) = project.port {
            cmd.env("PORT", port.to_string());
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return Err(self.spawn_failed(id, err.to_string())),
        };
        let Some(pid) = child.id() else {
            return Err(self.spawn_failed(id, "process exited before reporting a pid".to_string()));
        };
        self.forward_output(id, &mut child);

        let group = ProcessGroup::new(pid);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (exit_tx, exit_rx) = watch::channel(false);
        self.processes().insert(
            id,
            ManagedProcess {
                group,
                started_at,
                generation,
                exited: exit_rx,
            },
        );

        // Running must be on record before the exit monitor can overwrite it.
        let running = self.transition(id, StatusChange::new(ProjectStatus::Running).with_pid(Some(pid)));
        let supervisor = self.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(true);
            supervisor.on_exit(id, generation, status);
        });
        running?;
        match kind {
            LaunchKind::Dev => self.log(id, LogStream::System, format!("Started with PID {pid}")),
            LaunchKind::Production => {
                self.log(id, LogStream::System, format!("Production server PID {pid}"))
            }
        }
        info!(event = "process_started", project_id = id, pid, kind = ?kind);

        if project.port.is_none() {
            self.schedule_port_discovery(id, pid, generation);
        }
        Ok(())
    }

    fn spawn_failed(&self, id: ProjectId, message: String) -> DockError {
        warn!(event = "process_spawn_failed", project_id = id, error = %message);
        self.log(id, LogStream::System, format!("Error: {message}"));
        self.note_transition(
            id,
            StatusChange::new(ProjectStatus::Error)
                .with_pid(None)
                .with_error(message.clone()),
        );
        DockError::ProcessSpawnFailed(message)
    }

    fn schedule_port_discovery(&self, id: ProjectId, pid: u32, generation: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(supervisor.inner.config.port_discovery_delay).await;
            if !supervisor.is_current(id, generation) {
                return;
            }
            match supervisor.inner.probe.listening_port_for_pid(pid).await {
                Some(port) => {
                    supervisor.record_port(id, port);
                }
                None => debug!(event = "port_not_discovered", project_id = id, pid),
            }
        });
    }

    fn on_exit(&self, id: ProjectId, generation: u64, status: std::io::Result<ExitStatus>) {
        let owned = {
            let mut processes = self.processes();
            match processes.get(&id) {
                Some(managed) if managed.generation == generation => {
                    processes.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if !owned {
            debug!(event = "process_exit_after_stop", project_id = id);
            return;
        }

        let (next, message) = match &status {
            Ok(status) => classify_exit(status),
            Err(err) => (ProjectStatus::Error, format!("Wait failed: {err}")),
        };
        let change = match next {
            ProjectStatus::Error => StatusChange::new(next)
                .with_pid(None)
                .with_error(message.clone()),
            _ => StatusChange::new(next).with_pid(None).clear_error(),
        };
        self.note_transition(id, change);
        self.log(id, LogStream::System, message.clone());
        info!(event = "process_exited", project_id = id, status = %next, detail = %message);
    }

    /// Always ends with the project `stopped` and no pid, whether or not a
    /// process was found.
    pub async fn stop(&self, id: ProjectId) -> Result<(), DockError> {
        let project = self.load(id)?;
        let managed = self.processes().remove(&id);
        match managed {
            Some(managed) => self.stop_managed(id, managed).await,
            None => self.stop_untracked(&project).await,
        }
        self.transition(id, StatusChange::new(ProjectStatus::Stopped).with_pid(None))?;
        Ok(())
    }

    async fn stop_managed(&self, id: ProjectId, managed: ManagedProcess) {
        let ManagedProcess {
            group,
            started_at,
            mut exited,
            ..
        } = managed;
        self.log(id, LogStream::System, "Stopping...");
        group.terminate();

        let grace = self.inner.config.stop_grace;
        if tokio::time::timeout(grace, wait_for_exit(&mut exited)).await.is_err() {
            group.kill();
            self.log(id, LogStream::System, "Force killed (SIGKILL)");
            warn!(event = "process_force_killed", project_id = id, pid = group.leader());
            let _ = tokio::time::timeout(grace, wait_for_exit(&mut exited)).await;
        }
        let uptime_secs = (Utc::now() - started_at).num_seconds();
        info!(event = "process_stopped", project_id = id, pid = group.leader(), uptime_secs);
    }

    async fn stop_untracked(&self, project: &Project) {
        let id = project.id;
        let own = std::process::id();
        let mut pids = Vec::new();
        if let Some(pid) = project.pid.filter(|pid| is_pid_alive(*pid)) {
            pids.push(pid);
        }
        if let Some(port) = project.port {
            for pid in self.inner.probe.pids_on_port(port).await {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        pids.retain(|pid| *pid != own);
        if pids.is_empty() {
            debug!(event = "stop_nothing_running", project_id = id);
            return;
        }

        let list = pids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        self.log(id, LogStream::System, format!("Stopping PID(s) {list}..."));
        let groups: Vec<ProcessGroup> = pids.into_iter().map(ProcessGroup::new).collect();
        for group in &groups {
            group.terminate();
        }

        let deadline = Instant::now() + self.inner.config.stop_grace;
        loop {
            if !groups.iter().any(ProcessGroup::is_alive) {
                info!(event = "untracked_stopped", project_id = id, pids = %list);
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.inner.config.stop_poll).await;
        }

        for group in groups.iter().filter(|group| group.is_alive()) {
            group.kill();
        }
        self.log(id, LogStream::System, "Force killed (SIGKILL)");
        warn!(event = "untracked_force_killed", project_id = id, pids = %list);
    }

    /// `stop`, a short settle, then `start`. `start` only runs once `stop`
    /// has finished.
    pub async fn restart(&self, id: ProjectId) -> Result<(), DockError> {
        self.stop(id).await?;
        tokio::time::sleep(self.inner.config.restart_settle).await;
        self.start(id).await
    }

    pub async fn install(&self, id: ProjectId) -> Result<(), DockError> {
        let project = self.load(id)?;
        let cwd = working_dir(&project)?;
        let command = project.resolved_install_command();
        let code = self.run_job(id, &command, &cwd).await?;
        if code != 0 {
            self.log(id, LogStream::System, format!("Install failed (exit {code})"));
            warn!(event = "install_failed", project_id = id, code);
            return Err(DockError::ProcessExitedNonZero { code });
        }
        info!(event = "install_finished", project_id = id);
        Ok(())
    }

    /// Runs the build; on success with `then_start`, replaces any tracked
    /// process with the production server.
    pub async fn build(&self, id: ProjectId, then_start: bool) -> Result<(), DockError> {
        let project = self.load(id)?;
        let cwd = working_dir(&project)?;
        let command = project.resolved_build_command();
        let code = match self.run_job(id, &command, &cwd).await {
            Ok(code) => code,
            Err(err) => {
                self.note_transition(
                    id,
                    StatusChange::new(ProjectStatus::Error).with_error(err.to_string()),
                );
                return Err(err);
            }
        };
        if code != 0 {
            let message = format!("Build failed (exit {code})");
            self.log(id, LogStream::System, message.clone());
            warn!(event = "build_failed", project_id = id, code);
            self.transition(id, StatusChange::new(ProjectStatus::Error).with_error(message))?;
            return Err(DockError::ProcessExitedNonZero { code });
        }
        info!(event = "build_finished", project_id = id, then_start);
        if !then_start {
            return Ok(());
        }

        if self.is_managed(id) {
            self.stop(id).await?;
        }
        let command = project.resolved_start_command();
        self.launch(&project, &command, &cwd, LaunchKind::Production)
            .await
    }

    /// One-shot foreground command. Returns its exit code.
    async fn run_job(&self, id: ProjectId, command: &str, cwd: &Path) -> Result<i32, DockError> {
        self.log(id, LogStream::System, format!("Running: {command}"));
        let mut child = match self.shell_command(command, cwd).spawn() {
            Ok(child) => child,
            Err(err) => {
                self.log(id, LogStream::System, format!("Error: {err}"));
                warn!(event = "job_spawn_failed", project_id = id, error = %err);
                return Err(DockError::ProcessSpawnFailed(err.to_string()));
            }
        };
        let forwarders = self.forward_output(id, &mut child);
        let status = child
            .wait()
            .await
            .map_err(|err| DockError::ProcessSpawnFailed(err.to_string()))?;
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, join_all(forwarders)).await;
        let code = status.code().unwrap_or(1);
        self.log(id, LogStream::System, format!("Exited with code {code}"));
        Ok(code)
    }

    /// Corrects persisted `running` rows against what the OS and the network
    /// actually show. Never fails; anything unconfirmed becomes `stopped`.
    pub async fn reconcile(&self) -> ReconcileReport {
        let running = match self
            .inner
            .registry
            .projects_with_status(ProjectStatus::Running)
        {
            Ok(projects) => projects,
            Err(err) => {
                warn!(event = "reconcile_load_failed", error = %err);
                return ReconcileReport::default();
            }
        };

        let verdicts = join_all(running.iter().map(|project| self.verify_running(project))).await;
        let stopped: Vec<ProjectId> = running
            .iter()
            .zip(verdicts)
            .filter(|(_, alive)| !alive)
            .map(|(project, _)| project.id)
            .collect();
        let ports_discovered = self.discover_missing_ports(&[ProjectStatus::Running]).await;

        let report = ReconcileReport {
            checked: running.len(),
            stopped,
            ports_discovered,
        };
        info!(
            event = "reconcile_finished",
            checked = report.checked,
            stopped = report.stopped.len(),
            ports_discovered = report.ports_discovered
        );
        report
    }

    async fn verify_running(&self, project: &Project) -> bool {
        let id = project.id;
        if let Some(pid) = self.managed_pid(id) {
            if is_pid_alive(pid) {
                return true;
            }
            self.processes().remove(&id);
            self.mark_stopped(id, "managed process is gone");
            return false;
        }

        if let Some(port) = project.port {
            if is_http_up(&self.inner.http, port, self.inner.config.http_timeout).await {
                if project.pid.is_none() {
                    if let Some(owner) = self.inner.probe.pids_on_port(port).await.first() {
                        if let Err(err) = self.inner.registry.set_pid(id, Some(*owner)) {
                            warn!(event = "pid_write_failed", project_id = id, error = %err);
                        }
                    }
                }
                return true;
            }
            self.mark_stopped(id, "port does not answer HTTP");
            return false;
        }

        if project.pid.is_some_and(is_pid_alive) {
            return true;
        }
        self.mark_stopped(id, "no live process or port");
        false
    }

    fn mark_stopped(&self, id: ProjectId, reason: &str) {
        info!(event = "reconcile_marked_stopped", project_id = id, reason);
        self.note_transition(id, StatusChange::new(ProjectStatus::Stopped).with_pid(None));
    }

    async fn discover_missing_ports(&self, statuses: &[ProjectStatus]) -> usize {
        let projects = match self.inner.registry.projects() {
            Ok(projects) => projects,
            Err(err) => {
                warn!(event = "port_discovery_load_failed", error = %err);
                return 0;
            }
        };
        let mut discovered = 0;
        for project in projects
            .iter()
            .filter(|project| project.port.is_none() && statuses.contains(&project.status))
        {
            let Some(pid) = project.pid.or_else(|| self.managed_pid(project.id)) else {
                continue;
            };
            if let Some(port) = self.inner.probe.listening_port_for_pid(pid).await {
                if self.record_port(project.id, port) {
                    discovered += 1;
                }
            }
        }
        discovered
    }

    /// What this host can observe about a project: `running` with the
    /// managed pid, otherwise an HTTP verdict on its port. `None` when there
    /// is nothing to check.
    pub async fn observe(&self, project: &Project) -> Option<ProbeResult> {
        if let Some(pid) = self.managed_pid(project.id) {
            return Some(ProbeResult {
                app_id: project.id,
                status: ProjectStatus::Running,
                pid: Some(pid),
            });
        }
        let port = project.port?;
        let result = if is_http_up(&self.inner.http, port, self.inner.config.http_timeout).await {
            ProbeResult {
                app_id: project.id,
                status: ProjectStatus::Running,
                pid: self.inner.probe.pids_on_port(port).await.first().copied(),
            }
        } else {
            ProbeResult {
                app_id: project.id,
                status: ProjectStatus::Stopped,
                pid: None,
            }
        };
        Some(result)
    }

    /// HTTP-verifies every unmanaged project with a port, then discovers
    /// ports for live projects that lack one.
    pub async fn probe_ports(&self) -> Result<ProbeReport, DockError> {
        let projects = self.inner.registry.projects()?;
        let with_port: Vec<&Project> = projects.iter().filter(|p| p.port.is_some()).collect();
        let unmanaged: Vec<&Project> = with_port
            .iter()
            .copied()
            .filter(|project| !self.is_managed(project.id))
            .collect();

        let observations = join_all(unmanaged.iter().map(|project| self.observe(project))).await;
        let mut updated = 0;
        for (project, observed) in unmanaged.iter().zip(observations) {
            let Some(observed) = observed else {
                continue;
            };
            let was_running = project.status == ProjectStatus::Running;
            let is_running = observed.status == ProjectStatus::Running;
            if is_running && !was_running {
                self.transition(
                    project.id,
                    StatusChange::new(ProjectStatus::Running).with_pid(observed.pid),
                )?;
                updated += 1;
            } else if !is_running && was_running {
                self.transition(
                    project.id,
                    StatusChange::new(ProjectStatus::Stopped).with_pid(None),
                )?;
                updated += 1;
            }
        }
        updated += self
            .discover_missing_ports(&[ProjectStatus::Running, ProjectStatus::Starting])
            .await;

        let report = ProbeReport {
            probed: with_port.len(),
            updated,
        };
        info!(event = "probe_finished", probed = report.probed, updated = report.updated);
        Ok(report)
    }

    /// Starts every `auto_boot` project. A port that already answers HTTP is
    /// adopted as `running`; so is `own_port` when it is already listening,
    /// since that entry is this server itself.
    pub async fn autoboot(&self, own_port: Option<u16>) -> AutobootReport {
        let mut report = AutobootReport::default();
        let projects = match self.inner.registry.projects() {
            Ok(projects) => projects,
            Err(err) => {
                warn!(event = "autoboot_load_failed", error = %err);
                return report;
            }
        };
        let listening = self.inner.probe.listening_ports().await;

        for project in projects.into_iter().filter(|project| project.auto_boot) {
            let id = project.id;
            if project.dev_command().is_none() || project.local_path.is_none() {
                continue;
            }
            if self.is_managed(id) {
                continue;
            }

            if let Some(port) = project.port.filter(|port| listening.contains(port)) {
                if own_port == Some(port) {
                    self.note_transition(id, StatusChange::new(ProjectStatus::Running).with_pid(None));
                    info!(event = "autoboot_self", project_id = id, port);
                    report.adopted.push(id);
                    continue;
                }
                if is_http_up(&self.inner.http, port, self.inner.config.http_timeout).await {
                    let owner = self.inner.probe.pids_on_port(port).await.first().copied();
                    self.note_transition(id, StatusChange::new(ProjectStatus::Running).with_pid(owner));
                    info!(event = "autoboot_adopted", project_id = id, port);
                    report.adopted.push(id);
                    continue;
                }
                info!(event = "autoboot_port_silent", project_id = id, port);
            }

            tokio::time::sleep(self.inner.config.restart_settle).await;
            match self.start(id).await {
                Ok(()) => report.started.push(id),
                Err(err) => {
                    warn!(event = "autoboot_start_failed", project_id = id, name = %project.name, error = %err);
                    report.failed.push((id, err));
                }
            }
        }
        report
    }

    /// First port at or above the configured start that no project claims,
    /// nothing listens on and `extra` does not list.
    pub async fn find_vacant_port(&self, extra: &[u16]) -> Result<Option<u16>, DockError> {
        let mut used: BTreeSet<u16> = self
            .inner
            .registry
            .projects()?
            .iter()
            .filter_map(|project| project.port)
            .collect();
        used.extend(self.inner.probe.listening_ports().await);
        used.extend(extra.iter().copied());
        Ok(first_vacant_port(&used, self.inner.config.vacant_port_start))
    }
}

pub fn first_vacant_port(used: &BTreeSet<u16>, start: u16) -> Option<u16> {
    (start..=u16::MAX).find(|port| !used.contains(port))
}

fn working_dir(project: &Project) -> Result<PathBuf, DockError> {
    project
        .local_path
        .clone()
        .filter(|path| !path.as_os_str().is_empty())
        .ok_or(DockError::NotConfigured("local path"))
}

async fn wait_for_exit(exited: &mut watch::Receiver<bool>) {
    loop {
        if *exited.borrow() {
            return;
        }
        if exited.changed().await.is_err() {
            return;
        }
    }
}

async fn forward_lines<R>(reader: R, logs: LogSink, id: ProjectId, stream: LogStream)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line_buf = Vec::new();
    while let Some(line) = next_output_line(&mut reader, &mut line_buf).await {
        if line.is_empty() {
            continue;
        }
        logs.record(id, stream, line);
    }
}

/// Reads one newline-terminated chunk and decodes it lossily, so stray bytes
/// never stop the pipe from being drained. `None` at end of stream or on a
/// read error.
async fn next_output_line<R>(reader: &mut R, line_buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    line_buf.clear();
    match reader.read_until(b'\n', line_buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let text = String::from_utf8_lossy(line_buf);
            Some(text.trim_end_matches(['\r', '\n']).to_string())
        }
    }
}

#[async_trait]
impl ProcessControl for Supervisor {
    async fn start(&self, id: ProjectId) -> Result<(), DockError> {
        Supervisor::start(self, id).await
    }

    async fn stop(&self, id: ProjectId) -> Result<(), DockError> {
        Supervisor::stop(self, id).await
    }

    async fn restart(&self, id: ProjectId) -> Result<(), DockError> {
        Supervisor::restart(self, id).await
    }

    async fn install(&self, id: ProjectId) -> Result<(), DockError> {
        Supervisor::install(self, id).await
    }

    async fn build(&self, id: ProjectId, then_start: bool) -> Result<(), DockError> {
        Supervisor::build(self, id, then_start).await
    }

    async fn reconcile(&self) {
        Supervisor::reconcile(self).await;
    }

    async fn probe_ports(&self) -> Result<ProbeReport, DockError> {
        Supervisor::probe_ports(self).await
    }
}
