use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub mod auth;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;

pub use error::DockError;
pub use registry::{LogStore, ProjectRegistry, StatusChange};

pub type ProjectId = i64;

/// Lifecycle state persisted on a project row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl Default for ProjectStatus {
    fn default() -> Self {
        Self::Stopped
    }
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "stopped" => Ok(ProjectStatus::Stopped),
            "starting" => Ok(ProjectStatus::Starting),
            "running" => Ok(ProjectStatus::Running),
            "error" => Ok(ProjectStatus::Error),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            "system" => Ok(LogStream::System),
            other => Err(format!("Unknown stream: {other}")),
        }
    }
}

/// One line of process output, tagged with the stream it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub project_id: ProjectId,
    pub stream: LogStream,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Bun,
    Yarn,
}

impl PackageManager {
    /// Unknown or missing values fall back to npm.
    pub fn from_name(name: Option<&str>) -> Self {
        match name.map(|value| value.trim().to_lowercase()).as_deref() {
            Some("pnpm") => PackageManager::Pnpm,
            Some("bun") => PackageManager::Bun,
            Some("yarn") => PackageManager::Yarn,
            _ => PackageManager::Npm,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Bun => "bun",
            PackageManager::Yarn => "yarn",
        }
    }

    pub fn install_command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm install",
            PackageManager::Pnpm => "pnpm install",
            PackageManager::Bun => "bun install",
            PackageManager::Yarn => "yarn",
        }
    }

    pub fn build_command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm run build",
            PackageManager::Pnpm => "pnpm build",
            PackageManager::Bun => "bun run build",
            PackageManager::Yarn => "yarn build",
        }
    }

    pub fn start_command(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm start",
            PackageManager::Pnpm => "pnpm start",
            PackageManager::Bun => "bun start",
            PackageManager::Yarn => "yarn start",
        }
    }
}

/// Registry facts about a project. The supervisor only ever writes the
/// lifecycle fields (`status`, `pid`, `port`, `last_*`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub dev_command: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub auto_boot: bool,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub last_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Project {
    pub fn package_manager(&self) -> PackageManager {
        PackageManager::from_name(self.package_manager.as_deref())
    }

    pub fn resolved_install_command(&self) -> String {
        non_empty(self.install_command.as_deref())
            .unwrap_or_else(|| self.package_manager().install_command())
            .to_string()
    }

    pub fn resolved_build_command(&self) -> String {
        non_empty(self.build_command.as_deref())
            .unwrap_or_else(|| self.package_manager().build_command())
            .to_string()
    }

    pub fn resolved_start_command(&self) -> String {
        non_empty(self.start_command.as_deref())
            .unwrap_or_else(|| self.package_manager().start_command())
            .to_string()
    }

    pub fn dev_command(&self) -> Option<&str> {
        non_empty(self.dev_command.as_deref())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|text| !text.trim().is_empty())
}

/// Events published on the status bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorEvent {
    #[serde(rename_all = "camelCase")]
    Status {
        project_id: ProjectId,
        status: ProjectStatus,
        pid: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Port { project_id: ProjectId, port: u16 },
}

impl SupervisorEvent {
    pub fn project_id(&self) -> ProjectId {
        match self {
            SupervisorEvent::Status { project_id, .. } => *project_id,
            SupervisorEvent::Port { project_id, .. } => *project_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_manager_defaults_to_npm() {
        assert_eq!(PackageManager::from_name(None), PackageManager::Npm);
        assert_eq!(PackageManager::from_name(Some("cargo")), PackageManager::Npm);
        assert_eq!(PackageManager::from_name(Some(" PNPM ")), PackageManager::Pnpm);
        assert_eq!(PackageManager::Yarn.install_command(), "yarn");
        assert_eq!(PackageManager::Bun.build_command(), "bun run build");
    }

    #[test]
    fn command_overrides_win_over_package_manager() {
        let project = Project {
            id: 1,
            name: "web".to_string(),
            package_manager: Some("pnpm".to_string()),
            build_command: Some("make dist".to_string()),
            start_command: Some("   ".to_string()),
            ..Project::default()
        };
        assert_eq!(project.resolved_build_command(), "make dist");
        assert_eq!(project.resolved_start_command(), "pnpm start");
        assert_eq!(project.resolved_install_command(), "pnpm install");
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ProjectStatus::Stopped,
            ProjectStatus::Starting,
            ProjectStatus::Running,
            ProjectStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<ProjectStatus>(), Ok(status));
        }
        assert!("paused".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn supervisor_event_serializes_with_camel_case_fields() {
        let event = SupervisorEvent::Status {
            project_id: 7,
            status: ProjectStatus::Running,
            pid: Some(42),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"type": "status", "projectId": 7, "status": "running", "pid": 42})
        );
    }
}
