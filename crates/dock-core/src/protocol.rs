//! Wire protocol spoken between the hub and a remote agent.
//!
//! Every frame is one JSON object with a `type` discriminator. Commands flow
//! hub -> agent and carry a `requestId` whenever a reply is expected; events
//! flow agent -> hub and either answer a command (echoing its `requestId`) or
//! are pushed unsolicited (`hello`, `pong`, `status`, `port`, `log`).

use crate::{LogStream, Project, ProjectId, ProjectStatus};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// What the agent needs to know to run a project on its machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub id: ProjectId,
    pub name: String,
    pub local_path: String,
    #[serde(default)]
    pub dev_command: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
}

impl From<&Project> for AppConfig {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id,
            name: project.name.clone(),
            local_path: project
                .local_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string())
                .unwrap_or_default(),
            dev_command: project.dev_command.clone(),
            port: project.port,
            package_manager: project.package_manager.clone(),
            install_command: project.install_command.clone(),
            build_command: project.build_command.clone(),
            start_command: project.start_command.clone(),
        }
    }
}

impl AppConfig {
    /// Registry facts as the agent sees them; lifecycle fields start empty.
    pub fn to_project(&self) -> Project {
        Project {
            id: self.id,
            name: self.name.clone(),
            local_path: (!self.local_path.is_empty()).then(|| PathBuf::from(&self.local_path)),
            dev_command: self.dev_command.clone(),
            port: self.port,
            package_manager: self.package_manager.clone(),
            install_command: self.install_command.clone(),
            build_command: self.build_command.clone(),
            start_command: self.start_command.clone(),
            ..Project::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeableApp {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub dev_command: Option<String>,
    #[serde(default)]
    pub package_manager: Option<String>,
}

impl From<&Project> for ProbeableApp {
    fn from(project: &Project) -> Self {
        Self {
            id: project.id,
            name: project.name.clone(),
            port: project.port,
            pid: project.pid,
            local_path: project
                .local_path
                .as_ref()
                .map(|path| path.to_string_lossy().to_string()),
            dev_command: project.dev_command.clone(),
            package_manager: project.package_manager.clone(),
        }
    }
}

impl ProbeableApp {
    pub fn to_project(&self, status: ProjectStatus) -> Project {
        Project {
            id: self.id,
            name: self.name.clone(),
            local_path: self.local_path.as_ref().map(PathBuf::from),
            dev_command: self.dev_command.clone(),
            port: self.port,
            package_manager: self.package_manager.clone(),
            status,
            pid: self.pid,
            ..Project::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub app_id: ProjectId,
    pub status: ProjectStatus,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScannedApp {
    pub name: String,
    pub local_path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub dev_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentCommand {
    Ping,
    #[serde(rename_all = "camelCase")]
    Start { request_id: String, app: AppConfig },
    #[serde(rename_all = "camelCase")]
    Stop { request_id: String, app: AppConfig },
    #[serde(rename_all = "camelCase")]
    Restart { request_id: String, app: AppConfig },
    #[serde(rename_all = "camelCase")]
    Install { request_id: String, app: AppConfig },
    #[serde(rename_all = "camelCase")]
    Build {
        request_id: String,
        app: AppConfig,
        #[serde(default)]
        then_start: bool,
    },
    #[serde(rename_all = "camelCase")]
    Scan { request_id: String },
    #[serde(rename_all = "camelCase")]
    Probe {
        request_id: String,
        apps: Vec<ProbeableApp>,
    },
    #[serde(rename_all = "camelCase")]
    Reconcile {
        request_id: String,
        running_apps: Vec<ProbeableApp>,
    },
    #[serde(rename_all = "camelCase")]
    ReadFile { request_id: String, path: String },
    #[serde(rename_all = "camelCase")]
    VacantPort {
        request_id: String,
        #[serde(default)]
        used_ports: Vec<u16>,
    },
}

impl AgentCommand {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentCommand::Ping => None,
            AgentCommand::Start { request_id, .. }
            | AgentCommand::Stop { request_id, .. }
            | AgentCommand::Restart { request_id, .. }
            | AgentCommand::Install { request_id, .. }
            | AgentCommand::Build { request_id, .. }
            | AgentCommand::Scan { request_id }
            | AgentCommand::Probe { request_id, .. }
            | AgentCommand::Reconcile { request_id, .. }
            | AgentCommand::ReadFile { request_id, .. }
            | AgentCommand::VacantPort { request_id, .. } => Some(request_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentCommand::Ping => "ping",
            AgentCommand::Start { .. } => "start",
            AgentCommand::Stop { .. } => "stop",
            AgentCommand::Restart { .. } => "restart",
            AgentCommand::Install { .. } => "install",
            AgentCommand::Build { .. } => "build",
            AgentCommand::Scan { .. } => "scan",
            AgentCommand::Probe { .. } => "probe",
            AgentCommand::Reconcile { .. } => "reconcile",
            AgentCommand::ReadFile { .. } => "readFile",
            AgentCommand::VacantPort { .. } => "vacantPort",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AgentEvent {
    Pong,
    #[serde(rename_all = "camelCase")]
    Hello {
        agent_id: String,
        name: String,
        #[serde(default)]
        scan_root: String,
        #[serde(default)]
        version: String,
        #[serde(default)]
        platform: String,
    },
    #[serde(rename_all = "camelCase")]
    Log {
        app_id: ProjectId,
        stream: LogStream,
        message: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        app_id: ProjectId,
        status: ProjectStatus,
        #[serde(default)]
        pid: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    Port { app_id: ProjectId, port: u16 },
    #[serde(rename_all = "camelCase")]
    Ack {
        request_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ScanResult {
        request_id: String,
        apps: Vec<ScannedApp>,
    },
    #[serde(rename_all = "camelCase")]
    ProbeResult {
        request_id: String,
        results: Vec<ProbeResult>,
    },
    #[serde(rename_all = "camelCase")]
    ReconcileResult {
        request_id: String,
        statuses: Vec<ProbeResult>,
    },
    #[serde(rename_all = "camelCase")]
    FileContent { request_id: String, content: String },
    #[serde(rename_all = "camelCase")]
    VacantPort { request_id: String, port: u16 },
}

impl AgentEvent {
    /// The correlated request, or `None` for unsolicited events.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AgentEvent::Pong
            | AgentEvent::Hello { .. }
            | AgentEvent::Log { .. }
            | AgentEvent::Status { .. }
            | AgentEvent::Port { .. } => None,
            AgentEvent::Ack { request_id, .. }
            | AgentEvent::ScanResult { request_id, .. }
            | AgentEvent::ProbeResult { request_id, .. }
            | AgentEvent::ReconcileResult { request_id, .. }
            | AgentEvent::FileContent { request_id, .. }
            | AgentEvent::VacantPort { request_id, .. } => Some(request_id),
        }
    }

    pub fn ack(request_id: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => AgentEvent::Ack {
                request_id: request_id.to_string(),
                ok: true,
                error: None,
            },
            Err(message) => AgentEvent::Ack {
                request_id: request_id.to_string(),
                ok: false,
                error: Some(message),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: bytes.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(bytes).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppConfig {
        AppConfig {
            id: 7,
            name: "web".to_string(),
            local_path: "/srv/web".to_string(),
            dev_command: Some("npm run dev".to_string()),
            port: Some(4500),
            package_manager: Some("npm".to_string()),
            install_command: None,
            build_command: None,
            start_command: None,
        }
    }

    #[test]
    fn start_command_matches_wire_shape() {
        let command = AgentCommand::Start {
            request_id: "r1".to_string(),
            app: app(),
        };
        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "type": "start",
                "requestId": "r1",
                "app": {
                    "id": 7,
                    "name": "web",
                    "localPath": "/srv/web",
                    "devCommand": "npm run dev",
                    "port": 4500,
                    "packageManager": "npm"
                }
            })
        );
    }

    #[test]
    fn multiword_variants_use_camel_case_tags() {
        let read = AgentCommand::ReadFile {
            request_id: "r2".to_string(),
            path: "README.md".to_string(),
        };
        let value = serde_json::to_value(&read).expect("serialize");
        assert_eq!(value["type"], "readFile");
        assert_eq!(read.kind(), "readFile");

        let ping = serde_json::to_value(AgentCommand::Ping).expect("serialize");
        assert_eq!(ping, serde_json::json!({"type": "ping"}));
        assert_eq!(AgentCommand::Ping.request_id(), None);
    }

    #[test]
    fn decodes_agent_events_from_raw_json() {
        let ack: AgentEvent = decode_frame(
            br#"{"type":"ack","requestId":"r1","ok":false,"error":"No dev command configured"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("ack");
        assert_eq!(ack.request_id(), Some("r1"));
        assert_eq!(
            ack,
            AgentEvent::Ack {
                request_id: "r1".to_string(),
                ok: false,
                error: Some("No dev command configured".to_string())
            }
        );

        let status: AgentEvent = decode_frame(
            br#"{"type":"status","appId":3,"status":"running","pid":991}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("status");
        assert_eq!(status.request_id(), None);

        let log: AgentEvent = decode_frame(
            br#"{"type":"log","appId":3,"stream":"stderr","message":"boom","createdAt":"2026-02-07T21:00:00Z"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("log");
        match log {
            AgentEvent::Log { stream, .. } => assert_eq!(stream, LogStream::Stderr),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_a_decode_error() {
        let result: Result<AgentEvent, _> =
            decode_frame(br#"{"type":"docker:containers","requestId":"x"}"#, DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(FrameError::Decode(_))));

        let garbage: Result<AgentEvent, _> = decode_frame(b"not json", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(garbage, Err(FrameError::Decode(_))));
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let command = AgentCommand::ReadFile {
            request_id: "r3".to_string(),
            path: "x".repeat(256),
        };
        assert!(matches!(
            encode_frame(&command, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        let raw = vec![b' '; 128];
        let result: Result<AgentEvent, _> = decode_frame(&raw, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn app_config_carries_registry_facts_only() {
        let project = app().to_project();
        assert_eq!(project.local_path, Some(PathBuf::from("/srv/web")));
        assert_eq!(project.status, ProjectStatus::Stopped);
        assert_eq!(AppConfig::from(&project), app());

        let bare = AppConfig {
            local_path: String::new(),
            ..app()
        };
        assert_eq!(bare.to_project().local_path, None);
    }
}
