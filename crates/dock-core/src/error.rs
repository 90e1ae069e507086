use crate::ProjectId;
use thiserror::Error;

/// Failures surfaced by supervisor and agent operations. Every variant is
/// recoverable at the call site; the message is what users see.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DockError {
    #[error("Already running")]
    AlreadyRunning,
    #[error("No {0} configured")]
    NotConfigured(&'static str),
    #[error("Port {0} is already in use - stop the existing process first")]
    PortInUse(u16),
    #[error("Project {0} not found")]
    NotFound(ProjectId),
    #[error("No agent connected")]
    AgentDisconnected,
    #[error("Agent command timed out: {0}")]
    AgentTimeout(String),
    #[error("{0}")]
    RemoteRejected(String),
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),
    #[error("Process exited with code {code}")]
    ProcessExitedNonZero { code: i32 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl DockError {
    /// Transient conditions a caller may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DockError::AgentTimeout(_) | DockError::AgentDisconnected | DockError::PortInUse(_)
        )
    }
}
