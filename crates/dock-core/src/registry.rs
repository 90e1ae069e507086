//! Seams between the supervision engine and whatever persists project state.

use crate::{DockError, LogLine, Project, ProjectId, ProjectStatus};
use chrono::{DateTime, Utc};

/// A status transition plus the lifecycle fields it touches. Fields left as
/// `None` keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ProjectStatus,
    pub pid: Option<Option<u32>>,
    pub last_error: Option<Option<String>>,
    pub last_started_at: Option<DateTime<Utc>>,
}

impl StatusChange {
    pub fn new(status: ProjectStatus) -> Self {
        Self {
            status,
            pid: None,
            last_error: None,
            last_started_at: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_started_at = Some(at);
        self
    }

    /// The pid reported on the status bus for this change.
    pub fn event_pid(&self) -> Option<u32> {
        self.pid.flatten()
    }

    pub fn apply_to(&self, project: &mut Project) {
        project.status = self.status;
        if let Some(pid) = self.pid {
            project.pid = pid;
        }
        if let Some(error) = &self.last_error {
            project.last_error = error.clone();
        }
        if let Some(at) = self.last_started_at {
            project.last_started_at = Some(at);
        }
    }
}

pub trait ProjectRegistry: Send + Sync {
    fn project(&self, id: ProjectId) -> Result<Option<Project>, DockError>;

    fn projects(&self) -> Result<Vec<Project>, DockError>;

    fn projects_with_status(&self, status: ProjectStatus) -> Result<Vec<Project>, DockError> {
        Ok(self
            .projects()?
            .into_iter()
            .filter(|project| project.status == status)
            .collect())
    }

    /// Fails with `NotFound` when the project does not exist.
    fn apply_status(&self, id: ProjectId, change: &StatusChange) -> Result<(), DockError>;

    fn set_port(&self, id: ProjectId, port: u16) -> Result<(), DockError>;

    fn set_pid(&self, id: ProjectId, pid: Option<u32>) -> Result<(), DockError>;
}

/// Durable half of the log sink.
pub trait LogStore: Send + Sync {
    fn insert(&self, line: &LogLine) -> Result<(), DockError>;

    fn count(&self, project_id: ProjectId) -> Result<u64, DockError>;

    /// Removes up to `limit` of the oldest lines, returning how many went.
    fn delete_oldest(&self, project_id: ProjectId, limit: u64) -> Result<u64, DockError>;

    fn clear(&self, project_id: ProjectId) -> Result<(), DockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_fields_survive_a_change() {
        let mut project = Project {
            id: 1,
            name: "api".to_string(),
            status: ProjectStatus::Running,
            pid: Some(10),
            last_error: Some("old".to_string()),
            ..Project::default()
        };
        StatusChange::new(ProjectStatus::Error)
            .with_error("Build failed (exit 2)")
            .apply_to(&mut project);
        assert_eq!(project.status, ProjectStatus::Error);
        assert_eq!(project.pid, Some(10));
        assert_eq!(project.last_error.as_deref(), Some("Build failed (exit 2)"));

        let change = StatusChange::new(ProjectStatus::Stopped).with_pid(None).clear_error();
        change.apply_to(&mut project);
        assert_eq!(project.pid, None);
        assert_eq!(project.last_error, None);
        assert_eq!(change.event_pid(), None);
    }
}
