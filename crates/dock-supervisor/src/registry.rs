use dock_core::{DockError, Project, ProjectId, ProjectRegistry, StatusChange};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Registry held entirely in memory, for hosts with no database of their
/// own. The agent feeds it from command payloads.
#[derive(Default)]
pub struct MemoryRegistry {
    projects: RwLock<BTreeMap<ProjectId, Project>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole record.
    pub fn insert(&self, project: Project) -> Result<(), DockError> {
        let mut projects = self.write()?;
        projects.insert(project.id, project);
        Ok(())
    }

    /// Refreshes registry facts while keeping the lifecycle fields this host
    /// has already observed.
    pub fn upsert_facts(&self, project: Project) -> Result<(), DockError> {
        let mut projects = self.write()?;
        match projects.get_mut(&project.id) {
            Some(existing) => {
                existing.name = project.name;
                existing.local_path = project.local_path;
                existing.dev_command = project.dev_command;
                existing.package_manager = project.package_manager;
                existing.install_command = project.install_command;
                existing.build_command = project.build_command;
                existing.start_command = project.start_command;
                existing.auto_boot = project.auto_boot;
                if project.port.is_some() {
                    existing.port = project.port;
                }
            }
            None => {
                projects.insert(project.id, project);
            }
        }
        Ok(())
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<ProjectId, Project>>, DockError> {
        self.projects
            .write()
            .map_err(|_| DockError::Storage("registry lock poisoned".to_string()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<ProjectId, Project>>, DockError> {
        self.projects
            .read()
            .map_err(|_| DockError::Storage("registry lock poisoned".to_string()))
    }

    fn update(
        &self,
        id: ProjectId,
        apply: impl FnOnce(&mut Project),
    ) -> Result<(), DockError> {
        let mut projects = self.write()?;
        let project = projects.get_mut(&id).ok_or(DockError::NotFound(id))?;
        apply(project);
        Ok(())
    }
}

impl ProjectRegistry for MemoryRegistry {
    fn project(&self, id: ProjectId) -> Result<Option<Project>, DockError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn projects(&self) -> Result<Vec<Project>, DockError> {
        Ok(self.read()?.values().cloned().collect())
    }

    fn apply_status(&self, id: ProjectId, change: &StatusChange) -> Result<(), DockError> {
        self.update(id, |project| change.apply_to(project))
    }

    fn set_port(&self, id: ProjectId, port: u16) -> Result<(), DockError> {
        self.update(id, |project| project.port = Some(port))
    }

    fn set_pid(&self, id: ProjectId, pid: Option<u32>) -> Result<(), DockError> {
        self.update(id, |project| project.pid = pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dock_core::ProjectStatus;

    #[test]
    fn upsert_keeps_observed_lifecycle() {
        let registry = MemoryRegistry::new();
        registry
            .insert(Project {
                id: 3,
                name: "web".to_string(),
                port: Some(3000),
                ..Project::default()
            })
            .expect("insert");
        registry
            .apply_status(
                3,
                &StatusChange::new(ProjectStatus::Running).with_pid(Some(900)),
            )
            .expect("status");

        registry
            .upsert_facts(Project {
                id: 3,
                name: "web-renamed".to_string(),
                dev_command: Some("vite".to_string()),
                ..Project::default()
            })
            .expect("upsert");

        let project = registry.project(3).expect("read").expect("present");
        assert_eq!(project.name, "web-renamed");
        assert_eq!(project.status, ProjectStatus::Running);
        assert_eq!(project.pid, Some(900));
        assert_eq!(project.port, Some(3000));
        assert_eq!(
            registry.projects_with_status(ProjectStatus::Running).expect("filter").len(),
            1
        );
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let registry = MemoryRegistry::new();
        assert_eq!(registry.set_pid(8, None), Err(DockError::NotFound(8)));
        assert_eq!(registry.project(8), Ok(None));
    }
}
