use chrono::{DateTime, Utc};
use dock_core::{
    DockError, LogLine, LogStore, LogStream, Project, ProjectId, ProjectRegistry, ProjectStatus, StatusChange,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

pub const DOCK_SCHEMA_VERSION: i64 = 1;

const PROJECT_COLUMNS: &str = "
    id, name, local_path, dev_command, port, package_manager,
    install_command, build_command, start_command, auto_boot,
    status, pid, last_started_at, last_error
";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<StorageError> for DockError {
    fn from(err: StorageError) -> Self {
        DockError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub scan_root: String,
    pub status: String,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// sqlite-backed registry, log store and agent directory. One connection,
/// one lock.
pub struct DockStore {
    conn: Mutex<Connection>,
}

impl DockStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > DOCK_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: DOCK_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_dock_schema.sql");
            let conn = self.conn()?;
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
            tracing::info!(event = "storage_migrated", from = current, to = 1);
        }

        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Inserts a registry row and returns its id. Lifecycle fields on the
    /// input are stored as given.
    pub fn insert_project(&self, project: &Project) -> Result<ProjectId, StorageError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO projects (
                name, local_path, dev_command, port, package_manager,
                install_command, build_command, start_command, auto_boot,
                status, pid, last_started_at, last_error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)
            ",
            params![
                project.name,
                project
                    .local_path
                    .as_ref()
                    .map(|path| path.to_string_lossy().to_string()),
                project.dev_command,
                project.port.map(i64::from),
                project.package_manager,
                project.install_command,
                project.build_command,
                project.start_command,
                project.auto_boot,
                project.status.as_str(),
                project.pid.map(i64::from),
                project.last_started_at.map(|at| at.to_rfc3339()),
                project.last_error,
                now,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StorageError> {
        let conn = self.conn()?;
        let project = conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                [id],
                project_from_row,
            )
            .optional()?;
        Ok(project)
    }

    pub fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>, StorageError> {
        let conn = self.conn()?;
        let mut projects = Vec::new();
        match status {
            Some(status) => {
                let mut statement = conn.prepare(&format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects WHERE status = ?1 ORDER BY id ASC"
                ))?;
                let rows = statement.query_map([status.as_str()], project_from_row)?;
                for row in rows {
                    projects.push(row?);
                }
            }
            None => {
                let mut statement =
                    conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id ASC"))?;
                let rows = statement.query_map([], project_from_row)?;
                for row in rows {
                    projects.push(row?);
                }
            }
        }
        Ok(projects)
    }

    /// Returns false when no such project exists.
    pub fn update_status(&self, id: ProjectId, change: &StatusChange) -> Result<bool, StorageError> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![change.status.as_str(), now, id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(pid) = change.pid {
            tx.execute(
                "UPDATE projects SET pid = ?1 WHERE id = ?2",
                params![pid.map(i64::from), id],
            )?;
        }
        if let Some(error) = &change.last_error {
            tx.execute(
                "UPDATE projects SET last_error = ?1 WHERE id = ?2",
                params![error, id],
            )?;
        }
        if let Some(at) = change.last_started_at {
            tx.execute(
                "UPDATE projects SET last_started_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    pub fn update_port(&self, id: ProjectId, port: u16) -> Result<bool, StorageError> {
        let changed = self.conn()?.execute(
            "UPDATE projects SET port = ?1, updated_at = ?2 WHERE id = ?3",
            params![i64::from(port), Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn update_pid(&self, id: ProjectId, pid: Option<u32>) -> Result<bool, StorageError> {
        let changed = self.conn()?.execute(
            "UPDATE projects SET pid = ?1, updated_at = ?2 WHERE id = ?3",
            params![pid.map(i64::from), Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn used_ports(&self) -> Result<Vec<u16>, StorageError> {
        let conn = self.conn()?;
        let mut statement =
            conn.prepare("SELECT port FROM projects WHERE port IS NOT NULL ORDER BY port ASC")?;
        let rows = statement.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ports = Vec::new();
        for row in rows {
            if let Ok(port) = u16::try_from(row?) {
                ports.push(port);
            }
        }
        Ok(ports)
    }

    pub fn insert_log(&self, line: &LogLine) -> Result<i64, StorageError> {
        let conn = self.conn()?;
        conn.execute(
            "
            INSERT INTO process_logs (project_id, stream, message, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                line.project_id,
                line.stream.as_str(),
                line.message,
                line.created_at.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn log_count(&self, project_id: ProjectId) -> Result<u64, StorageError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM process_logs WHERE project_id = ?1",
            [project_id],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn delete_oldest_logs(&self, project_id: ProjectId, limit: u64) -> Result<u64, StorageError> {
        let removed = self.conn()?.execute(
            "
            DELETE FROM process_logs
            WHERE id IN (
                SELECT id FROM process_logs
                WHERE project_id = ?1
                ORDER BY id ASC
                LIMIT ?2
            )
            ",
            params![project_id, limit as i64],
        )?;
        Ok(removed as u64)
    }

    /// Most recent `limit` lines, oldest first.
    pub fn recent_logs(&self, project_id: ProjectId, limit: u64) -> Result<Vec<LogLine>, StorageError> {
        let conn = self.conn()?;
        let mut statement = conn.prepare(
            "
            SELECT project_id, stream, message, created_at FROM (
                SELECT id, project_id, stream, message, created_at
                FROM process_logs
                WHERE project_id = ?1
                ORDER BY id DESC
                LIMIT ?2
            ) ORDER BY id ASC
            ",
        )?;
        let rows = statement.query_map(params![project_id, limit as i64], |row| {
            let stream: String = row.get(1)?;
            let stream = stream.parse::<LogStream>().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
                )
            })?;
            Ok(LogLine {
                project_id: row.get(0)?,
                stream,
                message: row.get(2)?,
                created_at: timestamp_column(row, 3)?,
            })
        })?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?);
        }
        Ok(lines)
    }

    pub fn clear_logs(&self, project_id: ProjectId) -> Result<(), StorageError> {
        self.conn()?
            .execute("DELETE FROM process_logs WHERE project_id = ?1", [project_id])?;
        Ok(())
    }

    pub fn upsert_agent_online(
        &self,
        agent_id: &str,
        name: &str,
        platform: &str,
        version: &str,
        scan_root: &str,
    ) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "
            INSERT INTO agents (
                agent_id, name, platform, version, scan_root, status,
                connected_at, last_seen_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'online', ?6, ?6, ?6, ?6)
            ON CONFLICT(agent_id) DO UPDATE SET
                name=excluded.name,
                platform=excluded.platform,
                version=excluded.version,
                scan_root=excluded.scan_root,
                status='online',
                connected_at=excluded.connected_at,
                last_seen_at=excluded.last_seen_at,
                updated_at=excluded.updated_at
            ",
            params![agent_id, name, platform, version, scan_root, now],
        )?;
        Ok(())
    }

    pub fn touch_agent(&self, agent_id: &str) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "UPDATE agents SET last_seen_at = ?1, updated_at = ?1 WHERE agent_id = ?2",
            params![now, agent_id],
        )?;
        Ok(())
    }

    pub fn mark_agent_offline(&self, agent_id: &str) -> Result<(), StorageError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "UPDATE agents SET status = 'offline', last_seen_at = ?1, updated_at = ?1 WHERE agent_id = ?2",
            params![now, agent_id],
        )?;
        Ok(())
    }

    pub fn agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StorageError> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "
                SELECT agent_id, name, platform, version, scan_root, status, connected_at, last_seen_at
                FROM agents WHERE agent_id = ?1
                ",
                [agent_id],
                |row| {
                    Ok(AgentRecord {
                        agent_id: row.get(0)?,
                        name: row.get(1)?,
                        platform: row.get(2)?,
                        version: row.get(3)?,
                        scan_root: row.get(4)?,
                        status: row.get(5)?,
                        connected_at: optional_timestamp_column(row, 6)?,
                        last_seen_at: optional_timestamp_column(row, 7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}

impl ProjectRegistry for DockStore {
    fn project(&self, id: ProjectId) -> Result<Option<Project>, DockError> {
        Ok(self.get_project(id)?)
    }

    fn projects(&self) -> Result<Vec<Project>, DockError> {
        Ok(self.list_projects(None)?)
    }

    fn projects_with_status(&self, status: ProjectStatus) -> Result<Vec<Project>, DockError> {
        Ok(self.list_projects(Some(status))?)
    }

    fn apply_status(&self, id: ProjectId, change: &StatusChange) -> Result<(), DockError> {
        if self.update_status(id, change)? {
            Ok(())
        } else {
            Err(DockError::NotFound(id))
        }
    }

    fn set_port(&self, id: ProjectId, port: u16) -> Result<(), DockError> {
        if self.update_port(id, port)? {
            Ok(())
        } else {
            Err(DockError::NotFound(id))
        }
    }

    fn set_pid(&self, id: ProjectId, pid: Option<u32>) -> Result<(), DockError> {
        if self.update_pid(id, pid)? {
            Ok(())
        } else {
            Err(DockError::NotFound(id))
        }
    }
}

impl LogStore for DockStore {
    fn insert(&self, line: &LogLine) -> Result<(), DockError> {
        self.insert_log(line)?;
        Ok(())
    }

    fn count(&self, project_id: ProjectId) -> Result<u64, DockError> {
        Ok(self.log_count(project_id)?)
    }

    fn delete_oldest(&self, project_id: ProjectId, limit: u64) -> Result<u64, DockError> {
        Ok(self.delete_oldest_logs(project_id, limit)?)
    }

    fn clear(&self, project_id: ProjectId) -> Result<(), DockError> {
        Ok(self.clear_logs(project_id)?)
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    let status: String = row.get(10)?;
    let status = status.parse::<ProjectStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            10,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        local_path: row.get::<_, Option<String>>(2)?.map(PathBuf::from),
        dev_command: row.get(3)?,
        port: row
            .get::<_, Option<i64>>(4)?
            .and_then(|port| u16::try_from(port).ok()),
        package_manager: row.get(5)?,
        install_command: row.get(6)?,
        build_command: row.get(7)?,
        start_command: row.get(8)?,
        auto_boot: row.get::<_, i64>(9)? != 0,
        status,
        pid: row
            .get::<_, Option<i64>>(11)?
            .and_then(|pid| u32::try_from(pid).ok()),
        last_started_at: optional_timestamp_column(row, 12)?,
        last_error: row.get(13)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => parse_timestamp(&raw).map(Some).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
        }),
        None => Ok(None),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn sample_project(name: &str, port: Option<u16>) -> Project {
        Project {
            name: name.to_string(),
            local_path: Some(PathBuf::from(format!("/srv/{name}"))),
            dev_command: Some("npm run dev".to_string()),
            port,
            package_manager: Some("pnpm".to_string()),
            ..Project::default()
        }
    }

    fn line(project_id: ProjectId, message: &str) -> LogLine {
        LogLine {
            project_id,
            stream: LogStream::Stdout,
            message: message.to_string(),
            created_at: ts(),
        }
    }

    #[test]
    fn migration_creates_dock_tables() {
        let db = DockStore::open_in_memory().expect("open db");
        for table in ["projects", "process_logs", "agents"] {
            assert!(db.table_exists(table).expect("table check"));
        }
        assert_eq!(db.schema_version().expect("schema version"), DOCK_SCHEMA_VERSION);
    }

    #[test]
    fn reopening_a_file_keeps_rows_and_version() {
        let file = NamedTempFile::new().expect("temp db");
        let id = {
            let db = DockStore::open(file.path()).expect("open db");
            db.insert_project(&sample_project("web", Some(3100)))
                .expect("insert")
        };
        let db = DockStore::open(file.path()).expect("reopen db");
        let project = db.get_project(id).expect("query").expect("present");
        assert_eq!(project.name, "web");
        assert_eq!(project.port, Some(3100));
        assert_eq!(project.status, ProjectStatus::Stopped);
        assert_eq!(project.package_manager.as_deref(), Some("pnpm"));
        assert_eq!(db.schema_version().expect("version"), DOCK_SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("raw open");
            conn.execute("PRAGMA user_version = 9", []).expect("bump");
        }
        match DockStore::open(file.path()) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 9);
                assert_eq!(supported, DOCK_SCHEMA_VERSION);
            }
            other => panic!("expected schema rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn status_change_only_touches_named_fields() {
        let db = DockStore::open_in_memory().expect("open db");
        let id = db.insert_project(&sample_project("api", None)).expect("insert");

        db.apply_status(
            id,
            &StatusChange::new(ProjectStatus::Running)
                .with_pid(Some(4242))
                .started_at(ts()),
        )
        .expect("running");
        db.apply_status(id, &StatusChange::new(ProjectStatus::Error).with_error("boom"))
            .expect("error");

        let project = db.project(id).expect("query").expect("present");
        assert_eq!(project.status, ProjectStatus::Error);
        assert_eq!(project.pid, Some(4242));
        assert_eq!(project.last_error.as_deref(), Some("boom"));
        assert_eq!(project.last_started_at, Some(ts()));

        db.apply_status(
            id,
            &StatusChange::new(ProjectStatus::Stopped).with_pid(None).clear_error(),
        )
        .expect("stopped");
        let project = db.project(id).expect("query").expect("present");
        assert_eq!(project.pid, None);
        assert_eq!(project.last_error, None);
    }

    #[test]
    fn missing_project_reports_not_found() {
        let db = DockStore::open_in_memory().expect("open db");
        let err = db
            .apply_status(99, &StatusChange::new(ProjectStatus::Running))
            .expect_err("no row");
        assert_eq!(err, DockError::NotFound(99));
        assert_eq!(db.set_port(99, 3000), Err(DockError::NotFound(99)));
    }

    #[test]
    fn status_filter_and_used_ports() {
        let db = DockStore::open_in_memory().expect("open db");
        let web = db.insert_project(&sample_project("web", Some(3001))).expect("web");
        db.insert_project(&sample_project("docs", Some(3000))).expect("docs");
        db.insert_project(&sample_project("worker", None)).expect("worker");
        db.apply_status(web, &StatusChange::new(ProjectStatus::Running))
            .expect("status");

        let running = db
            .projects_with_status(ProjectStatus::Running)
            .expect("filter");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, web);
        assert_eq!(db.used_ports().expect("ports"), vec![3000, 3001]);

        db.set_port(web, 3005).expect("port");
        assert_eq!(db.used_ports().expect("ports"), vec![3000, 3005]);
    }

    #[test]
    fn oldest_logs_go_first() {
        let db = DockStore::open_in_memory().expect("open db");
        let id = db.insert_project(&sample_project("web", None)).expect("insert");
        for n in 0..5 {
            db.insert(&line(id, &format!("line {n}"))).expect("insert log");
        }
        assert_eq!(LogStore::count(&db, id).expect("count"), 5);
        assert_eq!(db.delete_oldest(id, 2).expect("trim"), 2);

        let remaining = db.recent_logs(id, 10).expect("recent");
        let messages: Vec<_> = remaining.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);

        let tail = db.recent_logs(id, 1).expect("tail");
        assert_eq!(tail[0].message, "line 4");

        LogStore::clear(&db, id).expect("clear");
        assert_eq!(LogStore::count(&db, id).expect("count"), 0);
    }

    #[test]
    fn agent_goes_online_then_offline() {
        let db = DockStore::open_in_memory().expect("open db");
        db.upsert_agent_online("laptop-1", "laptop", "linux", "0.1.0", "/home/dev/code")
            .expect("upsert");
        let record = db.agent("laptop-1").expect("query").expect("present");
        assert_eq!(record.status, "online");
        assert_eq!(record.scan_root, "/home/dev/code");
        assert!(record.connected_at.is_some());

        db.mark_agent_offline("laptop-1").expect("offline");
        let record = db.agent("laptop-1").expect("query").expect("present");
        assert_eq!(record.status, "offline");

        db.upsert_agent_online("laptop-1", "laptop", "darwin", "0.2.0", "/Users/dev")
            .expect("reconnect");
        let record = db.agent("laptop-1").expect("query").expect("present");
        assert_eq!(record.status, "online");
        assert_eq!(record.platform, "darwin");
        assert!(db.agent("ghost").expect("query").is_none());
    }
}
