//! Process supervision for dock: spawns and tracks dev servers, keeps their
//! output, and reconciles persisted status with what the OS reports.

use async_trait::async_trait;
use dock_core::{DockError, ProjectId};

pub mod events;
pub mod log_sink;
pub mod probe;
pub mod process;
pub mod registry;
pub mod supervisor;

pub use events::EventBus;
pub use log_sink::{LogSink, LogSubscription};
pub use probe::{default_probe, is_http_up, LsofPortProbe, PortProbe, ProcfsPortProbe};
pub use process::ProcessGroup;
pub use registry::MemoryRegistry;
pub use supervisor::{
    AutobootReport, ProbeReport, ReconcileReport, Supervisor, SupervisorConfig,
};

/// The lifecycle operations callers issue against a project, wherever the
/// process actually runs.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn start(&self, id: ProjectId) -> Result<(), DockError>;

    async fn stop(&self, id: ProjectId) -> Result<(), DockError>;

    async fn restart(&self, id: ProjectId) -> Result<(), DockError>;

    async fn install(&self, id: ProjectId) -> Result<(), DockError>;

    async fn build(&self, id: ProjectId, then_start: bool) -> Result<(), DockError>;

    /// Corrects persisted state; never fails.
    async fn reconcile(&self);

    async fn probe_ports(&self) -> Result<ProbeReport, DockError>;
}
