use dock_core::{ProjectId, ProjectStatus, SupervisorEvent};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-process status bus. Emitting never waits; a subscriber that falls
/// behind loses the oldest events instead of stalling the emitter.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn status(&self, project_id: ProjectId, status: ProjectStatus, pid: Option<u32>) {
        self.emit(SupervisorEvent::Status {
            project_id,
            status,
            pid,
        });
    }

    pub fn port(&self, project_id: ProjectId, port: u16) {
        self.emit(SupervisorEvent::Port { project_id, port });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }
}
