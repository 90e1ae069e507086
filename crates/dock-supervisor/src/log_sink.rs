use chrono::Utc;
use dock_core::{DockError, LogLine, LogStore, LogStream, ProjectId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

pub const DEFAULT_LOG_CAP: u64 = 1000;
pub const DEFAULT_TRIM_BATCH: u64 = 100;

const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Per-project output: persisted with bounded retention and fanned out live.
///
/// Live delivery never depends on the store. A failed insert is returned to
/// the caller after the line has already gone to subscribers.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    store: Option<Arc<dyn LogStore>>,
    live: broadcast::Sender<LogLine>,
    cap: u64,
    batch: u64,
}

impl LogSink {
    pub fn new(store: Option<Arc<dyn LogStore>>) -> Self {
        Self::with_retention(store, DEFAULT_LOG_CAP, DEFAULT_TRIM_BATCH)
    }

    pub fn with_retention(store: Option<Arc<dyn LogStore>>, cap: u64, batch: u64) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SinkInner {
                store,
                live,
                cap: cap.max(1),
                batch: batch.max(1),
            }),
        }
    }

    /// Stamps and records one line.
    pub fn append(
        &self,
        project_id: ProjectId,
        stream: LogStream,
        message: impl Into<String>,
    ) -> Result<LogLine, DockError> {
        let line = LogLine {
            project_id,
            stream,
            message: message.into(),
            created_at: Utc::now(),
        };
        self.relay(line.clone())?;
        Ok(line)
    }

    /// Records a line that already carries its timestamp, as agent output does.
    pub fn relay(&self, line: LogLine) -> Result<(), DockError> {
        let stored = self.persist(&line);
        let _ = self.inner.live.send(line);
        stored
    }

    /// Like `append`, but a storage failure is only logged.
    pub fn record(&self, project_id: ProjectId, stream: LogStream, message: impl Into<String>) {
        if let Err(err) = self.append(project_id, stream, message) {
            warn!(event = "log_persist_failed", project_id, error = %err);
        }
    }

    pub fn subscribe(&self, project_id: ProjectId) -> LogSubscription {
        LogSubscription {
            rx: self.inner.live.subscribe(),
            project_id: Some(project_id),
        }
    }

    pub fn subscribe_all(&self) -> LogSubscription {
        LogSubscription {
            rx: self.inner.live.subscribe(),
            project_id: None,
        }
    }

    /// Drops persisted history. Open subscriptions keep receiving new lines.
    pub fn clear(&self, project_id: ProjectId) -> Result<(), DockError> {
        match &self.inner.store {
            Some(store) => store.clear(project_id),
            None => Ok(()),
        }
    }

    fn persist(&self, line: &LogLine) -> Result<(), DockError> {
        let Some(store) = &self.inner.store else {
            return Ok(());
        };
        store.insert(line)?;
        self.trim(store.as_ref(), line.project_id)
    }

    fn trim(&self, store: &dyn LogStore, project_id: ProjectId) -> Result<(), DockError> {
        let mut count = store.count(project_id)?;
        while count > self.inner.cap {
            let removed = store.delete_oldest(project_id, self.inner.batch)?;
            if removed == 0 {
                break;
            }
            count = count.saturating_sub(removed);
        }
        Ok(())
    }
}

/// Live feed from the moment of subscription; history is not replayed.
pub struct LogSubscription {
    rx: broadcast::Receiver<LogLine>,
    project_id: Option<ProjectId>,
}

impl LogSubscription {
    /// Next line for this subscription, or `None` once the sink is gone.
    pub async fn recv(&mut self) -> Option<LogLine> {
        loop {
            match self.rx.recv().await {
                Ok(line) => {
                    if self.project_id.map_or(true, |id| id == line.project_id) {
                        return Some(line);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = "log_subscriber_lagged", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
