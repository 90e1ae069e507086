//! The hub's end of the agent connection.
//!
//! One authenticated WebSocket carries many outstanding commands at once.
//! Each command is parked in the connection's pending map under its
//! `requestId` until the matching reply, a timeout or the disconnect resolves
//! it. Unsolicited `status`, `port` and `log` events write straight through to
//! the store, the status bus and the log sink.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use dock_core::auth::token_matches;
use dock_core::protocol::{decode_frame, encode_frame, AgentCommand, AgentEvent};
use dock_core::{DockError, LogLine, ProjectId, ProjectRegistry, ProjectStatus, StatusChange};
use dock_storage::DockStore;
use dock_supervisor::{EventBus, LogSink};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};

type Resolver = oneshot::Sender<Result<AgentEvent, DockError>>;

#[derive(Clone, Debug)]
pub struct AgentLinkConfig {
    /// Shared secret the agent presents as `?token=`. Empty refuses everyone.
    pub token: String,
    pub max_frame_bytes: usize,
    pub write_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub name: String,
    pub platform: String,
    pub version: String,
    pub scan_root: String,
}

#[derive(Default)]
struct PendingRequests {
    closed: bool,
    resolvers: HashMap<String, Resolver>,
}

/// One live socket. It becomes routable once the agent has said hello.
pub struct AgentConnection {
    conn_id: String,
    sender: mpsc::Sender<Message>,
    identity: AsyncMutex<Option<AgentIdentity>>,
    pending: AsyncMutex<PendingRequests>,
}

impl AgentConnection {
    fn new(conn_id: String, sender: mpsc::Sender<Message>) -> Self {
        Self {
            conn_id,
            sender,
            identity: AsyncMutex::new(None),
            pending: AsyncMutex::new(PendingRequests::default()),
        }
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub async fn identity(&self) -> Option<AgentIdentity> {
        self.identity.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.resolvers.len()
    }

    async fn agent_id(&self) -> Option<String> {
        self.identity
            .lock()
            .await
            .as_ref()
            .map(|identity| identity.agent_id.clone())
    }

    async fn request(
        &self,
        command: AgentCommand,
        timeout: Duration,
        max_frame_bytes: usize,
    ) -> Result<AgentEvent, DockError> {
        let kind = command.kind();
        let request_id = command
            .request_id()
            .map(str::to_string)
            .ok_or_else(|| DockError::RemoteRejected(format!("{kind} expects no reply")))?;
        let frame = encode_frame(&command, max_frame_bytes)
            .map_err(|err| DockError::RemoteRejected(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(DockError::AgentDisconnected);
            }
            if pending.resolvers.contains_key(&request_id) {
                return Err(DockError::RemoteRejected(format!(
                    "duplicate request id {request_id}"
                )));
            }
            pending.resolvers.insert(request_id.clone(), tx);
        }

        if self.sender.send(Message::Text(frame)).await.is_err() {
            self.pending.lock().await.resolvers.remove(&request_id);
            return Err(DockError::AgentDisconnected);
        }
        debug!(event = "agent_command_sent", conn_id = %self.conn_id, request_id = %request_id, kind);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DockError::AgentDisconnected),
            Err(_) => {
                self.pending.lock().await.resolvers.remove(&request_id);
                warn!(
                    event = "agent_command_timeout",
                    conn_id = %self.conn_id,
                    request_id = %request_id,
                    kind
                );
                Err(DockError::AgentTimeout(kind.to_string()))
            }
        }
    }

    async fn push(&self, command: &AgentCommand, max_frame_bytes: usize) -> Result<(), DockError> {
        let frame = encode_frame(command, max_frame_bytes)
            .map_err(|err| DockError::RemoteRejected(err.to_string()))?;
        self.sender
            .send(Message::Text(frame))
            .await
            .map_err(|_| DockError::AgentDisconnected)
    }

    /// Hands a reply to its waiter. `false` when nobody is waiting any more.
    async fn resolve(&self, event: AgentEvent) -> bool {
        let Some(request_id) = event.request_id().map(str::to_string) else {
            return false;
        };
        let resolver = self.pending.lock().await.resolvers.remove(&request_id);
        match resolver {
            Some(resolver) => resolver.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    async fn fail_all(&self) -> usize {
        let drained: Vec<Resolver> = {
            let mut pending = self.pending.lock().await;
            pending.closed = true;
            pending.resolvers.drain().map(|(_, resolver)| resolver).collect()
        };
        let count = drained.len();
        for resolver in drained {
            let _ = resolver.send(Err(DockError::AgentDisconnected));
        }
        count
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

pub struct AgentLink {
    config: AgentLinkConfig,
    store: Arc<DockStore>,
    logs: LogSink,
    events: EventBus,
    conn_counter: AtomicU64,
    active: RwLock<Option<Arc<AgentConnection>>>,
}

impl AgentLink {
    pub fn new(config: AgentLinkConfig, store: Arc<DockStore>, logs: LogSink, events: EventBus) -> Self {
        Self {
            config,
            store,
            logs,
            events,
            conn_counter: AtomicU64::new(0),
            active: RwLock::new(None),
        }
    }

    pub fn authorize(&self, provided: &str) -> bool {
        token_matches(&self.config.token, provided)
    }

    /// The hello-identified connection commands are routed to, if any.
    pub async fn active(&self) -> Option<Arc<AgentConnection>> {
        self.active.read().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Sends a command and waits for the event echoing its `requestId`.
    pub async fn send_command(
        &self,
        command: AgentCommand,
        timeout: Duration,
    ) -> Result<AgentEvent, DockError> {
        let conn = self.active().await.ok_or(DockError::AgentDisconnected)?;
        conn.request(command, timeout, self.config.max_frame_bytes).await
    }

    /// Fire-and-forget; the outcome shows up later as unsolicited events.
    pub async fn send_to_agent(&self, command: AgentCommand) -> Result<(), DockError> {
        let conn = self.active().await.ok_or(DockError::AgentDisconnected)?;
        conn.push(&command, self.config.max_frame_bytes).await
    }

    pub fn start_ping(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !self.is_connected().await {
                    continue;
                }
                if let Err(err) = self.send_to_agent(AgentCommand::Ping).await {
                    debug!(event = "agent_ping_failed", error = %err);
                }
            }
        });
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let (ws_sender, ws_receiver) = socket.split();
        self.run_session(ws_sender, ws_receiver, remote).await;
    }

    /// Drives one connection until the agent closes, the read side fails or
    /// the writer gives up. Every exit path detaches and fails what is pending.
    async fn run_session<W, R, E>(self: Arc<Self>, mut ws_sender: W, mut ws_receiver: R, remote: SocketAddr)
    where
        W: Sink<Message> + Unpin + Send + 'static,
        W::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (tx, mut rx) = mpsc::channel::<Message>(256);
        let write_timeout = self.config.write_timeout;
        let mut write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => return Err(err.to_string()),
                    Err(_) => return Err("write timed out".to_string()),
                }
            }
            Ok(())
        });

        let conn = Arc::new(AgentConnection::new(self.next_conn_id(), tx));
        info!(event = "agent_socket_open", conn_id = %conn.conn_id, remote = %remote);

        loop {
            let result = tokio::select! {
                next = ws_receiver.next() => match next {
                    Some(result) => result,
                    None => break,
                },
                written = &mut write_task => {
                    let error = match written {
                        Ok(Ok(())) => "writer closed".to_string(),
                        Ok(Err(err)) => err,
                        Err(err) => err.to_string(),
                    };
                    warn!(event = "write_error", conn_id = %conn.conn_id, error = %error);
                    break;
                }
            };
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %conn.conn_id, error = %err);
                    break;
                }
            };
            let data = match msg {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(bytes) => bytes,
                Message::Close(_) => {
                    info!(event = "agent_close", conn_id = %conn.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            let event: AgentEvent = match decode_frame(&data, self.config.max_frame_bytes) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "message_invalid", conn_id = %conn.conn_id, error = %err);
                    continue;
                }
            };
            self.handle_event(&conn, event).await;
        }

        self.detach(&conn).await;
        write_task.abort();
    }

    async fn handle_event(&self, conn: &Arc<AgentConnection>, event: AgentEvent) {
        let event = match event {
            AgentEvent::Hello {
                agent_id,
                name,
                scan_root,
                version,
                platform,
            } => {
                let identity = AgentIdentity {
                    agent_id,
                    name,
                    platform,
                    version,
                    scan_root,
                };
                self.attach(conn, identity).await;
                return;
            }
            other => other,
        };

        let Some(agent_id) = conn.agent_id().await else {
            warn!(event = "event_before_hello", conn_id = %conn.conn_id);
            return;
        };

        match event {
            AgentEvent::Pong => {
                if let Err(err) = self.store.touch_agent(&agent_id) {
                    warn!(event = "agent_touch_failed", agent_id = %agent_id, error = %err);
                }
            }
            AgentEvent::Status { app_id, status, pid } => self.apply_status(app_id, status, pid),
            AgentEvent::Port { app_id, port } => match self.store.set_port(app_id, port) {
                Ok(()) => self.events.port(app_id, port),
                Err(err) => warn!(event = "agent_port_rejected", project_id = app_id, error = %err),
            },
            AgentEvent::Log {
                app_id,
                stream,
                message,
                created_at,
            } => {
                let line = LogLine {
                    project_id: app_id,
                    stream,
                    message,
                    created_at,
                };
                if let Err(err) = self.logs.relay(line) {
                    warn!(event = "log_persist_failed", project_id = app_id, error = %err);
                }
            }
            reply => {
                let request_id = reply.request_id().unwrap_or_default().to_string();
                if !conn.resolve(reply).await {
                    debug!(event = "late_reply_dropped", conn_id = %conn.conn_id, request_id = %request_id);
                }
            }
        }
    }

    fn apply_status(&self, id: ProjectId, status: ProjectStatus, pid: Option<u32>) {
        let change = StatusChange::new(status).with_pid(pid);
        match self.store.apply_status(id, &change) {
            Ok(()) => self.events.status(id, status, pid),
            Err(err) => warn!(event = "agent_status_rejected", project_id = id, error = %err),
        }
    }

    async fn attach(&self, conn: &Arc<AgentConnection>, identity: AgentIdentity) {
        if let Err(err) = self.store.upsert_agent_online(
            &identity.agent_id,
            &identity.name,
            &identity.platform,
            &identity.version,
            &identity.scan_root,
        ) {
            warn!(event = "agent_record_failed", agent_id = %identity.agent_id, error = %err);
        }
        info!(
            event = "agent_connected",
            conn_id = %conn.conn_id,
            agent_id = %identity.agent_id,
            platform = %identity.platform,
            scan_root = %identity.scan_root
        );
        *conn.identity.lock().await = Some(identity);

        let previous = self.active.write().await.replace(conn.clone());
        if let Some(previous) = previous.filter(|previous| !Arc::ptr_eq(previous, conn)) {
            info!(event = "agent_replaced", conn_id = %previous.conn_id);
            previous.close("replaced").await;
        }
    }

    async fn detach(&self, conn: &Arc<AgentConnection>) {
        let successor = {
            let mut active = self.active.write().await;
            if active.as_ref().is_some_and(|current| Arc::ptr_eq(current, conn)) {
                *active = None;
            }
            active.clone()
        };
        let failed = conn.fail_all().await;

        let Some(agent_id) = conn.agent_id().await else {
            info!(event = "agent_socket_closed", conn_id = %conn.conn_id);
            return;
        };
        let reconnected = match successor {
            Some(successor) => successor.agent_id().await.as_deref() == Some(agent_id.as_str()),
            None => false,
        };
        if !reconnected {
            if let Err(err) = self.store.mark_agent_offline(&agent_id) {
                warn!(event = "agent_record_failed", agent_id = %agent_id, error = %err);
            }
        }
        info!(
            event = "agent_disconnected",
            conn_id = %conn.conn_id,
            agent_id = %agent_id,
            failed_requests = failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{sink, stream};

    fn link() -> Arc<AgentLink> {
        let store = Arc::new(DockStore::open_in_memory().expect("store"));
        Arc::new(AgentLink::new(
            AgentLinkConfig {
                token: "secret".to_string(),
                max_frame_bytes: 1 << 20,
                write_timeout: Duration::from_millis(200),
            },
            store,
            LogSink::new(None),
            EventBus::new(),
        ))
    }

    #[tokio::test]
    async fn failed_write_fails_pending_requests_at_once() {
        let link = link();
        let (inbound, inbound_rx) = mpsc::channel::<Result<Message, String>>(8);
        let reader = Box::pin(stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }));
        let writer = Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>("connection reset")
        }));
        let session = tokio::spawn(link.clone().run_session(
            writer,
            reader,
            SocketAddr::from(([127, 0, 0, 1], 0)),
        ));

        let hello = AgentEvent::Hello {
            agent_id: "agent-1".to_string(),
            name: "laptop".to_string(),
            scan_root: "/srv".to_string(),
            version: "0.1.0".to_string(),
            platform: "linux".to_string(),
        };
        let frame = encode_frame(&hello, 1 << 20).expect("encode");
        inbound.send(Ok(Message::Text(frame))).await.expect("feed hello");
        tokio::time::timeout(Duration::from_secs(5), async {
            while !link.is_connected().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("hello accepted");

        let command = AgentCommand::Scan {
            request_id: "req-1".to_string(),
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            link.send_command(command, Duration::from_secs(60)),
        )
        .await
        .expect("request failed before its own timeout");
        assert_eq!(outcome, Err(DockError::AgentDisconnected));

        tokio::time::timeout(Duration::from_secs(5), session)
            .await
            .expect("session ended")
            .expect("join");
        assert!(!link.is_connected().await);
        drop(inbound);
    }
}
