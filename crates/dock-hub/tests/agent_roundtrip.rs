use chrono::Utc;
use dock_core::protocol::{AgentCommand, AgentEvent, ProbeResult};
use dock_core::{
    DockError, LogStream, Project, ProjectId, ProjectStatus, SupervisorEvent,
};
use dock_hub::{AgentLink, Hub, HubConfig};
use dock_storage::DockStore;
use dock_supervisor::ProcessControl;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type AgentSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const TOKEN: &str = "s3cret";
const WAIT: Duration = Duration::from_secs(5);

struct TestHub {
    hub: Hub,
    addr: SocketAddr,
}

fn config() -> HubConfig {
    HubConfig {
        agent_token: TOKEN.to_string(),
        command_timeout: Duration::from_secs(5),
        ..HubConfig::default()
    }
}

async fn spawn_hub(config: HubConfig) -> TestHub {
    let store = DockStore::open_in_memory().expect("store");
    store.migrate().expect("migrate");
    let hub = Hub::new(Arc::new(store), &config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = hub.router();
    tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await;
    });
    TestHub { hub, addr }
}

impl TestHub {
    fn add(&self, project: Project) -> ProjectId {
        self.hub.store.insert_project(&project).expect("insert")
    }

    fn project(&self, id: ProjectId) -> Project {
        self.hub
            .store
            .get_project(id)
            .expect("read")
            .expect("present")
    }

    async fn connect(&self, token: &str) -> Result<AgentSocket, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{}/agent/ws?token={token}", self.addr);
        connect_async(url).await.map(|(socket, _)| socket)
    }

    async fn connect_agent(&self, agent_id: &str) -> AgentSocket {
        let mut socket = self.connect(TOKEN).await.expect("connect");
        send(
            &mut socket,
            &AgentEvent::Hello {
                agent_id: agent_id.to_string(),
                name: "build-box".to_string(),
                scan_root: "/srv".to_string(),
                version: "0.1.0".to_string(),
                platform: "linux".to_string(),
            },
        )
        .await;
        wait_connected(&self.hub.link, true).await;
        socket
    }

    async fn http(&self, request: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("connect");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        tokio::time::timeout(WAIT, stream.read_to_string(&mut response))
            .await
            .expect("response in time")
            .expect("read");
        response
    }
}

fn web_project() -> Project {
    Project {
        name: "web".to_string(),
        local_path: Some(PathBuf::from("/srv/web")),
        dev_command: Some("npm run dev".to_string()),
        port: Some(4500),
        ..Project::default()
    }
}

async fn send(socket: &mut AgentSocket, event: &AgentEvent) {
    let text = serde_json::to_string(event).expect("encode");
    socket.send(Message::Text(text)).await.expect("send");
}

async fn next_command(socket: &mut AgentSocket) -> AgentCommand {
    loop {
        let msg = tokio::time::timeout(WAIT, socket.next())
            .await
            .expect("command in time")
            .expect("socket open")
            .expect("frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("command");
        }
    }
}

async fn wait_connected(link: &AgentLink, expected: bool) {
    let deadline = Instant::now() + WAIT;
    while link.is_connected().await != expected {
        assert!(Instant::now() < deadline, "agent link never became connected={expected}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_project(hub: &TestHub, id: ProjectId, check: impl Fn(&Project) -> bool) -> Project {
    let deadline = Instant::now() + WAIT;
    loop {
        let project = hub.project(id);
        if check(&project) {
            return project;
        }
        assert!(Instant::now() < deadline, "project {id} never matched: {project:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_token_is_refused_before_upgrade() {
    let hub = spawn_hub(config()).await;
    assert!(hub.connect("guess").await.is_err());
    assert!(hub.connect("").await.is_err());
    assert!(!hub.hub.link.is_connected().await);

    let closed = spawn_hub(HubConfig::default()).await;
    assert!(closed.connect("anything").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_resolve_with_the_matching_ack() {
    let hub = spawn_hub(config()).await;
    let id = hub.add(web_project());
    let mut agent = hub.connect_agent("agent-1").await;

    let dispatcher = hub.hub.dispatcher.clone();
    let pending = tokio::spawn(async move { dispatcher.start(id).await });
    let request_id = match next_command(&mut agent).await {
        AgentCommand::Start { request_id, app } => {
            assert_eq!(app.id, id);
            assert_eq!(app.local_path, "/srv/web");
            assert_eq!(app.port, Some(4500));
            request_id
        }
        other => panic!("unexpected command: {other:?}"),
    };
    send(&mut agent, &AgentEvent::ack(&request_id, Ok(()))).await;
    assert_eq!(pending.await.expect("join"), Ok(()));

    let dispatcher = hub.hub.dispatcher.clone();
    let pending = tokio::spawn(async move { dispatcher.build(id, true).await });
    let request_id = match next_command(&mut agent).await {
        AgentCommand::Build {
            request_id,
            then_start,
            ..
        } => {
            assert!(then_start);
            request_id
        }
        other => panic!("unexpected command: {other:?}"),
    };
    send(
        &mut agent,
        &AgentEvent::ack(&request_id, Err("Build failed (exit 2)".to_string())),
    )
    .await;
    assert_eq!(
        pending.await.expect("join"),
        Err(DockError::RemoteRejected("Build failed (exit 2)".to_string()))
    );

    let record = hub.hub.store.agent("agent-1").expect("read").expect("agent row");
    assert_eq!(record.status, "online");
    assert_eq!(record.platform, "linux");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsolicited_events_update_store_and_feeds() {
    let hub = spawn_hub(config()).await;
    let id = hub.add(Project {
        port: None,
        ..web_project()
    });
    let mut logs = hub.hub.supervisor.logs().subscribe(id);
    let mut events = hub.hub.supervisor.events().subscribe();
    let mut agent = hub.connect_agent("agent-1").await;

    send(
        &mut agent,
        &AgentEvent::Status {
            app_id: id,
            status: ProjectStatus::Running,
            pid: Some(4242),
        },
    )
    .await;
    send(&mut agent, &AgentEvent::Port { app_id: id, port: 5173 }).await;
    send(
        &mut agent,
        &AgentEvent::Log {
            app_id: id,
            stream: LogStream::Stderr,
            message: "warn: slow compile".to_string(),
            created_at: Utc::now(),
        },
    )
    .await;

    let line = tokio::time::timeout(WAIT, logs.recv())
        .await
        .expect("line in time")
        .expect("line");
    assert_eq!(line.stream, LogStream::Stderr);
    assert_eq!(line.message, "warn: slow compile");

    let project = wait_for_project(&hub, id, |p| p.port == Some(5173)).await;
    assert_eq!(project.status, ProjectStatus::Running);
    assert_eq!(project.pid, Some(4242));

    let first = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(
        first,
        SupervisorEvent::Status {
            project_id: id,
            status: ProjectStatus::Running,
            pid: Some(4242)
        }
    );
    let stored = hub.hub.store.recent_logs(id, 10).expect("logs");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].message, "warn: slow compile");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_reply_after_timeout_is_ignored() {
    let hub = spawn_hub(config()).await;
    let id = hub.add(web_project());
    let mut agent = hub.connect_agent("agent-1").await;
    let app = dock_core::protocol::AppConfig::from(&hub.project(id));

    let result = hub
        .hub
        .link
        .send_command(
            AgentCommand::Start {
                request_id: "r1".to_string(),
                app,
            },
            Duration::from_millis(200),
        )
        .await;
    assert_eq!(result, Err(DockError::AgentTimeout("start".to_string())));
    assert!(matches!(
        next_command(&mut agent).await,
        AgentCommand::Start { ref request_id, .. } if request_id == "r1"
    ));

    send(&mut agent, &AgentEvent::ack("r1", Ok(()))).await;
    agent
        .send(Message::Text("not json".to_string()))
        .await
        .expect("send garbage");

    // The session survives both and keeps correlating.
    let dispatcher = hub.hub.dispatcher.clone();
    let pending = tokio::spawn(async move { dispatcher.stop(id).await });
    let request_id = match next_command(&mut agent).await {
        AgentCommand::Stop { request_id, .. } => request_id,
        other => panic!("unexpected command: {other:?}"),
    };
    assert_ne!(request_id, "r1");
    send(&mut agent, &AgentEvent::ack(&request_id, Ok(()))).await;
    assert_eq!(pending.await.expect("join"), Ok(()));

    let conn = hub.hub.link.active().await.expect("still connected");
    assert_eq!(conn.pending_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_fails_pending_requests_and_falls_back_local() {
    let hub = spawn_hub(config()).await;
    let id = hub.add(Project {
        dev_command: None,
        ..web_project()
    });
    let mut agent = hub.connect_agent("agent-1").await;

    let link = hub.hub.link.clone();
    let app = dock_core::protocol::AppConfig::from(&hub.project(id));
    let pending = tokio::spawn(async move {
        link.send_command(
            AgentCommand::Restart {
                request_id: "r9".to_string(),
                app,
            },
            Duration::from_secs(30),
        )
        .await
    });
    next_command(&mut agent).await;
    agent.close(None).await.expect("close");

    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("failed promptly")
        .expect("join");
    assert_eq!(result, Err(DockError::AgentDisconnected));
    wait_connected(&hub.hub.link, false).await;

    let deadline = Instant::now() + WAIT;
    loop {
        let record = hub.hub.store.agent("agent-1").expect("read").expect("agent row");
        if record.status == "offline" {
            break;
        }
        assert!(Instant::now() < deadline, "agent never went offline");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        hub.hub.dispatcher.start(id).await,
        Err(DockError::NotConfigured("dev command"))
    );
    assert_eq!(
        hub.hub.dispatcher.scan().await,
        Err(DockError::AgentDisconnected)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_reconcile_writes_agent_verdicts() {
    let hub = spawn_hub(config()).await;
    let id = hub.add(Project {
        status: ProjectStatus::Running,
        pid: Some(77),
        ..web_project()
    });
    let idle = hub.add(Project {
        name: "docs".to_string(),
        port: Some(4501),
        ..web_project()
    });
    let mut events = hub.hub.supervisor.events().subscribe();
    let mut agent = hub.connect_agent("agent-1").await;

    let dispatcher = hub.hub.dispatcher.clone();
    let pending = tokio::spawn(async move { dispatcher.reconcile().await });
    let request_id = match next_command(&mut agent).await {
        AgentCommand::Reconcile {
            request_id,
            running_apps,
        } => {
            let ids: Vec<ProjectId> = running_apps.iter().map(|app| app.id).collect();
            assert_eq!(ids, vec![id]);
            assert_eq!(running_apps[0].pid, Some(77));
            request_id
        }
        other => panic!("unexpected command: {other:?}"),
    };
    send(
        &mut agent,
        &AgentEvent::ReconcileResult {
            request_id,
            statuses: vec![ProbeResult {
                app_id: id,
                status: ProjectStatus::Stopped,
                pid: None,
            }],
        },
    )
    .await;
    pending.await.expect("join");

    let project = hub.project(id);
    assert_eq!(project.status, ProjectStatus::Stopped);
    assert_eq!(project.pid, None);
    assert_eq!(hub.project(idle).status, ProjectStatus::Stopped);
    let event = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("event in time")
        .expect("event");
    assert_eq!(event.project_id(), id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_queries_go_to_the_agent() {
    let hub = spawn_hub(config()).await;
    let mut agent = hub.connect_agent("agent-1").await;

    let dispatcher = hub.hub.dispatcher.clone();
    let pending = tokio::spawn(async move { dispatcher.read_file("web/package.json").await });
    let request_id = match next_command(&mut agent).await {
        AgentCommand::ReadFile { request_id, path } => {
            assert_eq!(path, "web/package.json");
            request_id
        }
        other => panic!("unexpected command: {other:?}"),
    };
    send(
        &mut agent,
        &AgentEvent::FileContent {
            request_id,
            content: "{\"name\":\"web\"}".to_string(),
        },
    )
    .await;
    assert_eq!(
        pending.await.expect("join"),
        Ok("{\"name\":\"web\"}".to_string())
    );

    let dispatcher = hub.hub.dispatcher.clone();
    let pending = tokio::spawn(async move { dispatcher.vacant_port(&[3001]).await });
    let request_id = match next_command(&mut agent).await {
        AgentCommand::VacantPort {
            request_id,
            used_ports,
        } => {
            assert_eq!(used_ports, vec![3001]);
            request_id
        }
        other => panic!("unexpected command: {other:?}"),
    };
    send(&mut agent, &AgentEvent::VacantPort { request_id, port: 3002 }).await;
    assert_eq!(pending.await.expect("join"), Ok(Some(3002)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn action_routes_map_errors_to_statuses() {
    let hub = spawn_hub(config()).await;

    let health = hub
        .http("GET /health HTTP/1.1\r\nHost: dock\r\nConnection: close\r\n\r\n")
        .await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");

    let missing = hub
        .http("POST /apps/999/start HTTP/1.1\r\nHost: dock\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;
    assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");
    assert!(missing.contains("Project 999 not found"), "{missing}");

    let probe = hub
        .http("POST /probe HTTP/1.1\r\nHost: dock\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .await;
    assert!(probe.starts_with("HTTP/1.1 200"), "{probe}");
    assert!(probe.contains("\"probed\":0"), "{probe}");
}
