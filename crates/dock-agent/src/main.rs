use clap::Parser;
use dock_core::logging::{env_true, init_logging, resolve_setting, LogConfig};
use dock_core::protocol::{
    decode_frame, encode_frame, AgentCommand, AgentEvent, DEFAULT_MAX_FRAME_BYTES,
};
use dock_core::SupervisorEvent;
use dock_supervisor::{default_probe, EventBus, LogSink, MemoryRegistry, Supervisor, SupervisorConfig};
use futures_util::{SinkExt, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

mod handler;

use handler::CommandHandler;

const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:4200/agent/ws";

#[derive(Parser, Debug)]
#[command(name = "dock-agent")]
struct Args {
    #[arg(long, default_value = "")]
    hub_url: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    scan_root: String,
    #[arg(long, default_value = "")]
    agent_id: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct AgentConfig {
    hub_url: Url,
    agent_id: String,
    name: String,
    scan_root: PathBuf,
    log_dir: String,
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let debug = args.debug || env_true("DOCK_DEBUG");
    let log_dir = resolve_setting(&args.log_dir, "DOCK_LOG_DIR", "");
    let _log_guard = init_logging(&LogConfig {
        component: "dock-agent".to_string(),
        debug,
        log_dir: log_dir.clone(),
    });

    let config = match load_config(args, debug, log_dir) {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_config", error = %err);
            std::process::exit(1);
        }
    };
    info!(
        event = "agent_start",
        agent_id = %config.agent_id,
        scan_root = %config.scan_root.display(),
        debug = config.debug,
        log_dir = %config.log_dir
    );

    let registry = Arc::new(MemoryRegistry::new());
    let logs = LogSink::new(None);
    let events = EventBus::new();
    let supervisor = Supervisor::new(
        registry.clone(),
        logs.clone(),
        events.clone(),
        default_probe(),
        SupervisorConfig::default(),
    );
    let handler = CommandHandler::new(supervisor.clone(), registry, config.scan_root.clone());

    let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
    tokio::spawn(forward_status(events.subscribe(), tx.clone()));
    tokio::spawn(forward_logs(logs, tx.clone()));

    let hub = tokio::spawn(async move {
        hub_loop(&config, &handler, tx, &mut rx).await;
    });

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "agent_shutdown", managed = supervisor.managed_ids().len());
    hub.abort();
    for id in supervisor.managed_ids() {
        if let Err(err) = supervisor.stop(id).await {
            warn!(event = "shutdown_stop_failed", project_id = id, error = %err);
        }
    }
}

fn load_config(args: Args, debug: bool, log_dir: String) -> Result<AgentConfig, String> {
    let token = resolve_setting(&args.token, "DOCK_AGENT_TOKEN", "");
    let hub_url = resolve_hub_url(&args.hub_url, &token)?;
    let scan_root = resolve_scan_root(&args.scan_root);
    let host = hostname();
    let agent_id = resolve_setting(
        &args.agent_id,
        "DOCK_AGENT_ID",
        &format!("{host}-{}", std::process::id()),
    );
    let name = resolve_setting(&args.name, "DOCK_AGENT_NAME", &host);
    Ok(AgentConfig {
        hub_url,
        agent_id,
        name,
        scan_root,
        log_dir,
        debug,
    })
}

fn resolve_hub_url(flag: &str, token: &str) -> Result<Url, String> {
    let raw = resolve_setting(flag, "DOCK_HUB_URL", DEFAULT_HUB_URL);
    let mut url = Url::parse(&raw).map_err(|err| format!("invalid hub url {raw}: {err}"))?;
    if !token.is_empty() {
        url.query_pairs_mut().append_pair("token", token);
    }
    Ok(url)
}

fn resolve_scan_root(flag: &str) -> PathBuf {
    let fallback = std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .to_string_lossy()
        .to_string();
    PathBuf::from(resolve_setting(flag, "DOCK_SCAN_ROOT", &fallback))
}

fn hostname() -> String {
    if let Ok(value) = std::env::var("HOSTNAME") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "agent".to_string())
}

fn hello(config: &AgentConfig) -> AgentEvent {
    AgentEvent::Hello {
        agent_id: config.agent_id.clone(),
        name: config.name.clone(),
        scan_root: config.scan_root.to_string_lossy().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        platform: std::env::consts::OS.to_string(),
    }
}

async fn hub_loop(
    config: &AgentConfig,
    handler: &CommandHandler,
    tx: mpsc::Sender<AgentEvent>,
    rx: &mut mpsc::Receiver<AgentEvent>,
) {
    let mut backoff = Duration::from_secs(1);
    loop {
        let (mut ws, _) = match connect_async(config.hub_url.clone()).await {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hub_connect_error", error = %err, retry_in = ?backoff);
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
                continue;
            }
        };
        backoff = Duration::from_secs(1);

        let greeting = match encode_frame(&hello(config), DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                error!(event = "hello_encode_error", error = %err);
                return;
            }
        };
        if ws.send(Message::Text(greeting)).await.is_err() {
            warn!(event = "hub_hello_error");
            let _ = ws.close(None).await;
            continue;
        }
        info!(event = "hub_connected", url = %redacted(&config.hub_url));

        loop {
            tokio::select! {
                Some(msg) = ws.next() => {
                    let text = match msg {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => continue,
                    };
                    let command: AgentCommand = match decode_frame(text.as_bytes(), DEFAULT_MAX_FRAME_BYTES) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "command_invalid", error = %err);
                            continue;
                        }
                    };
                    debug!(event = "command_received", kind = command.kind());
                    let handler = handler.clone();
                    let replies = tx.clone();
                    tokio::spawn(async move {
                        let reply = handler.handle(command).await;
                        let _ = replies.send(reply).await;
                    });
                }
                Some(event) = rx.recv() => {
                    let frame = match encode_frame(&event, DEFAULT_MAX_FRAME_BYTES) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(event = "event_encode_error", error = %err);
                            continue;
                        }
                    };
                    if ws.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                else => break,
            }
        }
        warn!(event = "hub_disconnected");
        let _ = ws.close(None).await;
        tokio::time::sleep(backoff).await;
    }
}

async fn forward_status(mut events: broadcast::Receiver<SupervisorEvent>, tx: mpsc::Sender<AgentEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(value) => value,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(event = "status_forward_lagged", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if tx.send(status_event(event)).await.is_err() {
            return;
        }
    }
}

fn status_event(event: SupervisorEvent) -> AgentEvent {
    match event {
        SupervisorEvent::Status {
            project_id,
            status,
            pid,
        } => AgentEvent::Status {
            app_id: project_id,
            status,
            pid,
        },
        SupervisorEvent::Port { project_id, port } => AgentEvent::Port {
            app_id: project_id,
            port,
        },
    }
}

async fn forward_logs(logs: LogSink, tx: mpsc::Sender<AgentEvent>) {
    let mut feed = logs.subscribe_all();
    while let Some(line) = feed.recv().await {
        let event = AgentEvent::Log {
            app_id: line.project_id,
            stream: line.stream,
            message: line.message,
            created_at: line.created_at,
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

fn next_backoff(current: Duration) -> Duration {
    let next = current + current;
    if next > Duration::from_secs(10) {
        Duration::from_secs(10)
    } else {
        next
    }
}
