use clap::Parser;
use dock_core::logging::{env_true, resolve_setting};
use dock_core::protocol::DEFAULT_MAX_FRAME_BYTES;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ADDR: &str = "127.0.0.1:4200";
pub const DEFAULT_DB: &str = ".dock/dock.db";
pub const DEFAULT_LOG_DIR: &str = ".dock/logs";

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    pub db_path: PathBuf,
    pub agent_token: String,
    pub log_dir: String,
    pub debug: bool,
    /// `None` turns the periodic pass off; the boot pass always runs.
    pub reconcile_interval: Option<Duration>,
    pub command_timeout: Duration,
    pub job_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            db_path: PathBuf::from(DEFAULT_DB),
            agent_token: String::new(),
            log_dir: DEFAULT_LOG_DIR.to_string(),
            debug: false,
            reconcile_interval: Some(Duration::from_secs(30)),
            command_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(600),
            ping_interval: Some(Duration::from_secs(15)),
            write_timeout: Duration::from_secs(2),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl HubConfig {
    /// Port of the hub's own listener, used to recognise its self-entry.
    pub fn own_port(&self) -> Option<u16> {
        self.addr
            .parse::<SocketAddr>()
            .ok()
            .map(|addr| addr.port())
    }
}

#[derive(Parser, Debug)]
#[command(name = "dock-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value = "")]
    pub db: String,
    #[arg(long, default_value = "")]
    pub agent_token: String,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Seconds between reconciliation passes; 0 disables them.
    #[arg(long, default_value_t = 30)]
    pub reconcile_interval: u64,
    #[arg(long, default_value_t = 30)]
    pub command_timeout: u64,
    #[arg(long, default_value_t = 600)]
    pub job_timeout: u64,
    #[arg(long, default_value_t = 15)]
    pub ping_interval: u64,
}

pub fn load_config() -> HubConfig {
    HubConfig::from_args(Args::parse())
}

impl HubConfig {
    pub fn from_args(args: Args) -> Self {
        let defaults = HubConfig::default();
        HubConfig {
            addr: resolve_setting(&args.addr, "DOCK_ADDR", DEFAULT_ADDR),
            db_path: PathBuf::from(resolve_setting(&args.db, "DOCK_DB", DEFAULT_DB)),
            agent_token: resolve_setting(&args.agent_token, "DOCK_AGENT_TOKEN", ""),
            log_dir: resolve_setting(&args.log_dir, "DOCK_LOG_DIR", DEFAULT_LOG_DIR),
            debug: args.debug || env_true("DOCK_DEBUG"),
            reconcile_interval: seconds(args.reconcile_interval),
            command_timeout: Duration::from_secs(args.command_timeout.max(1)),
            job_timeout: Duration::from_secs(args.job_timeout.max(1)),
            ping_interval: seconds(args.ping_interval),
            ..defaults
        }
    }
}

fn seconds(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "dock-hub",
            "--addr",
            "127.0.0.1:4999",
            "--db",
            "/tmp/dock-test.db",
            "--agent-token",
            "s3cret",
            "--reconcile-interval",
            "0",
            "--job-timeout",
            "60",
        ]);
        let config = HubConfig::from_args(args);
        assert_eq!(config.addr, "127.0.0.1:4999");
        assert_eq!(config.own_port(), Some(4999));
        assert_eq!(config.db_path, PathBuf::from("/tmp/dock-test.db"));
        assert_eq!(config.agent_token, "s3cret");
        assert_eq!(config.reconcile_interval, None);
        assert_eq!(config.ping_interval, Some(Duration::from_secs(15)));
        assert_eq!(config.job_timeout, Duration::from_secs(60));
    }

    #[test]
    fn unparseable_addr_has_no_own_port() {
        let config = HubConfig {
            addr: "localhost".to_string(),
            ..HubConfig::default()
        };
        assert_eq!(config.own_port(), None);
    }
}
