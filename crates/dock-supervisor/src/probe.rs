//! Port and pid introspection.
//!
//! Every query is best-effort: a missing tool, an unreadable `/proc` entry or
//! a permission error reads as "nothing found" and is never surfaced.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;

#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Pids holding a listening TCP socket on `port`.
    async fn pids_on_port(&self, port: u16) -> Vec<u32>;

    /// First listening TCP port owned by `pid` or one of its direct children.
    async fn listening_port_for_pid(&self, pid: u32) -> Option<u16>;

    /// Every TCP port currently in LISTEN state.
    async fn listening_ports(&self) -> BTreeSet<u16>;

    /// Whether anything listens on `port`, whoever owns the socket.
    async fn is_listening(&self, port: u16) -> bool {
        self.listening_ports().await.contains(&port)
    }
}

/// The probe suited to the host OS.
pub fn default_probe() -> Arc<dyn PortProbe> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsPortProbe::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(LsofPortProbe)
    }
}

/// True only when something answers an HTTP request on the loopback port.
/// Any response counts, including error statuses and redirects.
pub async fn is_http_up(client: &reqwest::Client, port: u16, timeout: Duration) -> bool {
    let url = format!("http://127.0.0.1:{port}/");
    matches!(
        tokio::time::timeout(timeout, client.get(url).send()).await,
        Ok(Ok(_))
    )
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(event = "http_client_fallback", error = %err);
            reqwest::Client::new()
        }
    }
}

/// Shells out to `lsof` and `pgrep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LsofPortProbe;

async fn command_stdout(program: &str, args: &[String]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .ok()?;
    String::from_utf8(output.stdout).ok()
}

#[async_trait]
impl PortProbe for LsofPortProbe {
    async fn pids_on_port(&self, port: u16) -> Vec<u32> {
        let args = vec![
            "-ti".to_string(),
            format!("TCP:{port}"),
            "-sTCP:LISTEN".to_string(),
        ];
        command_stdout("lsof", &args)
            .await
            .map(|out| parse_pid_lines(&out))
            .unwrap_or_default()
    }

    async fn listening_port_for_pid(&self, pid: u32) -> Option<u16> {
        let mut pids = vec![pid];
        if let Some(out) = command_stdout("pgrep", &["-P".to_string(), pid.to_string()]).await {
            pids.extend(parse_pid_lines(&out));
        }
        let list = pids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let args = vec![
            "-a".to_string(),
            "-p".to_string(),
            list,
            "-iTCP".to_string(),
            "-sTCP:LISTEN".to_string(),
            "-P".to_string(),
            "-n".to_string(),
        ];
        let out = command_stdout("lsof", &args).await?;
        parse_lsof_listen_ports(&out).into_iter().next()
    }

    async fn listening_ports(&self) -> BTreeSet<u16> {
        let args = vec![
            "-iTCP".to_string(),
            "-sTCP:LISTEN".to_string(),
            "-P".to_string(),
            "-n".to_string(),
        ];
        command_stdout("lsof", &args)
            .await
            .map(|out| parse_lsof_listen_ports(&out).into_iter().collect())
            .unwrap_or_default()
    }
}

/// One pid per line; blanks and junk are skipped, duplicates dropped.
pub fn parse_pid_lines(output: &str) -> Vec<u32> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| seen.insert(*pid))
        .collect()
}

fn listen_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":(\d+)\s+\(LISTEN\)").expect("valid regex"))
}

/// Ports from `lsof -iTCP` rows in LISTEN state, in output order.
pub fn parse_lsof_listen_ports(output: &str) -> Vec<u16> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter(|line| line.contains("LISTEN"))
        .filter_map(|line| listen_pattern().captures(line))
        .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<u16>().ok()))
        .filter(|port| seen.insert(*port))
        .collect()
}

/// Reads `/proc/net/tcp{,6}` and `/proc/<pid>/fd` directly.
#[derive(Debug, Clone)]
pub struct ProcfsPortProbe {
    root: PathBuf,
}

impl Default for ProcfsPortProbe {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcfsPortProbe {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn listening_sockets(&self) -> Vec<(u16, u64)> {
        let mut sockets = Vec::new();
        for table in ["net/tcp", "net/tcp6"] {
            if let Ok(content) = std::fs::read_to_string(self.root.join(table)) {
                sockets.extend(parse_proc_net_tcp(&content));
            }
        }
        sockets
    }

    fn socket_inodes(&self, pid: u32) -> HashSet<u64> {
        let mut inodes = HashSet::new();
        let Ok(entries) = std::fs::read_dir(self.root.join(pid.to_string()).join("fd")) else {
            return inodes;
        };
        for entry in entries.flatten() {
            if let Ok(target) = std::fs::read_link(entry.path()) {
                if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                    inodes.insert(inode);
                }
            }
        }
        inodes
    }

    fn children(&self, pid: u32) -> Vec<u32> {
        let mut children = Vec::new();
        let Ok(tasks) = std::fs::read_dir(self.root.join(pid.to_string()).join("task")) else {
            return children;
        };
        for task in tasks.flatten() {
            if let Ok(content) = std::fs::read_to_string(task.path().join("children")) {
                children.extend(
                    content
                        .split_whitespace()
                        .filter_map(|value| value.parse::<u32>().ok()),
                );
            }
        }
        children
    }

    fn all_pids(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()))
            .collect()
    }

    fn pids_on_port_sync(&self, port: u16) -> Vec<u32> {
        let wanted: HashSet<u64> = self
            .listening_sockets()
            .into_iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, inode)| inode)
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }
        let mut pids: Vec<u32> = self
            .all_pids()
            .into_iter()
            .filter(|pid| !self.socket_inodes(*pid).is_disjoint(&wanted))
            .collect();
        pids.sort_unstable();
        pids
    }

    fn listening_port_for_pid_sync(&self, pid: u32) -> Option<u16> {
        let mut inodes = self.socket_inodes(pid);
        for child in self.children(pid) {
            inodes.extend(self.socket_inodes(child));
        }
        if inodes.is_empty() {
            return None;
        }
        self.listening_sockets()
            .into_iter()
            .find(|(_, inode)| inodes.contains(inode))
            .map(|(port, _)| port)
    }
}

#[async_trait]
impl PortProbe for ProcfsPortProbe {
    async fn pids_on_port(&self, port: u16) -> Vec<u32> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || probe.pids_on_port_sync(port))
            .await
            .unwrap_or_default()
    }

    async fn listening_port_for_pid(&self, pid: u32) -> Option<u16> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || probe.listening_port_for_pid_sync(pid))
            .await
            .ok()
            .flatten()
    }

    async fn listening_ports(&self) -> BTreeSet<u16> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || {
            probe
                .listening_sockets()
                .into_iter()
                .map(|(port, _)| port)
                .collect::<BTreeSet<u16>>()
        })
        .await
        .unwrap_or_default()
    }
}

const TCP_LISTEN_STATE: &str = "0A";

/// `(port, inode)` for every LISTEN row of a `/proc/net/tcp` table.
pub fn parse_proc_net_tcp(content: &str) -> Vec<(u16, u64)> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN_STATE {
                return None;
            }
            let (_, port_hex) = fields[1].rsplit_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            let inode = fields[9].parse::<u64>().ok()?;
            Some((port, inode))
        })
        .collect()
}

fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    const NET_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5551 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0BB9 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 5552 1 0000000000000000 100 0 0 10 0
   2: 0100007F:C350 0100007F:0BB8 01 00000000:00000000 00:00000000 00000000  1000        0 5553 1 0000000000000000 20 4 30 10 -1
";

    fn fake_proc() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        std::fs::create_dir_all(root.join("net")).expect("net dir");
        std::fs::write(root.join("net/tcp"), NET_TCP).expect("tcp table");

        // 100 is a shell whose child 101 owns the socket on 3000.
        std::fs::create_dir_all(root.join("100/fd")).expect("fd");
        std::fs::create_dir_all(root.join("100/task/100")).expect("task");
        std::fs::write(root.join("100/task/100/children"), "101 ").expect("children");
        symlink("/dev/null", root.join("100/fd/0")).expect("link");

        std::fs::create_dir_all(root.join("101/fd")).expect("fd");
        symlink("socket:[5551]", root.join("101/fd/3")).expect("link");
        symlink("socket:[5553]", root.join("101/fd/4")).expect("link");

        std::fs::create_dir_all(root.join("200/fd")).expect("fd");
        symlink("socket:[5552]", root.join("200/fd/7")).expect("link");
        dir
    }

    #[test]
    fn parses_listen_rows_only() {
        assert_eq!(parse_proc_net_tcp(NET_TCP), vec![(3000, 5551), (3001, 5552)]);
    }

    #[test]
    fn parses_lsof_rows() {
        let output = "\
COMMAND   PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
node    4242  dev   23u  IPv4 0x1      0t0  TCP 127.0.0.1:3000 (LISTEN)
node    4242  dev   24u  IPv6 0x2      0t0  TCP [::1]:3000 (LISTEN)
node    4242  dev   25u  IPv4 0x3      0t0  TCP 127.0.0.1:51000->127.0.0.1:5432 (ESTABLISHED)
vite    4300  dev   30u  IPv4 0x4      0t0  TCP *:5173 (LISTEN)
";
        assert_eq!(parse_lsof_listen_ports(output), vec![3000, 5173]);
        assert_eq!(parse_pid_lines("4242\n4300\n\n4242\nnope\n"), vec![4242, 4300]);
    }

    #[tokio::test]
    async fn procfs_finds_port_owner_and_child_port() {
        let dir = fake_proc();
        let probe = ProcfsPortProbe::with_root(dir.path());

        assert_eq!(probe.pids_on_port(3000).await, vec![101]);
        assert_eq!(probe.pids_on_port(3001).await, vec![200]);
        assert!(probe.pids_on_port(4000).await.is_empty());

        assert_eq!(probe.listening_port_for_pid(100).await, Some(3000));
        assert_eq!(probe.listening_port_for_pid(200).await, Some(3001));
        assert_eq!(probe.listening_port_for_pid(999).await, None);

        let ports: Vec<u16> = probe.listening_ports().await.into_iter().collect();
        assert_eq!(ports, vec![3000, 3001]);
    }

    #[tokio::test]
    async fn missing_proc_tree_reads_as_empty() {
        let probe = ProcfsPortProbe::with_root("/definitely/not/here");
        assert!(probe.pids_on_port(3000).await.is_empty());
        assert_eq!(probe.listening_port_for_pid(1).await, None);
        assert!(probe.listening_ports().await.is_empty());
    }

    #[tokio::test]
    async fn http_probe_fails_on_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let client = http_client(Duration::from_millis(500));
        assert!(!is_http_up(&client, port, Duration::from_millis(500)).await);
    }
}
