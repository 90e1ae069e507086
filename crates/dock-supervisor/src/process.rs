use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::process::ExitStatus;

use dock_core::ProjectStatus;

/// A spawned process that leads its own process group. Signals go to the
/// whole group so shells and the servers they fork go down together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    leader: u32,
}

impl ProcessGroup {
    pub fn new(leader: u32) -> Self {
        Self { leader }
    }

    pub fn leader(&self) -> u32 {
        self.leader
    }

    /// Signals the group, falling back to the leader alone when `leader` does
    /// not head a group. Returns false if neither could be signalled.
    pub fn signal(&self, signal: Signal) -> bool {
        let Some(pid) = raw_pid(self.leader) else {
            return false;
        };
        match killpg(pid, signal) {
            Ok(()) => true,
            Err(_) => kill(pid, signal).is_ok(),
        }
    }

    pub fn terminate(&self) -> bool {
        self.signal(Signal::SIGTERM)
    }

    pub fn kill(&self) -> bool {
        self.signal(Signal::SIGKILL)
    }

    /// True while any member of the group, or the leader itself, exists.
    pub fn is_alive(&self) -> bool {
        let Some(pid) = raw_pid(self.leader) else {
            return false;
        };
        match killpg(pid, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => is_pid_alive(self.leader),
        }
    }
}

fn raw_pid(pid: u32) -> Option<Pid> {
    let raw = i32::try_from(pid).ok()?;
    // 0 and negatives address groups, never a single process.
    (raw > 0).then(|| Pid::from_raw(raw))
}

/// Signal-0 liveness check. `EPERM` means the pid exists under another user.
pub fn is_pid_alive(pid: u32) -> bool {
    let Some(pid) = raw_pid(pid) else {
        return false;
    };
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

/// How a process that ended on its own is recorded: clean exits and SIGTERM
/// are `stopped`, anything else is `error` with a readable reason.
pub fn classify_exit(status: &ExitStatus) -> (ProjectStatus, String) {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        let message = format!("Exited with code {code}");
        return if code == 0 {
            (ProjectStatus::Stopped, message)
        } else {
            (ProjectStatus::Error, message)
        };
    }
    match status.signal() {
        Some(raw) => {
            let name = Signal::try_from(raw)
                .map(|signal| signal.as_str().to_string())
                .unwrap_or_else(|_| raw.to_string());
            let status = if raw == Signal::SIGTERM as i32 {
                ProjectStatus::Stopped
            } else {
                ProjectStatus::Error
            };
            (status, format!("Killed by signal {name}"))
        }
        None => (ProjectStatus::Error, "Exited with unknown status".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn clean_exit_and_sigterm_count_as_stopped() {
        let (status, message) = classify_exit(&ExitStatus::from_raw(0));
        assert_eq!(status, ProjectStatus::Stopped);
        assert_eq!(message, "Exited with code 0");

        let (status, message) = classify_exit(&ExitStatus::from_raw(Signal::SIGTERM as i32));
        assert_eq!(status, ProjectStatus::Stopped);
        assert_eq!(message, "Killed by signal SIGTERM");
    }

    #[test]
    fn failures_count_as_error() {
        // Wait status encodes the exit code in the high byte.
        let (status, message) = classify_exit(&ExitStatus::from_raw(3 << 8));
        assert_eq!(status, ProjectStatus::Error);
        assert_eq!(message, "Exited with code 3");

        let (status, message) = classify_exit(&ExitStatus::from_raw(Signal::SIGKILL as i32));
        assert_eq!(status, ProjectStatus::Error);
        assert_eq!(message, "Killed by signal SIGKILL");
    }

    #[test]
    fn own_pid_is_alive_and_nonsense_is_not() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(u32::MAX));
    }

    #[tokio::test]
    async fn group_signal_reaches_the_shell() {
        let mut child = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg("sleep 30")
            .process_group(0)
            .spawn()
            .expect("spawn");
        let group = ProcessGroup::new(child.id().expect("pid"));
        assert!(group.is_alive());
        assert!(group.terminate());
        let status = child.wait().await.expect("wait");
        assert_eq!(classify_exit(&status).0, ProjectStatus::Stopped);
    }
}
