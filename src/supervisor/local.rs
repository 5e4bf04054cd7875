//! Process controller for proxy processes running on this host.
//!
//! Each node's process is started detached in its own process group and
//! tracked through a pid file, so a short-lived CLI invocation and the
//! long-running daemon see the same processes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{PathsConfig, SupervisorConfig};
use crate::registry::NodeId;
use crate::supervisor::{ProcessController, SupervisionError};

const CONFIG_PLACEHOLDER: &str = "{config}";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(1);

pub struct LocalProcessController {
    binary: String,
    args: Vec<String>,
    pid_dir: PathBuf,
    stop_timeout: Duration,
    startup_grace: Duration,
}

impl LocalProcessController {
    pub fn new(supervisor: &SupervisorConfig, paths: &PathsConfig) -> Self {
        Self {
            binary: supervisor.binary.clone(),
            args: supervisor.args.clone(),
            pid_dir: paths.pid_dir.clone(),
            stop_timeout: supervisor.stop_timeout(),
            startup_grace: supervisor.startup_grace(),
        }
    }

    pub fn pid_path(&self, node_id: NodeId) -> PathBuf {
        self.pid_dir.join(format!("node_{node_id}.pid"))
    }

    fn command_args(&self, config_path: &Path) -> Vec<String> {
        let config = config_path.display().to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(CONFIG_PLACEHOLDER, &config))
            .collect()
    }

    fn read_pid(&self, node_id: NodeId) -> Result<Option<u32>, SupervisionError> {
        let path = self.pid_path(node_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SupervisionError::PidFile { path, source }),
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                tracing::warn!(node = node_id, path = %path.display(), "Discarding unreadable pid file");
                self.clear_pid(node_id)?;
                Ok(None)
            }
        }
    }

    fn write_pid(&self, node_id: NodeId, pid: u32) -> Result<(), SupervisionError> {
        let path = self.pid_path(node_id);
        fs::create_dir_all(&self.pid_dir).map_err(|source| SupervisionError::PidFile {
            path: self.pid_dir.clone(),
            source,
        })?;
        fs::write(&path, format!("{pid}\n"))
            .map_err(|source| SupervisionError::PidFile { path, source })
    }

    fn clear_pid(&self, node_id: NodeId) -> Result<(), SupervisionError> {
        let path = self.pid_path(node_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SupervisionError::PidFile { path, source }),
        }
    }

    async fn wait_for_exit(pid: u32, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if !signal::is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ProcessController for LocalProcessController {
    async fn start(&self, node_id: NodeId, config_path: &Path) -> Result<u32, SupervisionError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(self.command_args(config_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        command.process_group(0);

        let spawn_err = |source| SupervisionError::Spawn {
            binary: self.binary.clone(),
            source,
        };
        let mut child = command.spawn().map_err(spawn_err)?;
        let pid = child.id().ok_or_else(|| SupervisionError::Spawn {
            binary: self.binary.clone(),
            source: io::Error::other("process exited before its pid was read"),
        })?;

        // Catches engines that exit at once, e.g. on a rejected document.
        if !self.startup_grace.is_zero() {
            tokio::time::sleep(self.startup_grace).await;
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(SupervisionError::Spawn {
                    binary: self.binary.clone(),
                    source: io::Error::other(format!("exited during startup with {status}")),
                });
            }
            Ok(None) => {}
            Err(source) => return Err(spawn_err(source)),
        }

        self.write_pid(node_id, pid)?;

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(node = node_id, pid, %status, "Proxy process exited"),
                Err(e) => tracing::warn!(node = node_id, pid, error = %e, "Failed to reap proxy process"),
            }
        });

        tracing::info!(node = node_id, pid, config = %config_path.display(), "Proxy process started");
        Ok(pid)
    }

    async fn stop(&self, node_id: NodeId) -> Result<(), SupervisionError> {
        let Some(pid) = self.read_pid(node_id)? else {
            return Ok(());
        };

        if !signal::terminate(pid)? {
            tracing::debug!(node = node_id, pid, "Proxy process already gone");
            return self.clear_pid(node_id);
        }

        if !Self::wait_for_exit(pid, self.stop_timeout).await {
            tracing::warn!(node = node_id, pid, "Proxy process ignored SIGTERM, killing");
            signal::kill(pid)?;
            if !Self::wait_for_exit(pid, KILL_GRACE).await {
                return Err(SupervisionError::StopTimeout { pid });
            }
        }

        tracing::info!(node = node_id, pid, "Proxy process stopped");
        self.clear_pid(node_id)
    }

    fn is_running(&self, node_id: NodeId) -> bool {
        matches!(self.read_pid(node_id), Ok(Some(pid)) if signal::is_alive(pid))
    }
}

#[cfg(unix)]
mod signal {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    use crate::supervisor::SupervisionError;

    fn to_pid(pid: u32) -> Result<Pid, Errno> {
        i32::try_from(pid).map(Pid::from_raw).map_err(|_| Errno::EINVAL)
    }

    /// Liveness of the group leader itself.
    pub fn is_alive(pid: u32) -> bool {
        match to_pid(pid).and_then(|pid| signal::kill(pid, None)) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Signal every process in the group led by `pid`. The engine is spawned
    /// as a group leader, so this also reaches anything it forked.
    fn send_group(pid: u32, sig: Signal) -> Result<bool, SupervisionError> {
        let signalled = to_pid(pid).and_then(|pgrp| signal::killpg(pgrp, sig));
        match signalled {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(SupervisionError::Signal {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    /// Returns false if the process group no longer exists.
    pub fn terminate(pid: u32) -> Result<bool, SupervisionError> {
        send_group(pid, Signal::SIGTERM)
    }

    pub fn kill(pid: u32) -> Result<(), SupervisionError> {
        send_group(pid, Signal::SIGKILL).map(|_| ())
    }
}

#[cfg(not(unix))]
mod signal {
    use crate::supervisor::SupervisionError;

    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn terminate(pid: u32) -> Result<bool, SupervisionError> {
        Err(SupervisionError::Signal {
            pid,
            reason: "signals are not supported on this platform".to_string(),
        })
    }

    pub fn kill(pid: u32) -> Result<(), SupervisionError> {
        terminate(pid).map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn controller(dir: &Path, binary: &str, args: &[&str]) -> LocalProcessController {
        LocalProcessController::new(
            &SupervisorConfig {
                binary: binary.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                stop_timeout_secs: 2,
                startup_grace_ms: 300,
            },
            &PathsConfig {
                config_dir: dir.join("etc"),
                log_dir: dir.join("log"),
                pid_dir: dir.join("run"),
            },
        )
    }

    #[test]
    fn test_config_placeholder_is_substituted() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), "xray", &["run", "-c", "{config}"]);
        let args = ctl.command_args(Path::new("/etc/xray/config_1.json"));
        assert_eq!(args, vec!["run", "-c", "/etc/xray/config_1.json"]);
    }

    #[tokio::test]
    async fn test_stop_without_pid_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), "sleep", &["30"]);
        ctl.stop(1).await.unwrap();
        assert!(!ctl.is_running(1));
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), "sleep", &["30"]);

        let pid = ctl.start(1, Path::new("/dev/null")).await.unwrap();
        assert!(ctl.is_running(1));
        assert_eq!(ctl.read_pid(1).unwrap(), Some(pid));

        ctl.stop(1).await.unwrap();
        assert!(!ctl.is_running(1));
        assert!(!ctl.pid_path(1).exists());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), "false", &[]);
        let err = ctl.start(1, Path::new("/dev/null")).await.unwrap_err();
        assert!(matches!(err, SupervisionError::Spawn { .. }));
        assert!(!ctl.pid_path(1).exists());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), "/nonexistent/xray-binary", &[]);
        let err = ctl.start(1, Path::new("/dev/null")).await.unwrap_err();
        assert!(matches!(err, SupervisionError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_zero_startup_grace_skips_the_wait() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(dir.path(), "sleep", &["30"]);
        ctl.startup_grace = Duration::ZERO;

        let started = std::time::Instant::now();
        ctl.start(1, Path::new("/dev/null")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
        ctl.stop(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_pid_file_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path(), "sleep", &["30"]);
        ctl.write_pid(1, 999_999).unwrap();
        ctl.stop(1).await.unwrap();
        assert!(!ctl.pid_path(1).exists());
    }

    /// Gone or a zombie awaiting a reaper we do not control.
    #[cfg(target_os = "linux")]
    fn exited(pid: u32) -> bool {
        match fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_reaches_forked_children() {
        let dir = tempfile::tempdir().unwrap();
        let child_pid_path = dir.path().join("child.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", child_pid_path.display());
        let ctl = controller(dir.path(), "sh", &["-c", &script]);

        ctl.start(1, Path::new("/dev/null")).await.unwrap();
        let child: u32 = fs::read_to_string(&child_pid_path)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!exited(child));

        ctl.stop(1).await.unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !exited(child) && std::time::Instant::now() < deadline {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        assert!(exited(child), "forked child {child} survived stop");
    }
}
