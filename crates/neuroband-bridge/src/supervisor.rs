use neuroband_types::{BackendState, BackendStatus, BridgeError, BridgeResult};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::BackendConfig;
use crate::polling::AdaptivePoller;

/// Literal backend output fragments accepted as proof of readiness.
pub const READY_MARKERS: &[&str] = &[
    "Application startup complete",
    "Server initialized",
    "Uvicorn running on",
];

const START_POLL_INTERVAL_MS: u64 = 100;
const STATUS_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Graceful,
    ForceKilled,
}

struct SupervisorInner {
    status: BackendStatus,
    started_at: Option<Instant>,
}

/// Owns the backend child process: spawn, readiness detection from its
/// output, escalating shutdown, restart. Every state change is broadcast as
/// a status snapshot; the bare state is also published on a watch channel
/// for components that only gate on it.
pub struct BackendSupervisor {
    config: BackendConfig,
    inner: Arc<RwLock<SupervisorInner>>,
    process: Arc<RwLock<Option<Child>>>,
    poller: Arc<AdaptivePoller>,
    events: broadcast::Sender<BackendStatus>,
    state_tx: Arc<watch::Sender<BackendState>>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig, poller: Arc<AdaptivePoller>) -> Self {
        let (events, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(BackendState::Stopped);
        let status = BackendStatus::stopped(config.port);

        Self {
            config,
            inner: Arc::new(RwLock::new(SupervisorInner {
                status,
                started_at: None,
            })),
            process: Arc::new(RwLock::new(None)),
            poller,
            events,
            state_tx: Arc::new(state_tx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendStatus> {
        self.events.subscribe()
    }

    pub fn state_watch(&self) -> watch::Receiver<BackendState> {
        self.state_tx.subscribe()
    }

    pub async fn state(&self) -> BackendState {
        self.inner.read().await.status.state
    }

    pub async fn status(&self) -> BackendStatus {
        let inner = self.inner.read().await;
        let mut snapshot = inner.status.clone();
        if snapshot.state == BackendState::Running {
            if let Some(started) = inner.started_at {
                snapshot.uptime_secs = started.elapsed().as_secs();
            }
        }
        snapshot
    }

    /// Spawns the backend and waits for a readiness marker on its stdout.
    /// On readiness timeout the state intentionally stays Starting: the
    /// child is still alive and the marker may yet arrive; `stop()` or
    /// `restart()` give the caller a clean slate.
    pub async fn start(&self) -> BridgeResult<()> {
        {
            let inner = self.inner.read().await;
            if matches!(
                inner.status.state,
                BackendState::Starting | BackendState::Running
            ) {
                return Err(BridgeError::Backend(format!(
                    "Cannot start backend from state {}",
                    inner.status.state
                )));
            }
        }

        self.transition(BackendState::Starting, |inner| {
            inner.status.last_error = None;
            inner.status.pid = None;
            inner.status.uptime_secs = 0;
            inner.started_at = None;
        })
        .await;

        let executable = match self.resolve_executable().await {
            Ok(path) => path,
            Err(e) => {
                let message = e.to_string();
                self.transition(BackendState::Error, |inner| {
                    inner.status.last_error = Some(message.clone());
                })
                .await;
                return Err(e);
            }
        };

        info!("Starting signal backend: {:?}", executable);
        let mut command = Command::new(&executable);
        command
            .args(&self.config.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("Failed to spawn backend: {}", e);
                error!("{}", message);
                self.transition(BackendState::Error, |inner| {
                    inner.status.last_error = Some(message.clone());
                })
                .await;
                return Err(BridgeError::Backend(message));
            }
        };

        // record the pid before the readers start: a fast backend may hit
        // its readiness marker immediately, and that transition must win
        let pid = child.id();
        let snapshot = {
            let mut inner = self.inner.write().await;
            inner.status.pid = pid;
            inner.status.clone()
        };
        let _ = self.events.send(snapshot);

        self.spawn_stdout_reader(&mut child);
        self.spawn_stderr_reader(&mut child);
        *self.process.write().await = Some(child);

        self.wait_for_ready().await
    }

    async fn wait_for_ready(&self) -> BridgeResult<()> {
        let deadline = Instant::now() + Duration::from_secs(self.config.ready_timeout_secs);

        loop {
            match self.state().await {
                BackendState::Running => {
                    info!("Backend ready (pid {:?})", self.status().await.pid);
                    return Ok(());
                }
                BackendState::Error => {
                    let message = self
                        .status()
                        .await
                        .last_error
                        .unwrap_or_else(|| "backend failed".to_string());
                    return Err(BridgeError::Backend(message));
                }
                BackendState::Stopping | BackendState::Stopped => {
                    return Err(BridgeError::Backend(
                        "Backend was stopped before becoming ready".into(),
                    ));
                }
                BackendState::Starting => {}
            }

            if let Some(exit) = self.check_exit().await? {
                self.transition(BackendState::Stopped, |inner| {
                    inner.status.pid = None;
                    inner.started_at = None;
                })
                .await;
                return Err(BridgeError::Backend(format!(
                    "Backend exited before becoming ready (exit code {:?})",
                    exit
                )));
            }

            if Instant::now() >= deadline {
                warn!(
                    "Backend did not report ready within {}s",
                    self.config.ready_timeout_secs
                );
                return Err(BridgeError::Backend(format!(
                    "Timed out after {}s waiting for backend readiness",
                    self.config.ready_timeout_secs
                )));
            }

            tokio::time::sleep(Duration::from_millis(START_POLL_INTERVAL_MS)).await;
        }
    }

    /// Polls the child for an early exit. Returns the exit code when the
    /// process is gone; a wait error transitions to Error.
    async fn check_exit(&self) -> BridgeResult<Option<Option<i32>>> {
        let mut process = self.process.write().await;
        let Some(child) = process.as_mut() else {
            return Ok(None);
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                process.take();
                Ok(Some(status.code()))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                process.take();
                drop(process);
                let message = format!("Failed to poll backend process: {}", e);
                self.transition(BackendState::Error, |inner| {
                    inner.status.pid = None;
                    inner.status.last_error = Some(message.clone());
                })
                .await;
                Err(BridgeError::Backend(message))
            }
        }
    }

    /// Graceful stop with escalation: terminate signal, then a hard kill
    /// once the grace period lapses.
    pub async fn stop(&self) -> BridgeResult<StopOutcome> {
        let child = self.process.write().await.take();
        let Some(mut child) = child else {
            self.transition(BackendState::Stopped, |inner| {
                inner.status.pid = None;
                inner.started_at = None;
            })
            .await;
            return Ok(StopOutcome::NotRunning);
        };

        info!("Stopping backend (pid {:?})", child.id());
        self.transition(BackendState::Stopping, |_| {}).await;
        Self::send_terminate(&mut child);

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Backend stopped (exit code {:?})", status.code());
                self.transition(BackendState::Stopped, |inner| {
                    inner.status.pid = None;
                    inner.started_at = None;
                })
                .await;
                Ok(StopOutcome::Graceful)
            }
            Ok(Err(e)) => {
                let message = format!("Failed to wait for backend exit: {}", e);
                error!("{}", message);
                self.transition(BackendState::Error, |inner| {
                    inner.status.pid = None;
                    inner.started_at = None;
                    inner.status.last_error = Some(message.clone());
                })
                .await;
                Err(BridgeError::Backend(message))
            }
            Err(_) => {
                warn!(
                    "Backend ignored terminate signal for {}s, force killing",
                    self.config.shutdown_grace_secs
                );
                if let Err(e) = child.kill().await {
                    let message = format!("Failed to kill backend: {}", e);
                    error!("{}", message);
                    self.transition(BackendState::Error, |inner| {
                        inner.status.pid = None;
                        inner.started_at = None;
                        inner.status.last_error = Some(message.clone());
                    })
                    .await;
                    return Err(BridgeError::Backend(message));
                }
                self.transition(BackendState::Stopped, |inner| {
                    inner.status.pid = None;
                    inner.started_at = None;
                    inner.status.last_error = Some("Backend force killed after grace period".into());
                })
                .await;
                Ok(StopOutcome::ForceKilled)
            }
        }
    }

    /// Sequential stop, short settle delay, start. A failed stop aborts the
    /// restart. On success every polling task re-enters its init window.
    pub async fn restart(&self) -> BridgeResult<()> {
        info!("Restarting backend");
        self.stop().await?;
        tokio::time::sleep(Duration::from_millis(self.config.restart_delay_ms)).await;
        self.start().await?;
        self.poller.mark_initialization_start().await;
        Ok(())
    }

    /// Periodic watchdog tick wired as a polling task: notices a backend
    /// that exited on its own after it was Running.
    pub async fn maintenance(&self) -> BridgeResult<()> {
        if self.state().await != BackendState::Running {
            return Ok(());
        }

        if let Some(exit) = self.check_exit().await? {
            warn!("Backend exited unexpectedly (exit code {:?})", exit);
            self.transition(BackendState::Stopped, |inner| {
                inner.status.pid = None;
                inner.started_at = None;
                inner.status.last_error =
                    Some(format!("Backend exited unexpectedly (exit code {:?})", exit));
            })
            .await;
        }
        Ok(())
    }

    fn spawn_stdout_reader(&self, child: &mut Child) {
        let Some(stdout) = child.stdout.take() else {
            return;
        };
        let inner = self.inner.clone();
        let events = self.events.clone();
        let state_tx = self.state_tx.clone();

        tokio::spawn(async move {
            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                debug!("backend: {}", line);
                let mut guard = inner.write().await;
                guard.status.push_log(line.clone());

                let ready = READY_MARKERS.iter().any(|marker| line.contains(marker));
                if ready && guard.status.state == BackendState::Starting {
                    info!("Backend readiness marker seen: {}", line);
                    guard.status.state = BackendState::Running;
                    guard.started_at = Some(Instant::now());
                    let snapshot = guard.status.clone();
                    drop(guard);
                    state_tx.send_replace(BackendState::Running);
                    let _ = events.send(snapshot);
                }
            }
        });
    }

    fn spawn_stderr_reader(&self, child: &mut Child) {
        let Some(stderr) = child.stderr.take() else {
            return;
        };
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let reader = BufReader::new(stderr);
            let mut lines = reader.lines();

            // stderr lines are recorded but never change state: a healthy
            // backend still emits warnings here.
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("backend stderr: {}", line);
                let mut guard = inner.write().await;
                guard.status.push_log(line.clone());
                guard.status.last_error = Some(line);
            }
        });
    }

    async fn resolve_executable(&self) -> BridgeResult<PathBuf> {
        if let Some(path) = &self.config.executable {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(BridgeError::Config(format!(
                "Configured backend executable not found: {}",
                path.display()
            )));
        }

        let binary_name = if cfg!(windows) {
            "neuroband-backend.exe"
        } else {
            "neuroband-backend"
        };

        let candidates = vec![
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|p| p.join(binary_name)))
                .unwrap_or_default(),
            dirs::data_local_dir()
                .unwrap_or_default()
                .join("neuroband")
                .join("bin")
                .join(binary_name),
            PathBuf::from("/usr/local/bin").join(binary_name),
            PathBuf::from("/usr/bin").join(binary_name),
            dirs::home_dir()
                .map(|h| h.join(".local").join("bin").join(binary_name))
                .unwrap_or_default(),
        ];

        for path in &candidates {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        let which_cmd = if cfg!(windows) { "where" } else { "which" };
        if let Ok(output) = Command::new(which_cmd).arg(binary_name).output().await {
            if output.status.success() {
                let path_str = String::from_utf8_lossy(&output.stdout);
                let path = PathBuf::from(path_str.lines().next().unwrap_or("").trim());
                if path.exists() {
                    return Ok(path);
                }
            }
        }

        Err(BridgeError::Config(
            "neuroband-backend executable not found; set backend.executable in the config".into(),
        ))
    }

    #[cfg(unix)]
    fn send_terminate(child: &mut Child) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!("Failed to send SIGTERM to backend: {}", e);
            }
        }
    }

    #[cfg(not(unix))]
    fn send_terminate(child: &mut Child) {
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill backend: {}", e);
        }
    }

    async fn transition<F>(&self, state: BackendState, mutate: F)
    where
        F: FnOnce(&mut SupervisorInner),
    {
        let snapshot = {
            let mut inner = self.inner.write().await;
            inner.status.state = state;
            mutate(&mut inner);
            inner.status.clone()
        };
        self.state_tx.send_replace(state);
        let _ = self.events.send(snapshot);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn shell_backend(script: &str) -> BackendConfig {
        BackendConfig {
            executable: Some(PathBuf::from("/bin/sh")),
            args: vec!["-c".to_string(), script.to_string()],
            ready_timeout_secs: 2,
            shutdown_grace_secs: 1,
            restart_delay_ms: 10,
            ..Default::default()
        }
    }

    fn supervisor(config: BackendConfig) -> BackendSupervisor {
        BackendSupervisor::new(config, Arc::new(AdaptivePoller::new()))
    }

    #[tokio::test]
    async fn test_start_resolves_on_ready_marker() {
        let sup = supervisor(shell_backend(
            "echo 'Application startup complete'; sleep 30",
        ));

        sup.start().await.unwrap();
        let status = sup.status().await;
        assert_eq!(status.state, BackendState::Running);
        assert!(status.pid.is_some());
        assert!(status
            .recent_logs
            .iter()
            .any(|l| l.contains("Application startup complete")));

        assert_eq!(sup.stop().await.unwrap(), StopOutcome::Graceful);
        assert_eq!(sup.state().await, BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_start_fails_when_already_running() {
        let sup = supervisor(shell_backend("echo 'Server initialized'; sleep 30"));
        sup.start().await.unwrap();
        assert!(sup.start().await.is_err());
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_failure() {
        let sup = supervisor(shell_backend("echo 'warming up'; exit 3"));
        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("before becoming ready"));
        assert_eq!(sup.state().await, BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_ready_timeout_leaves_state_starting() {
        let sup = supervisor(shell_backend("sleep 30"));
        let err = sup.start().await.unwrap_err();
        assert!(err.to_string().contains("Timed out"));
        assert_eq!(sup.state().await, BackendState::Starting);

        // stop() recovers the stuck start
        sup.stop().await.unwrap();
        assert_eq!(sup.state().await, BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_sets_error_state() {
        let config = BackendConfig {
            executable: Some(PathBuf::from("/nonexistent/neuroband-backend")),
            ..shell_backend("")
        };
        let sup = supervisor(config);
        assert!(sup.start().await.is_err());
        let status = sup.status().await;
        assert_eq!(status.state, BackendState::Error);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop_success() {
        let sup = supervisor(shell_backend(""));
        assert_eq!(sup.stop().await.unwrap(), StopOutcome::NotRunning);
        assert_eq!(sup.state().await, BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_force_kill() {
        let sup = supervisor(shell_backend(
            "trap '' TERM; echo 'Server initialized'; while true; do sleep 1; done",
        ));
        sup.start().await.unwrap();

        let outcome = sup.stop().await.unwrap();
        assert_eq!(outcome, StopOutcome::ForceKilled);
        assert_eq!(sup.state().await, BackendState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_cycles_through_running() {
        let sup = supervisor(shell_backend("echo 'Uvicorn running on 8765'; sleep 30"));
        sup.start().await.unwrap();
        sup.restart().await.unwrap();
        assert_eq!(sup.state().await, BackendState::Running);
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_records_last_error_without_state_change() {
        let sup = supervisor(shell_backend(
            "echo 'Server initialized'; echo 'worker warning' >&2; sleep 30",
        ));
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = sup.status().await;
        assert_eq!(status.state, BackendState::Running);
        assert_eq!(status.last_error.as_deref(), Some("worker warning"));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_notices_unexpected_exit() {
        let sup = supervisor(shell_backend("echo 'Server initialized'; sleep 0.2"));
        sup.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        sup.maintenance().await.unwrap();
        let status = sup.status().await;
        assert_eq!(status.state, BackendState::Stopped);
        assert!(status
            .last_error
            .unwrap()
            .contains("exited unexpectedly"));
    }

    #[tokio::test]
    async fn test_status_broadcast_on_transitions() {
        let sup = supervisor(shell_backend("echo 'Server initialized'; sleep 30"));
        let mut events = sup.subscribe();

        sup.start().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(snapshot) = events.try_recv() {
            seen.push(snapshot.state);
        }
        assert!(seen.contains(&BackendState::Starting));
        assert!(seen.contains(&BackendState::Running));
        sup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_watch_gates_on_running() {
        let sup = supervisor(shell_backend("echo 'Server initialized'; sleep 30"));
        let watch = sup.state_watch();
        assert_eq!(*watch.borrow(), BackendState::Stopped);

        sup.start().await.unwrap();
        assert_eq!(*watch.borrow(), BackendState::Running);
        sup.stop().await.unwrap();
        assert_eq!(*watch.borrow(), BackendState::Stopped);
    }
}
