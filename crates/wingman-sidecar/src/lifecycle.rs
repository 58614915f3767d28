// Sidecar lifecycle management
// Decides when the worker must be spawned, reused, reaped or stopped.

use crate::config::{SidecarConfig, ENV_SIDECAR_PORT, ENV_TOOLS_ENABLED, ENV_TOOLS_FALLBACK};
use crate::delay::{Delay, TokioDelay};
use crate::health::{HealthProbe, HttpHealthProbe};
use crate::logs::{LogRingBuffer, OutputLine, DEFAULT_OUTPUT_LINES};
use crate::ports::{PortInspector, SystemPortInspector};
use crate::process::{LaunchSpec, ProcessSession, ProcessSupervisor, TerminationRecord};
use crate::resolve::{default_known_runtime_paths, resolve_runtime, resolve_script};
use crate::retry::poll_until;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use wingman_observability::{emit_event, ObservabilityEvent, ProcessKind};

const STALE_LISTENER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

/// Result of `start_if_needed`. Never an error: an unreachable worker is
/// noticed by health polling, not by the caller handling a failure here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning { pid: u32 },
    /// A healthy worker from another source already serves the port.
    ReusedExisting,
    Spawned { pid: u32 },
    Unresolved { reason: String },
    SpawnFailed { reason: String },
}

impl StartOutcome {
    pub fn is_serving(&self) -> bool {
        matches!(
            self,
            StartOutcome::AlreadyRunning { .. }
                | StartOutcome::ReusedExisting
                | StartOutcome::Spawned { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub state: SidecarState,
    pub pid: Option<u32>,
    pub port: u16,
    /// False when reusing a worker we did not spawn.
    pub owns_process: bool,
    pub script_path: Option<String>,
    pub runtime_path: Option<String>,
    pub spawn_count: u64,
}

/// What the HTTP client needs from the lifecycle layer.
#[async_trait]
pub trait SidecarLauncher: Send + Sync {
    async fn start_if_needed(&self) -> StartOutcome;

    async fn restart(&self) -> StartOutcome;
}

#[derive(Debug)]
struct Status {
    state: SidecarState,
    pid: Option<u32>,
    owns_process: bool,
    script_path: Option<PathBuf>,
    runtime_path: Option<PathBuf>,
    spawn_count: u64,
}

pub struct SidecarLifecycle {
    config: SidecarConfig,
    supervisor: Arc<ProcessSupervisor>,
    health: Arc<dyn HealthProbe>,
    ports: Arc<dyn PortInspector>,
    delay: Arc<dyn Delay>,
    known_runtime_paths: Vec<PathBuf>,
    lifecycle_lock: tokio::sync::Mutex<()>,
    status: Arc<Mutex<Status>>,
    log_buffer: Arc<LogRingBuffer>,
}

impl SidecarLifecycle {
    /// Production wiring: tokio processes, HTTP health probe, OS port queries.
    pub fn new(config: SidecarConfig) -> Self {
        Self::with_supervisor(config, Arc::new(ProcessSupervisor::with_tokio_backend()))
    }

    pub fn with_supervisor(config: SidecarConfig, supervisor: Arc<ProcessSupervisor>) -> Self {
        let health = HttpHealthProbe::new(reqwest::Client::new(), &config);
        Self {
            config,
            supervisor,
            health: Arc::new(health),
            ports: Arc::new(SystemPortInspector),
            delay: Arc::new(TokioDelay),
            known_runtime_paths: default_known_runtime_paths(),
            lifecycle_lock: tokio::sync::Mutex::new(()),
            status: Arc::new(Mutex::new(Status {
                state: SidecarState::NotStarted,
                pid: None,
                owns_process: false,
                script_path: None,
                runtime_path: None,
                spawn_count: 0,
            })),
            log_buffer: Arc::new(LogRingBuffer::new(DEFAULT_OUTPUT_LINES)),
        }
    }

    pub fn with_health_probe(mut self, health: Arc<dyn HealthProbe>) -> Self {
        self.health = health;
        self
    }

    pub fn with_port_inspector(mut self, ports: Arc<dyn PortInspector>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_known_runtime_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.known_runtime_paths = paths;
        self
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    pub fn state(&self) -> SidecarState {
        self.status.lock().state
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let status = self.status.lock();
        LifecycleSnapshot {
            state: status.state,
            pid: status.pid,
            port: self.config.port,
            owns_process: status.owns_process,
            script_path: status.script_path.as_ref().map(|p| p.display().to_string()),
            runtime_path: status.runtime_path.as_ref().map(|p| p.display().to_string()),
            spawn_count: status.spawn_count,
        }
    }

    pub fn logs_snapshot(&self, last_n: usize) -> (Vec<OutputLine>, u64) {
        (
            self.log_buffer.snapshot(last_n),
            self.log_buffer.dropped_total(),
        )
    }

    pub fn logs_since(&self, seq: u64) -> (Vec<OutputLine>, u64) {
        (self.log_buffer.since(seq), self.log_buffer.dropped_total())
    }

    pub async fn start_if_needed(&self) -> StartOutcome {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        self.start_locked().await
    }

    /// Stops the worker we own. A reused foreign worker is left alone.
    pub async fn stop(&self) -> Option<u32> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        self.stop_locked()
    }

    pub async fn restart(&self) -> StartOutcome {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;
        if self.stop_locked().is_some() {
            // The old worker must release the port before health can be trusted again.
            self.supervisor
                .wait_for_pending_exits(self.config.stale_listener_wait)
                .await;
        }
        self.start_locked().await
    }

    async fn start_locked(&self) -> StartOutcome {
        if self.supervisor.is_running() {
            if let Some(pid) = self.supervisor.tracked_pid() {
                tracing::debug!("Sidecar already running (pid {})", pid);
                return StartOutcome::AlreadyRunning { pid };
            }
        }
        if self.supervisor.clear_stale_handle() {
            self.set_state(SidecarState::NotStarted, None, false);
        }

        let Some(script) = resolve_script(&self.config) else {
            let reason = format!(
                "sidecar entry script {} not found in bundle or source directories",
                self.config.script_name
            );
            tracing::error!("{}", reason);
            self.emit_unresolved(&reason);
            return StartOutcome::Unresolved { reason };
        };

        if self.health.probe().await.is_healthy() {
            tracing::info!(
                "Healthy sidecar already serving port {}; reusing it",
                self.config.port
            );
            {
                let mut status = self.status.lock();
                status.state = SidecarState::Running;
                status.pid = None;
                status.owns_process = false;
                status.script_path = Some(script);
            }
            emit_event(
                Level::INFO,
                ProcessKind::Host,
                ObservabilityEvent {
                    event: "sidecar.start.reused",
                    component: "sidecar.lifecycle",
                    status: Some("ok"),
                    ..Default::default()
                },
            );
            return StartOutcome::ReusedExisting;
        }

        self.reap_stale_listeners(&script).await;

        let path_var = std::env::var_os("PATH");
        let Some(runtime) =
            resolve_runtime(&self.config, &self.known_runtime_paths, path_var.as_deref())
        else {
            let reason = "no worker runtime found (override, bundle, known paths, PATH)".to_string();
            tracing::error!("{}", reason);
            self.emit_unresolved(&reason);
            return StartOutcome::Unresolved { reason };
        };

        let spec = LaunchSpec {
            executable: runtime.clone(),
            args: vec![script.display().to_string()],
            working_dir: self
                .config
                .working_dir
                .clone()
                .or_else(|| script.parent().map(Path::to_path_buf)),
            env: worker_env(&self.config, |key| std::env::var_os(key).is_some()),
        };

        self.set_state(SidecarState::Starting, None, false);
        tracing::info!(
            "Spawning sidecar: {} {}",
            runtime.display(),
            script.display()
        );

        match self.supervisor.start(spec).await {
            Ok(session) => {
                let pid = session.pid;
                {
                    let mut status = self.status.lock();
                    status.state = SidecarState::Running;
                    status.pid = Some(pid);
                    status.owns_process = true;
                    status.script_path = Some(script);
                    status.runtime_path = Some(runtime);
                    status.spawn_count += 1;
                }
                self.watch_session(session);
                emit_event(
                    Level::INFO,
                    ProcessKind::Host,
                    ObservabilityEvent {
                        event: "sidecar.start.spawned",
                        component: "sidecar.lifecycle",
                        pid: Some(pid),
                        status: Some("ok"),
                        ..Default::default()
                    },
                );
                StartOutcome::Spawned { pid }
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!("Failed to spawn sidecar: {}", reason);
                self.set_state(SidecarState::NotStarted, None, false);
                emit_event(
                    Level::ERROR,
                    ProcessKind::Host,
                    ObservabilityEvent {
                        event: "sidecar.spawn.failed",
                        component: "sidecar.lifecycle",
                        status: Some("failed"),
                        error_code: Some("spawn_failed"),
                        detail: Some(&reason),
                        ..Default::default()
                    },
                );
                StartOutcome::SpawnFailed { reason }
            }
        }
    }

    fn stop_locked(&self) -> Option<u32> {
        let pid = self.supervisor.stop();
        let mut status = self.status.lock();
        status.state = SidecarState::Stopped;
        status.pid = None;
        status.owns_process = false;
        pid
    }

    /// Signals listeners on the well-known port whose command line mentions
    /// our script, then waits (bounded) for each to go away.
    async fn reap_stale_listeners(&self, script: &Path) {
        let script_text = script.display().to_string();
        let own_pid = std::process::id();
        let tracked = self.supervisor.tracked_pid();
        let attempts = (self.config.stale_listener_wait.as_millis()
            / STALE_LISTENER_POLL.as_millis())
        .max(1) as u32;

        for listener in self.ports.listeners(self.config.port).await {
            if listener.pid == own_pid || Some(listener.pid) == tracked {
                continue;
            }
            if !listener.command.contains(&script_text) {
                tracing::warn!(
                    "Port {} is held by unrelated PID {} ({}); leaving it alone",
                    self.config.port,
                    listener.pid,
                    listener.command
                );
                continue;
            }

            tracing::warn!(
                "Terminating stale sidecar PID {} still listening on port {}",
                listener.pid,
                self.config.port
            );
            if let Err(e) = self.ports.terminate(listener.pid) {
                tracing::warn!("Failed to signal stale sidecar PID {}: {}", listener.pid, e);
                continue;
            }

            let ports = self.ports.clone();
            let pid = listener.pid;
            let gone = poll_until(
                attempts,
                STALE_LISTENER_POLL,
                self.delay.as_ref(),
                &CancellationToken::new(),
                |_| {
                    let ports = ports.clone();
                    async move { !ports.is_alive(pid) }
                },
                |gone| *gone,
            )
            .await
            .is_ready();

            emit_event(
                if gone { Level::INFO } else { Level::WARN },
                ProcessKind::Host,
                ObservabilityEvent {
                    event: "sidecar.stale_listener.reaped",
                    component: "sidecar.lifecycle",
                    pid: Some(pid),
                    status: Some(if gone { "ok" } else { "still_alive" }),
                    ..Default::default()
                },
            );
        }
    }

    fn watch_session(&self, session: ProcessSession) {
        let ProcessSession {
            pid,
            mut output,
            termination,
        } = session;

        let log_buffer = self.log_buffer.clone();
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                tracing::info!(target: "wingman.sidecar", "[sidecar] {}", line);
                log_buffer.push(line);
            }
        });

        let status = self.status.clone();
        tokio::spawn(async move {
            let Ok(record) = termination.await else {
                return;
            };
            record_termination(&status, &record);
            tracing::debug!("Sidecar pid {} watcher finished", pid);
        });
    }

    fn set_state(&self, state: SidecarState, pid: Option<u32>, owns_process: bool) {
        let mut status = self.status.lock();
        status.state = state;
        status.pid = pid;
        status.owns_process = owns_process;
    }

    fn emit_unresolved(&self, reason: &str) {
        emit_event(
            Level::ERROR,
            ProcessKind::Host,
            ObservabilityEvent {
                event: "sidecar.start.unresolved",
                component: "sidecar.lifecycle",
                status: Some("failed"),
                error_code: Some("unresolved"),
                detail: Some(reason),
                ..Default::default()
            },
        );
    }
}

fn record_termination(status: &Mutex<Status>, record: &TerminationRecord) {
    {
        let mut status = status.lock();
        if status.pid == Some(record.pid) {
            status.state = if record.intentional {
                SidecarState::Stopped
            } else {
                SidecarState::NotStarted
            };
            status.pid = None;
            status.owns_process = false;
        }
    }

    let exit = record
        .exit_status
        .map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_string());
    if record.intentional {
        tracing::info!("Sidecar PID {} stopped (status {})", record.pid, exit);
    } else {
        tracing::warn!(
            "Sidecar PID {} exited unexpectedly ({:?}, status {})",
            record.pid,
            record.reason,
            exit
        );
    }
    let detail = format!("reason={:?} status={}", record.reason, exit);
    emit_event(
        if record.intentional {
            Level::INFO
        } else {
            Level::WARN
        },
        ProcessKind::Host,
        ObservabilityEvent {
            event: "sidecar.terminated",
            component: "sidecar.lifecycle",
            pid: Some(record.pid),
            status: Some(if record.intentional { "stopped" } else { "crashed" }),
            detail: Some(&detail),
            ..Default::default()
        },
    );
}

/// Caller-supplied env plus defaults for anything the caller (or the
/// inherited environment) has not set.
fn worker_env(config: &SidecarConfig, inherited: impl Fn(&str) -> bool) -> Vec<(String, String)> {
    let mut env = config.extra_env.clone();
    let port = config.port.to_string();
    let defaults = [
        (ENV_SIDECAR_PORT, port.as_str()),
        (ENV_TOOLS_ENABLED, "1"),
        (ENV_TOOLS_FALLBACK, "builtin"),
        ("NODE_NO_WARNINGS", "1"),
    ];
    for (key, value) in defaults {
        if env.iter().any(|(k, _)| k == key) || inherited(key) {
            continue;
        }
        env.push((key.to_string(), value.to_string()));
    }
    env
}

#[async_trait]
impl SidecarLauncher for SidecarLifecycle {
    async fn start_if_needed(&self) -> StartOutcome {
        SidecarLifecycle::start_if_needed(self).await
    }

    async fn restart(&self) -> StartOutcome {
        SidecarLifecycle::restart(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delay::RecordingDelay;
    use crate::health::HealthStatus;
    use crate::ports::ListenerProcess;
    use crate::process::testing::FakeBackend;
    use std::fs;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeHealth {
        healthy: AtomicBool,
        probes: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for FakeHealth {
        async fn probe(&self) -> HealthStatus {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                HealthStatus::Healthy
            } else {
                HealthStatus::Foreign { status: 503 }
            }
        }
    }

    #[derive(Default)]
    struct FakePorts {
        listeners: Mutex<Vec<ListenerProcess>>,
        terminated: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl PortInspector for FakePorts {
        async fn listeners(&self, _port: u16) -> Vec<ListenerProcess> {
            self.listeners.lock().clone()
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            self.terminated.lock().push(pid);
            self.listeners.lock().retain(|l| l.pid != pid);
            Ok(())
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.listeners.lock().iter().any(|l| l.pid == pid)
        }
    }

    struct Harness {
        _dir: TempDir,
        script: PathBuf,
        backend: Arc<FakeBackend>,
        health: Arc<FakeHealth>,
        ports: Arc<FakePorts>,
        lifecycle: Arc<SidecarLifecycle>,
    }

    fn harness_with(configure: impl FnOnce(&mut SidecarConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("resources/sidecar/index.js");
        fs::create_dir_all(script.parent().unwrap()).unwrap();
        fs::write(&script, b"// worker").unwrap();
        let runtime = dir.path().join("node");
        fs::write(&runtime, b"").unwrap();

        let mut config = SidecarConfig {
            resource_dir: Some(dir.path().join("resources")),
            source_dirs: Vec::new(),
            runtime_override: Some(runtime),
            ..SidecarConfig::default()
        };
        configure(&mut config);

        let backend = FakeBackend::new();
        let health = Arc::new(FakeHealth::default());
        let ports = Arc::new(FakePorts::default());
        let lifecycle = SidecarLifecycle::with_supervisor(
            config,
            Arc::new(ProcessSupervisor::new(backend.clone())),
        )
        .with_health_probe(health.clone())
        .with_port_inspector(ports.clone())
        .with_delay(Arc::new(RecordingDelay::new()))
        .with_known_runtime_paths(Vec::new());

        Harness {
            _dir: dir,
            script,
            backend,
            health,
            ports,
            lifecycle: Arc::new(lifecycle),
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    #[tokio::test]
    async fn healthy_existing_worker_is_reused_without_spawning() {
        let h = harness();
        h.health.healthy.store(true, Ordering::SeqCst);

        assert_eq!(h.lifecycle.start_if_needed().await, StartOutcome::ReusedExisting);
        assert_eq!(h.backend.spawn_count(), 0);
        let snapshot = h.lifecycle.snapshot();
        assert_eq!(snapshot.state, SidecarState::Running);
        assert!(!snapshot.owns_process);
    }

    #[tokio::test]
    async fn missing_script_is_reported_not_thrown() {
        let h = harness_with(|config| config.resource_dir = None);

        let outcome = h.lifecycle.start_if_needed().await;
        assert!(matches!(outcome, StartOutcome::Unresolved { .. }));
        assert_eq!(h.backend.spawn_count(), 0);
        assert_eq!(h.health.probes.load(Ordering::SeqCst), 0);
        assert_eq!(h.lifecycle.state(), SidecarState::NotStarted);
    }

    #[tokio::test]
    async fn spawn_injects_env_defaults_without_overwriting() {
        let h = harness_with(|config| {
            config.extra_env = vec![(ENV_TOOLS_FALLBACK.to_string(), "none".to_string())];
        });

        let outcome = h.lifecycle.start_if_needed().await;
        assert!(matches!(outcome, StartOutcome::Spawned { .. }));

        let spawned = h.backend.spawned.lock()[0].clone();
        assert_eq!(spawned.args, vec![h.script.display().to_string()]);
        let get = |key: &str| {
            spawned
                .env
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(get(ENV_TOOLS_FALLBACK), vec!["none"]);
        assert_eq!(get(ENV_SIDECAR_PORT), vec!["39741"]);
    }

    #[test]
    fn inherited_env_is_not_overridden() {
        let config = SidecarConfig::default();
        let env = worker_env(&config, |key| key == ENV_TOOLS_ENABLED);
        assert!(env.iter().all(|(k, _)| k != ENV_TOOLS_ENABLED));
        assert!(env.iter().any(|(k, v)| k == "NODE_NO_WARNINGS" && v == "1"));
    }

    #[tokio::test]
    async fn concurrent_starts_spawn_once() {
        let h = harness();
        let (a, b) = tokio::join!(
            h.lifecycle.start_if_needed(),
            h.lifecycle.start_if_needed()
        );
        assert_eq!(h.backend.spawn_count(), 1);
        let spawned = [&a, &b]
            .iter()
            .filter(|o| matches!(o, StartOutcome::Spawned { .. }))
            .count();
        assert_eq!(spawned, 1);
        assert!(a.is_serving() && b.is_serving());
    }

    #[tokio::test]
    async fn stale_listener_running_our_script_is_reaped() {
        let h = harness();
        {
            let mut listeners = h.ports.listeners.lock();
            listeners.push(ListenerProcess {
                pid: 4242,
                command: format!("node {}", h.script.display()),
            });
            listeners.push(ListenerProcess {
                pid: 5353,
                command: "python -m http.server 39741".to_string(),
            });
        }

        h.lifecycle.start_if_needed().await;
        assert_eq!(*h.ports.terminated.lock(), vec![4242]);
        assert_eq!(h.backend.spawn_count(), 1);
    }

    #[tokio::test]
    async fn crash_returns_to_not_started_and_stop_to_stopped() {
        let h = harness();
        let StartOutcome::Spawned { pid } = h.lifecycle.start_if_needed().await else {
            panic!("expected spawn");
        };
        h.backend.crash(pid, 1);
        for _ in 0..50 {
            if h.lifecycle.state() == SidecarState::NotStarted {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(h.lifecycle.state(), SidecarState::NotStarted);

        let StartOutcome::Spawned { pid: second } = h.lifecycle.start_if_needed().await else {
            panic!("expected respawn");
        };
        assert_ne!(pid, second);
        assert_eq!(h.lifecycle.stop().await, Some(second));
        assert_eq!(h.lifecycle.state(), SidecarState::Stopped);
        assert_eq!(h.lifecycle.snapshot().spawn_count, 2);
    }

    #[tokio::test]
    async fn restart_replaces_the_tracked_worker() {
        let h = harness();
        let StartOutcome::Spawned { pid: first } = h.lifecycle.start_if_needed().await else {
            panic!("expected spawn");
        };
        let StartOutcome::Spawned { pid: second } = h.lifecycle.restart().await else {
            panic!("expected respawn");
        };
        assert_ne!(first, second);
        assert_eq!(*h.backend.terminated.lock(), vec![first]);
        assert_eq!(h.lifecycle.snapshot().pid, Some(second));
    }

    #[tokio::test]
    async fn worker_output_reaches_ring_buffer() {
        let h = harness();
        let StartOutcome::Spawned { pid } = h.lifecycle.start_if_needed().await else {
            panic!("expected spawn");
        };
        h.backend.emit(pid, "listening on 39741\n");
        for _ in 0..50 {
            if !h.lifecycle.logs_snapshot(10).0.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let (lines, dropped) = h.lifecycle.logs_snapshot(10);
        assert_eq!(lines[0].text, "listening on 39741");
        assert_eq!(dropped, 0);
        assert!(h.lifecycle.logs_since(lines[0].seq).0.is_empty());
    }
}
