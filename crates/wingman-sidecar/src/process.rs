// Sidecar process supervision
// Owns the single worker process handle: spawn, output draining, exit watching, stop.

use crate::error::{Result, SidecarError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot, Notify};

/// Upper bound on how long `start` waits for a previous process's exit to be
/// processed before spawning a replacement.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a force-killed process gets to be reaped before we stop waiting on it.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Everything needed to spawn the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

/// The tracked process. Deliberately neither `Clone` nor `Copy`.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    spec: LaunchSpec,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Exited,
    Signaled,
    WaitFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub reason: TerminationReason,
    /// Exit code for `Exited`, signal number for `Signaled`.
    pub status: Option<i32>,
}

impl ExitInfo {
    pub fn exited(code: i32) -> Self {
        Self {
            reason: TerminationReason::Exited,
            status: Some(code),
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            reason: TerminationReason::Signaled,
            status: Some(signal),
        }
    }

    pub fn wait_failed() -> Self {
        Self {
            reason: TerminationReason::WaitFailed,
            status: None,
        }
    }

    fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::signaled(signal);
            }
        }
        Self {
            reason: TerminationReason::Exited,
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationRecord {
    pub reason: TerminationReason,
    pub exit_status: Option<i32>,
    pub pid: u32,
    /// True iff `stop()` asked for this exit before the OS reported it.
    pub intentional: bool,
}

/// What a backend hands back for a freshly spawned process.
pub struct SpawnedProcess {
    pub pid: u32,
    /// Merged stdout/stderr chunks, roughly one per line.
    pub output: mpsc::UnboundedReceiver<String>,
    /// Resolves once the OS reports the process gone.
    pub exit: BoxFuture<'static, ExitInfo>,
}

/// OS-level process operations, swappable for tests.
pub trait ProcessBackend: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess>;

    /// Graceful termination request (SIGTERM on Unix).
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Uncatchable kill (SIGKILL on Unix). Used once `terminate` went unanswered.
    fn kill(&self, pid: u32) -> io::Result<()> {
        self.terminate(pid)
    }

    fn is_alive(&self, pid: u32) -> bool;
}

/// Caller's view of a spawned process: an output feed and a completion future.
pub struct ProcessSession {
    pub pid: u32,
    pub output: mpsc::UnboundedReceiver<String>,
    pub termination: oneshot::Receiver<TerminationRecord>,
}

struct Tracked {
    handle: ProcessHandle,
    exited: Arc<AtomicBool>,
}

#[derive(Default)]
struct SupervisorState {
    tracked: Option<Tracked>,
    /// Pids we asked to terminate; consumed by the exit watcher.
    intentional: HashSet<u32>,
    /// Spawned pids whose exit has not been processed yet.
    pending_exits: HashSet<u32>,
}

pub struct ProcessSupervisor {
    backend: Arc<dyn ProcessBackend>,
    state: Arc<Mutex<SupervisorState>>,
    exit_processed: Arc<Notify>,
    exit_drain: Duration,
}

impl ProcessSupervisor {
    pub fn new(backend: Arc<dyn ProcessBackend>) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(SupervisorState::default())),
            exit_processed: Arc::new(Notify::new()),
            exit_drain: EXIT_DRAIN_TIMEOUT,
        }
    }

    /// How long `start` waits on a previous exit before force-killing it.
    pub fn with_exit_drain_timeout(mut self, timeout: Duration) -> Self {
        self.exit_drain = timeout;
        self
    }

    pub fn with_tokio_backend() -> Self {
        Self::new(Arc::new(TokioProcessBackend))
    }

    pub fn backend(&self) -> Arc<dyn ProcessBackend> {
        self.backend.clone()
    }

    /// Spawns the worker if nothing is tracked. Output chunks are trimmed and
    /// empty ones dropped before they reach `ProcessSession::output`.
    pub async fn start(&self, spec: LaunchSpec) -> Result<ProcessSession> {
        if let Some(pid) = self.tracked_pid() {
            return Err(SidecarError::AlreadyRunning(pid));
        }

        // A pid must not be reused before its previous exit has been recorded.
        self.wait_for_pending_exits(self.exit_drain).await;

        let mut state = self.state.lock();
        if let Some(tracked) = state.tracked.as_ref() {
            return Err(SidecarError::AlreadyRunning(tracked.handle.pid));
        }

        let spawned = self.backend.spawn(&spec).map_err(|e| {
            SidecarError::Spawn(format!("{}: {}", spec.executable.display(), e))
        })?;
        let SpawnedProcess {
            pid,
            output: mut raw_output,
            exit,
        } = spawned;

        let exited = Arc::new(AtomicBool::new(false));
        state.tracked = Some(Tracked {
            handle: ProcessHandle { pid, spec },
            exited: exited.clone(),
        });
        state.pending_exits.insert(pid);
        drop(state);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            // Keep draining even when nobody listens so the child never blocks on a full pipe.
            while let Some(chunk) = raw_output.recv().await {
                let trimmed = chunk.trim();
                if !trimmed.is_empty() {
                    let _ = line_tx.send(trimmed.to_string());
                }
            }
        });

        let (term_tx, term_rx) = oneshot::channel();
        let state = self.state.clone();
        let exit_processed = self.exit_processed.clone();
        tokio::spawn(async move {
            let info = exit.await;
            exited.store(true, Ordering::SeqCst);
            let record = {
                let mut state = state.lock();
                let intentional = state.intentional.remove(&pid);
                if state.tracked.as_ref().map(|t| t.handle.pid) == Some(pid) {
                    state.tracked = None;
                }
                state.pending_exits.remove(&pid);
                TerminationRecord {
                    reason: info.reason,
                    exit_status: info.status,
                    pid,
                    intentional,
                }
            };
            exit_processed.notify_waiters();
            tracing::debug!(
                "Sidecar pid {} terminated: {:?} status={:?} intentional={}",
                pid,
                record.reason,
                record.exit_status,
                record.intentional
            );
            let _ = term_tx.send(record);
        });

        Ok(ProcessSession {
            pid,
            output: line_rx,
            termination: term_rx,
        })
    }

    /// Marks the tracked pid as intentional, signals it and forgets the handle.
    /// Returns the pid that was signalled, `None` when nothing was tracked.
    pub fn stop(&self) -> Option<u32> {
        let mut state = self.state.lock();
        let tracked = state.tracked.take()?;
        let pid = tracked.handle.pid;
        if tracked.exited.load(Ordering::SeqCst) {
            return Some(pid);
        }
        state.intentional.insert(pid);
        drop(state);

        tracing::info!("Terminating sidecar process with PID {}", pid);
        if let Err(e) = self.backend.terminate(pid) {
            tracing::warn!("Failed to signal sidecar PID {}: {}", pid, e);
        }
        Some(pid)
    }

    pub fn tracked_pid(&self) -> Option<u32> {
        self.state.lock().tracked.as_ref().map(|t| t.handle.pid)
    }

    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        match state.tracked.as_ref() {
            Some(tracked) => {
                !tracked.exited.load(Ordering::SeqCst) && self.backend.is_alive(tracked.handle.pid)
            }
            None => false,
        }
    }

    /// A handle is stale when its process is gone but the exit watcher has not
    /// cleared it yet.
    pub fn has_stale_handle(&self) -> bool {
        let state = self.state.lock();
        state.tracked.as_ref().is_some_and(|tracked| {
            tracked.exited.load(Ordering::SeqCst) || !self.backend.is_alive(tracked.handle.pid)
        })
    }

    /// Drops a stale handle. The termination record still fires once the exit
    /// watcher observes the exit.
    pub fn clear_stale_handle(&self) -> bool {
        if !self.has_stale_handle() {
            return false;
        }
        let mut state = self.state.lock();
        if let Some(tracked) = state.tracked.take() {
            tracing::warn!(
                "Reaping stale sidecar handle for PID {}",
                tracked.handle.pid
            );
        }
        true
    }

    /// Waits (bounded) until every exit we know about has been recorded.
    ///
    /// Processes we asked to stop that are still alive at the deadline get
    /// killed. Anything still unrecorded after that is forgotten, so a single
    /// stuck exit costs one timeout rather than one per `start`.
    pub async fn wait_for_pending_exits(&self, timeout: Duration) {
        if self.drain_pending_exits(timeout).await {
            return;
        }

        let stubborn: Vec<u32> = {
            let state = self.state.lock();
            state
                .pending_exits
                .iter()
                .copied()
                .filter(|pid| state.intentional.contains(pid) && self.backend.is_alive(*pid))
                .collect()
        };
        for pid in &stubborn {
            tracing::warn!(
                "Sidecar PID {} ignored termination for {:?}; killing it",
                pid,
                timeout
            );
            if let Err(e) = self.backend.kill(*pid) {
                tracing::warn!("Failed to kill sidecar PID {}: {}", pid, e);
            }
        }
        if !stubborn.is_empty() && self.drain_pending_exits(KILL_GRACE).await {
            return;
        }

        let abandoned: Vec<u32> = self.state.lock().pending_exits.drain().collect();
        if !abandoned.is_empty() {
            tracing::warn!(
                "Sidecar exit(s) for PID(s) {:?} still unprocessed; starting anyway",
                abandoned
            );
        }
    }

    /// True once nothing is pending, false if `timeout` elapsed first.
    async fn drain_pending_exits(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.exit_processed.notified();
            if self.state.lock().pending_exits.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state.lock().pending_exits.is_empty();
            }
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        let tracked = self.state.lock().tracked.take();
        if let Some(tracked) = tracked {
            if !tracked.exited.load(Ordering::SeqCst) {
                tracing::info!("Terminating sidecar PID {} on drop", tracked.handle.pid);
                if let Err(e) = self.backend.terminate(tracked.handle.pid) {
                    tracing::warn!(
                        "Failed to signal sidecar PID {} on drop: {}",
                        tracked.handle.pid,
                        e
                    );
                }
            }
        }
    }
}

// ============================================================================
// Tokio backend
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessBackend;

impl ProcessBackend for TokioProcessBackend {
    fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
        let mut cmd = tokio::process::Command::new(&spec.executable);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Hide console window on Windows
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned process has no pid"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, tx);
        }

        let exit = async move {
            match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(e) => {
                    tracing::warn!("Failed to wait on sidecar process: {}", e);
                    ExitInfo::wait_failed()
                }
            }
        }
        .boxed();

        Ok(SpawnedProcess {
            pid,
            output: rx,
            exit,
        })
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        terminate_pid(pid)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        kill_pid(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        pid_is_alive(pid)
    }
}

fn pump_output<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
                }
            }
        }
    });
}

#[cfg(unix)]
pub(crate) fn terminate_pid(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(unix)]
pub(crate) fn kill_pid(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

// taskkill /F is already forceful.
#[cfg(windows)]
pub(crate) fn kill_pid(pid: u32) -> io::Result<()> {
    terminate_pid(pid)
}

#[cfg(windows)]
pub(crate) fn terminate_pid(pid: u32) -> io::Result<()> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    let output = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

#[cfg(unix)]
pub(crate) fn pid_is_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub(crate) fn pid_is_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    struct FakeChild {
        output: mpsc::UnboundedSender<String>,
        exit: Option<oneshot::Sender<ExitInfo>>,
        alive: bool,
    }

    /// In-memory backend: `terminate` and `crash` resolve the exit future.
    #[derive(Default)]
    pub struct FakeBackend {
        next_pid: AtomicU32,
        children: parking_lot::Mutex<HashMap<u32, FakeChild>>,
        pub spawned: parking_lot::Mutex<Vec<LaunchSpec>>,
        pub terminated: parking_lot::Mutex<Vec<u32>>,
        pub killed: parking_lot::Mutex<Vec<u32>>,
        pub fail_spawn: AtomicBool,
        /// Children shrug off `terminate`, like a worker that traps SIGTERM.
        pub ignore_terminate: AtomicBool,
    }

    impl FakeBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                next_pid: AtomicU32::new(1000),
                ..Default::default()
            })
        }

        pub fn spawn_count(&self) -> usize {
            self.spawned.lock().len()
        }

        pub fn emit(&self, pid: u32, chunk: &str) {
            if let Some(child) = self.children.lock().get(&pid) {
                let _ = child.output.send(chunk.to_string());
            }
        }

        /// Unexpected exit reported by the "OS".
        pub fn crash(&self, pid: u32, code: i32) {
            let mut children = self.children.lock();
            if let Some(child) = children.get_mut(&pid) {
                child.alive = false;
                if let Some(exit) = child.exit.take() {
                    let _ = exit.send(ExitInfo::exited(code));
                }
            }
        }

        fn deliver(&self, pid: u32, info: ExitInfo) -> io::Result<()> {
            let mut children = self.children.lock();
            let child = children
                .get_mut(&pid)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))?;
            child.alive = false;
            if let Some(exit) = child.exit.take() {
                let _ = exit.send(info);
            }
            Ok(())
        }

        /// The "OS" loses track of the child; signalling it fails afterwards.
        pub fn forget(&self, pid: u32) {
            self.children.lock().remove(&pid);
        }

        /// Process dies but its exit has not been delivered yet.
        pub fn die_silently(&self, pid: u32) {
            if let Some(child) = self.children.lock().get_mut(&pid) {
                child.alive = false;
            }
        }
    }

    impl ProcessBackend for FakeBackend {
        fn spawn(&self, spec: &LaunchSpec) -> io::Result<SpawnedProcess> {
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            let (output_tx, output_rx) = mpsc::unbounded_channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            self.children.lock().insert(
                pid,
                FakeChild {
                    output: output_tx,
                    exit: Some(exit_tx),
                    alive: true,
                },
            );
            self.spawned.lock().push(spec.clone());
            Ok(SpawnedProcess {
                pid,
                output: output_rx,
                exit: async move { exit_rx.await.unwrap_or_else(|_| ExitInfo::wait_failed()) }
                    .boxed(),
            })
        }

        fn terminate(&self, pid: u32) -> io::Result<()> {
            self.terminated.lock().push(pid);
            if self.ignore_terminate.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.deliver(pid, ExitInfo::signaled(15))
        }

        fn kill(&self, pid: u32) -> io::Result<()> {
            self.killed.lock().push(pid);
            self.deliver(pid, ExitInfo::signaled(9))
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.children.lock().get(&pid).is_some_and(|c| c.alive)
        }
    }

    pub fn spec(name: &str) -> LaunchSpec {
        LaunchSpec {
            executable: PathBuf::from("/usr/bin/node"),
            args: vec![name.to_string()],
            working_dir: None,
            env: Vec::new(),
        }
    }
}
