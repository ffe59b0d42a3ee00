// Copilot Proxy GUI - Proxy worker supervision
// Spawns the proxy worker, captures its output and reports exits back to the state broadcaster

use crate::config::env;
use crate::credential::CredentialStore;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Lines kept from the worker's output
pub const LOG_CAPACITY: usize = 500;
/// Start argument carrying the credential to the worker
pub const TOKEN_FLAG: &str = "--github-token";
/// How long an exit waits for the output readers to drain
const READER_DRAIN: Duration = Duration::from_millis(500);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("proxy worker not found at: {0}. Reinstall the app or rebuild the bundled server.")]
    WorkerMissing(PathBuf),
    #[error("bun not found in PATH or ~/.bun/bin; it is required to run the proxy from source")]
    RuntimeMissing,
    #[error("failed to spawn proxy worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("proxy worker lookup did not finish: {0}")]
    Lookup(#[from] tokio::task::JoinError),
}

/// What the supervisor reports to whoever owns the service state.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Started { pid: u32, model_name: String },
    /// A user or tray initiated stop.
    Stopped,
    /// The worker exited. `unexpected` is false when the exit follows `stop()`
    /// or belongs to an earlier run.
    Exited { code: Option<i32>, unexpected: bool },
    SpawnFailed { error: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub pid: u32,
    pub already_running: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StopOutcome {
    pub ok: bool,
    pub message: String,
}

/// Bounded FIFO of output lines; the oldest line is dropped first.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Output of one run; lines from any other run are discarded.
struct RunLog {
    generation: u64,
    buffer: LogBuffer,
}

#[derive(Clone)]
struct SharedLog(Arc<std::sync::Mutex<RunLog>>);

impl SharedLog {
    fn new() -> Self {
        Self(Arc::new(std::sync::Mutex::new(RunLog {
            generation: 0,
            buffer: LogBuffer::new(LOG_CAPACITY),
        })))
    }

    fn with<T>(&self, f: impl FnOnce(&mut RunLog) -> T) -> T {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    fn reset(&self, generation: u64) {
        self.with(|log| {
            log.generation = generation;
            log.buffer = LogBuffer::new(LOG_CAPACITY);
        });
    }

    fn push(&self, generation: u64, line: String) {
        self.with(|log| {
            if log.generation == generation {
                log.buffer.push(line);
            }
        });
    }

    fn snapshot(&self) -> Vec<String> {
        self.with(|log| log.buffer.snapshot())
    }
}

/// Platform strategy for ending the worker.
pub trait ProcessTerminator: Send + Sync {
    fn terminate(&self, pid: u32) -> std::io::Result<()>;
}

/// Signals do not reach grandchildren on Windows, so the whole tree is killed.
#[cfg(windows)]
pub struct TreeKill;

#[cfg(windows)]
impl ProcessTerminator for TreeKill {
    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        use std::os::windows::process::CommandExt;

        let status = std::process::Command::new("taskkill")
            .args(["/pid", &pid.to_string(), "/T", "/F"])
            .creation_flags(CREATE_NO_WINDOW)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!("taskkill exited with {}", status)))
        }
    }
}

/// Graceful SIGTERM to the worker itself.
#[cfg(unix)]
pub struct SigTerm;

#[cfg(unix)]
impl ProcessTerminator for SigTerm {
    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| std::io::Error::other(format!("pid {} out of range", pid)))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

pub fn platform_terminator() -> Arc<dyn ProcessTerminator> {
    #[cfg(windows)]
    {
        Arc::new(TreeKill)
    }
    #[cfg(unix)]
    {
        Arc::new(SigTerm)
    }
}

/// Program, fixed leading arguments and working directory of the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub prefix_args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    fn build(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args).args(args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }
}

/// Finds the worker at start time; a missing worker is reported, not retried.
pub trait WorkerResolver: Send + Sync {
    fn resolve(&self) -> Result<WorkerCommand, SupervisorError>;
}

#[cfg(windows)]
const BUNDLED_WORKER: &str = "copilot-proxy-server.exe";
#[cfg(not(windows))]
const BUNDLED_WORKER: &str = "copilot-proxy-server";

/// Bundled server binary in production, `bun run src/main.ts` from a source tree in development.
pub struct ProxyWorkerResolver {
    resource_dir: PathBuf,
    search_from: PathBuf,
}

impl ProxyWorkerResolver {
    pub fn new(resource_dir: PathBuf, search_from: PathBuf) -> Self {
        Self {
            resource_dir,
            search_from,
        }
    }
}

impl WorkerResolver for ProxyWorkerResolver {
    fn resolve(&self) -> Result<WorkerCommand, SupervisorError> {
        if let Some(explicit) = std::env::var_os(env::WORKER).map(PathBuf::from) {
            if !explicit.exists() {
                return Err(SupervisorError::WorkerMissing(explicit));
            }
            return Ok(WorkerCommand {
                program: explicit,
                prefix_args: Vec::new(),
                cwd: None,
            });
        }

        let bundled = self.resource_dir.join(BUNDLED_WORKER);
        if bundled.exists() {
            tracing::info!("Using bundled proxy worker: {:?}", bundled);
            return Ok(WorkerCommand {
                program: bundled,
                prefix_args: Vec::new(),
                cwd: None,
            });
        }

        let repo_root = std::env::var_os(env::REPO)
            .map(PathBuf::from)
            .filter(|p| p.join("src").join("main.ts").exists())
            .or_else(|| find_repo_root(&self.search_from));
        let Some(repo_root) = repo_root else {
            return Err(SupervisorError::WorkerMissing(bundled));
        };

        let bun = resolve_bun().ok_or(SupervisorError::RuntimeMissing)?;
        tracing::info!("Using proxy source tree {:?} with {:?}", repo_root, bun);
        Ok(WorkerCommand {
            program: bun,
            prefix_args: vec!["run".to_string(), "src/main.ts".to_string()],
            cwd: Some(repo_root),
        })
    }
}

/// Nearest ancestor holding the proxy sources, either as a `copilot-proxy/`
/// checkout or as the monorepo root itself.
pub fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start.ancestors().find_map(|dir| {
        let submodule = dir.join("copilot-proxy");
        if submodule.join("src").join("main.ts").exists() {
            Some(submodule)
        } else if dir.join("src").join("main.ts").exists() {
            Some(dir.to_path_buf())
        } else {
            None
        }
    })
}

fn resolve_bun() -> Option<PathBuf> {
    let mut candidates = vec![PathBuf::from("bun")];
    if let Some(home) = std::env::var_os("USERPROFILE").or_else(|| std::env::var_os("HOME")) {
        let bin = PathBuf::from(home).join(".bun").join("bin");
        candidates.push(bin.join("bun.exe"));
        candidates.push(bin.join("bun"));
    }
    candidates.into_iter().find(|candidate| {
        std::process::Command::new(candidate)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// Appends the credential unless the caller already passed one.
pub fn inject_token(args: &mut Vec<String>, token: &str) {
    if !token.is_empty() && !args.iter().any(|a| a == TOKEN_FLAG) {
        args.push(TOKEN_FLAG.to_string());
        args.push(token.to_string());
    }
}

struct Supervised {
    pid: u32,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Owns at most one running worker.
pub struct Supervisor {
    credentials: Arc<CredentialStore>,
    resolver: Arc<dyn WorkerResolver>,
    terminator: Arc<dyn ProcessTerminator>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    child: Arc<Mutex<Option<Supervised>>>,
    logs: SharedLog,
    generation: AtomicU64,
}

impl Supervisor {
    pub fn new(
        credentials: Arc<CredentialStore>,
        resolver: Arc<dyn WorkerResolver>,
        terminator: Arc<dyn ProcessTerminator>,
        events: mpsc::UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            credentials,
            resolver,
            terminator,
            events,
            child: Arc::new(Mutex::new(None)),
            logs: SharedLog::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Starts the worker unless one is already supervised.
    pub async fn start(
        &self,
        args: Vec<String>,
        model_name: &str,
    ) -> Result<StartOutcome, SupervisorError> {
        let mut guard = self.child.lock().await;
        if let Some(current) = guard.as_ref() {
            return Ok(StartOutcome {
                pid: current.pid,
                already_running: true,
            });
        }

        let mut args = args;
        let token = self.credentials.read_with_migration().unwrap_or_else(|e| {
            tracing::warn!("Could not read GitHub token: {}", e);
            String::new()
        });
        tracing::info!(
            "GitHub token: {}",
            if token.is_empty() { "not set" } else { "configured" }
        );
        inject_token(&mut args, &token);

        // Resolution may probe for bun, which blocks.
        let resolver = self.resolver.clone();
        let command = tokio::task::spawn_blocking(move || resolver.resolve())
            .await
            .map_err(SupervisorError::from)
            .and_then(|resolved| resolved)
            .map_err(|e| self.spawn_failed(e))?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.logs.reset(generation);

        let mut child = command.build(&args).spawn().map_err(|e| self.spawn_failed(e.into()))?;
        let pid = child.id().unwrap_or_default();
        tracing::info!("Proxy worker started with PID: {}", pid);

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, self.logs.clone(), generation));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, self.logs.clone(), generation));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *guard = Some(Supervised {
            pid,
            generation,
            kill_tx: Some(kill_tx),
        });
        drop(guard);

        // Announced before the watcher exists so an early exit cannot overtake it.
        self.emit(SupervisorEvent::Started {
            pid,
            model_name: model_name.to_string(),
        });
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            readers,
            generation,
            self.child.clone(),
            self.logs.clone(),
            self.events.clone(),
        ));
        Ok(StartOutcome {
            pid,
            already_running: false,
        })
    }

    /// Stops the supervised worker. Termination failures are logged, never returned.
    pub async fn stop(&self) -> StopOutcome {
        // Cleared before terminating so the exit watcher sees a user stop.
        let taken = self.child.lock().await.take();
        let Some(mut supervised) = taken else {
            return StopOutcome {
                ok: true,
                message: "service was not running".to_string(),
            };
        };

        tracing::info!("Stopping proxy worker (PID: {})...", supervised.pid);
        if let Err(e) = self.terminator.terminate(supervised.pid) {
            tracing::warn!("Terminating PID {} failed, killing directly: {}", supervised.pid, e);
            if let Some(kill) = supervised.kill_tx.take() {
                let _ = kill.send(());
            }
        }
        self.emit(SupervisorEvent::Stopped);
        StopOutcome {
            ok: true,
            message: "service stopped".to_string(),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Snapshot of the current run's output.
    pub fn logs(&self) -> Vec<String> {
        self.logs.snapshot()
    }

    fn spawn_failed(&self, error: SupervisorError) -> SupervisorError {
        tracing::error!("Failed to start proxy worker: {}", error);
        self.emit(SupervisorEvent::SpawnFailed {
            error: error.to_string(),
        });
        error
    }

    fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("No listener for supervisor events");
        }
    }
}

fn spawn_reader<R>(stream: R, logs: SharedLog, generation: u64) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\r', '\n']);
                    if !line.is_empty() {
                        logs.push(generation, line.to_string());
                    }
                }
                Err(e) => {
                    tracing::debug!("Worker output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

async fn watch_exit(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    generation: u64,
    slot: Arc<Mutex<Option<Supervised>>>,
    logs: SharedLog,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        signal = &mut kill_rx => {
            if signal.is_ok() {
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Direct kill failed: {}", e);
                }
            }
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!("Waiting on proxy worker failed: {}", e);
            None
        }
    };

    let deadline = tokio::time::Instant::now() + READER_DRAIN;
    for reader in readers {
        let _ = tokio::time::timeout_at(deadline, reader).await;
    }

    let rendered = code.map_or_else(|| "null".to_string(), |c| c.to_string());
    logs.push(generation, format!("[process exited with code {}]", rendered));

    let unexpected = {
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            Some(current) if current.generation == generation => {
                guard.take();
                true
            }
            _ => false,
        }
    };
    if unexpected {
        tracing::warn!("Proxy worker stopped unexpectedly (code {})", rendered);
    } else {
        tracing::info!("Proxy worker exited (code {})", rendered);
    }
    let _ = events.send(SupervisorEvent::Exited { code, unexpected });
}
