//! Worker process supervision.
//!
//! A `Supervisor` owns one worker process at a time:
//! - spawning it with all three standard streams piped
//! - a single writer task that owns the worker's stdin
//! - line readers for stdout (to the multiplexer) and stderr (to metadata and logs)
//! - exit detection, mass rejection of pending requests, and respawn
//!
//! State machine:
//! STOPPED -> STARTING -> RUNNING -> CRASHED -> STARTING ... | FAILED | SHUTDOWN

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::defaults;
use crate::engine::exit::describe_exit;
use crate::engine::metadata::{EngineMetadata, MetadataStore};
use crate::engine::spec::WorkerSpec;
use crate::error::{Error, Result};
use crate::ipc::codec::WireProtocol;
use crate::ipc::multiplexer::{LineWriter, Multiplexer, MultiplexerStats};

/// How long the exit watcher waits for stdout to drain before failing requests.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Consecutive crashes between two crash-loop warnings.
const CRASH_LOOP_WARN_EVERY: u32 = 5;

/// When and whether to restart a worker after it exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespawnPolicy {
    /// Delay before the first restart after a crash
    #[serde(default = "defaults::respawn_delay_ms")]
    pub delay_ms: u64,
    /// Growth factor applied per consecutive crash; 1.0 keeps the delay fixed
    #[serde(default = "defaults::respawn_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound for the grown delay
    #[serde(default = "defaults::respawn_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Stop restarting after this many consecutive crashes; unbounded when absent
    #[serde(default)]
    pub max_consecutive_crashes: Option<u32>,
    /// Uptime after which a worker counts as stable and the crash count resets
    #[serde(default = "defaults::stable_after_ms")]
    pub stable_after_ms: u64,
}

impl Default for RespawnPolicy {
    fn default() -> Self {
        Self {
            delay_ms: defaults::RESPAWN_DELAY_MS,
            backoff_factor: defaults::RESPAWN_BACKOFF_FACTOR,
            max_delay_ms: defaults::RESPAWN_MAX_DELAY_MS,
            max_consecutive_crashes: None,
            stable_after_ms: defaults::STABLE_AFTER_MS,
        }
    }
}

impl RespawnPolicy {
    /// Delay before restarting after `consecutive` crashes in a row (1-based).
    pub fn delay_for(&self, consecutive: u32) -> Duration {
        let exponent = consecutive.saturating_sub(1).min(32) as i32;
        let factor = if self.backoff_factor.is_finite() {
            self.backoff_factor.max(1.0)
        } else {
            1.0
        };
        let cap = self.max_delay_ms.max(self.delay_ms) as f64;
        let ms = (self.delay_ms as f64 * factor.powi(exponent)).min(cap);
        Duration::from_millis(ms as u64)
    }

    fn gives_up_after(&self, consecutive: u32) -> bool {
        matches!(self.max_consecutive_crashes, Some(max) if consecutive > max)
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Never started
    Stopped,
    /// Spawn in progress
    Starting,
    /// Process alive and accepting requests
    Running,
    /// Process exited; a respawn is scheduled
    Crashed,
    /// Could not start, or gave up restarting; needs a manual `start`
    Failed,
    /// Shut down for good
    ShutDown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "STOPPED"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Crashed => write!(f, "CRASHED"),
            Self::Failed => write!(f, "FAILED"),
            Self::ShutDown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Point-in-time view of one engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub name: String,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub generation: u64,
    pub restarts: u64,
    pub consecutive_crashes: u32,
    pub last_exit: Option<String>,
    pub requests: MultiplexerStats,
    pub metadata: EngineMetadata,
}

/// Runtime state of one spawned process. Present only while it is alive.
struct WorkerHandle {
    generation: u64,
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<String>,
    kill: Option<oneshot::Sender<()>>,
    started_at: Instant,
}

struct Runtime {
    state: WorkerState,
    handle: Option<WorkerHandle>,
    generation: u64,
    restarts: u64,
    consecutive_crashes: u32,
    last_exit: Option<String>,
    exit_watcher: Option<JoinHandle<()>>,
}

struct Shared {
    spec: WorkerSpec,
    policy: RespawnPolicy,
    mux: Arc<Multiplexer>,
    metadata: Arc<MetadataStore>,
    runtime: Mutex<Runtime>,
    shutdown: AtomicBool,
}

/// Owns the lifecycle of one named worker process.
///
/// Cloning is cheap; all clones supervise the same worker.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        spec: WorkerSpec,
        policy: RespawnPolicy,
        wire: WireProtocol,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        let mux = Arc::new(Multiplexer::new(spec.name.clone(), wire));
        Self {
            shared: Arc::new(Shared {
                spec,
                policy,
                mux,
                metadata,
                runtime: Mutex::new(Runtime {
                    state: WorkerState::Stopped,
                    handle: None,
                    generation: 0,
                    restarts: 0,
                    consecutive_crashes: 0,
                    last_exit: None,
                    exit_watcher: None,
                }),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.spec.name
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.shared.spec
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.shared.mux
    }

    pub fn state(&self) -> WorkerState {
        self.shared.runtime().state
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared.runtime().handle.as_ref().and_then(|h| h.pid)
    }

    pub fn is_alive(&self) -> bool {
        self.shared.runtime().handle.is_some()
    }

    /// Spawn the worker.
    ///
    /// Must be called from within a tokio runtime. Returns immediately once the
    /// process is spawned; it does not wait for the worker to finish loading.
    /// A no-op if the worker is already running.
    pub fn start(&self) -> Result<()> {
        let shared = &self.shared;
        let name = shared.spec.name.clone();

        {
            let mut runtime = shared.runtime();
            if shared.is_shut_down() {
                return Err(Error::ShutDown(name));
            }
            if runtime.handle.is_some() || runtime.state == WorkerState::Starting {
                return Ok(());
            }
            // Leaving FAILED is a manual restart with a fresh crash budget.
            if runtime.state == WorkerState::Failed {
                runtime.consecutive_crashes = 0;
            }
            runtime.state = WorkerState::Starting;
        }

        if let Err(e) = shared.spec.validate() {
            shared.runtime().state = WorkerState::Failed;
            return Err(e);
        }

        let mut child = match shared.spec.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                shared.runtime().state = WorkerState::Failed;
                return Err(Error::Spawn {
                    engine: name,
                    source,
                });
            }
        };

        let pid = child.id();
        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                shared.runtime().state = WorkerState::Failed;
                return Err(Error::Spawn {
                    engine: name,
                    source: std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "worker standard streams were not captured",
                    ),
                });
            }
        };

        let mut runtime = shared.runtime();
        if shared.is_shut_down() {
            // Shutdown raced the spawn; dropping the child kills it.
            runtime.state = WorkerState::ShutDown;
            return Err(Error::ShutDown(name));
        }

        runtime.generation += 1;
        let generation = runtime.generation;
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        tokio::spawn(write_loop(name.clone(), stdin, stdin_rx));
        let stdout_reader = {
            let mux = Arc::clone(&shared.mux);
            tokio::spawn(read_lines(stdout, move |line| {
                mux.on_line(line);
            }))
        };
        {
            let metadata = Arc::clone(&shared.metadata);
            let name = name.clone();
            tokio::spawn(read_lines(stderr, move |line| {
                let line = line.trim();
                if line.is_empty() {
                    return;
                }
                log::debug!("[{}] {}", name, line);
                metadata.observe(&name, line);
            }));
        }
        let watcher = tokio::spawn(watch_exit(
            Arc::clone(shared),
            child,
            kill_rx,
            stdout_reader,
            generation,
        ));

        runtime.handle = Some(WorkerHandle {
            generation,
            pid,
            stdin: stdin_tx,
            kill: Some(kill_tx),
            started_at: Instant::now(),
        });
        runtime.exit_watcher = Some(watcher);
        runtime.state = WorkerState::Running;
        if generation > 1 {
            runtime.restarts += 1;
        }

        log::info!(
            "[spawned] {} -> {} (pid {}, generation {})",
            name,
            shared.spec.executable.display(),
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            generation
        );
        Ok(())
    }

    /// Send a request to this worker and wait for its final response.
    pub async fn request(&self, payload: Value, timeout: Duration) -> Result<Value> {
        self.shared.mux.send(self, payload, timeout).await
    }

    /// Kill the worker and suppress any further respawn.
    ///
    /// Waits up to `grace` for the exit to be observed, so that every pending
    /// request has been rejected by the time this returns.
    pub async fn shutdown(&self, grace: Duration) {
        let (kill, watcher) = {
            let mut runtime = self.shared.runtime();
            self.shared.shutdown.store(true, Ordering::SeqCst);
            let kill = runtime.handle.as_mut().and_then(|h| h.kill.take());
            (kill, runtime.exit_watcher.take())
        };

        if let Some(kill) = kill {
            log::info!("[{}] shutting down worker", self.name());
            let _ = kill.send(());
        }
        if let Some(watcher) = watcher {
            if tokio::time::timeout(grace, watcher).await.is_err() {
                log::warn!("[{}] worker exit not observed within {:?}", self.name(), grace);
            }
        }

        let mut runtime = self.shared.runtime();
        runtime.handle = None;
        runtime.state = WorkerState::ShutDown;
        drop(runtime);

        self.shared.mux.fail_all(|_| Error::ShutDown(self.name().to_string()));
    }

    pub fn status(&self) -> EngineStatus {
        let runtime = self.shared.runtime();
        EngineStatus {
            name: self.shared.spec.name.clone(),
            state: runtime.state,
            pid: runtime.handle.as_ref().and_then(|h| h.pid),
            generation: runtime.generation,
            restarts: runtime.restarts,
            consecutive_crashes: runtime.consecutive_crashes,
            last_exit: runtime.last_exit.clone(),
            requests: self.shared.mux.stats(),
            metadata: self.shared.metadata.get(&self.shared.spec.name),
        }
    }
}

impl LineWriter for Supervisor {
    fn write_line(&self, line: String) -> Result<()> {
        let runtime = self.shared.runtime();
        match &runtime.handle {
            Some(handle) => handle
                .stdin
                .send(line)
                .map_err(|_| Error::WorkerUnavailable(self.shared.spec.name.clone())),
            None if self.shared.is_shut_down() => Err(Error::ShutDown(self.shared.spec.name.clone())),
            None => Err(Error::WorkerUnavailable(self.shared.spec.name.clone())),
        }
    }
}

impl Shared {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Tear down after the worker of `generation` exited.
    fn on_exit(self: &Arc<Self>, generation: u64, status: String) {
        let name = self.spec.name.clone();

        let uptime = {
            let mut runtime = self.runtime();
            match runtime.handle.as_ref() {
                Some(handle) if handle.generation == generation => {}
                _ => return,
            }
            let handle = runtime.handle.take();
            runtime.last_exit = Some(status.clone());
            handle.map(|h| h.started_at.elapsed()).unwrap_or_default()
        };

        let shutting_down = self.is_shut_down();
        if shutting_down {
            log::info!("[{}] exited: {}", name, status);
        } else {
            log::error!("[{}] exited: {} after {:?}", name, status, uptime);
        }

        let rejected = self.mux.fail_all(|_| {
            if shutting_down {
                Error::ShutDown(name.clone())
            } else {
                Error::ProcessCrash {
                    engine: name.clone(),
                    status: status.clone(),
                }
            }
        });
        if rejected > 0 {
            log::warn!("[{}] rejected {} pending request(s)", name, rejected);
        }

        let delay = {
            let mut runtime = self.runtime();
            if self.is_shut_down() {
                runtime.state = WorkerState::ShutDown;
                return;
            }

            if uptime >= Duration::from_millis(self.policy.stable_after_ms) {
                runtime.consecutive_crashes = 1;
            } else {
                runtime.consecutive_crashes += 1;
            }
            let consecutive = runtime.consecutive_crashes;

            if self.policy.gives_up_after(consecutive) {
                runtime.state = WorkerState::Failed;
                log::error!(
                    "[{}] crashed {} times in a row; not restarting until started manually",
                    name,
                    consecutive
                );
                return;
            }
            if consecutive % CRASH_LOOP_WARN_EVERY == 0 {
                log::warn!("[{}] crash loop: {} consecutive crashes", name, consecutive);
            }

            runtime.state = WorkerState::Crashed;
            self.policy.delay_for(consecutive)
        };

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.is_shut_down() {
                return;
            }
            let supervisor = Supervisor { shared };
            if let Err(e) = supervisor.start() {
                log::error!("[{}] respawn failed: {}", supervisor.name(), e);
            }
        });
        log::info!("[{}] respawn scheduled in {:?}", name, delay);
    }
}

/// Owns the worker's stdin; the only task that ever writes to it.
async fn write_loop(
    engine: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            log::warn!("[{}] stdin write failed: {}", engine, e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            log::warn!("[{}] stdin flush failed: {}", engine, e);
            break;
        }
    }
}

/// Read `\n`-terminated lines until EOF. Invalid UTF-8 is replaced, never fatal.
async fn read_lines<R, F>(stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                log::debug!("worker stream read failed: {}", e);
                break;
            }
        }
    }
}

async fn watch_exit(
    shared: Arc<Shared>,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    stdout_reader: JoinHandle<()>,
    generation: u64,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    // Answers written just before exit are still in the pipe.
    let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_reader).await;

    let description = match status {
        Ok(status) => describe_exit(&status),
        Err(e) => format!("wait failed: {}", e),
    };
    shared.on_exit(generation, description);
}
