//! Database process supervision.
//!
//! The `Supervisor` launches one database process at a time in its own process
//! group, relays its output as events, probes it for readiness and tears the
//! whole process tree down on stop. A monitor task owns the child; the shared
//! state only records which launch (generation) is current.

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::SupervisorError;
use crate::events::{DatabaseEvent, Event, ProcessSignal};
use crate::output::{sanitize_text, LineSource};
use crate::serve::LaunchPlan;

/// Exits sooner than this after launch count as a failed start.
const EARLY_EXIT_WINDOW: Duration = Duration::from_millis(500);
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const READER_DRAIN: Duration = Duration::from_secs(1);

pub const NOT_STARTED_LINE: &str = "database did not start. Is the executable available?";
pub const START_FAILED_MESSAGE: &str =
    "database did not start correctly, check the console for more information";

/// Graceful shutdown ladder; a zero timeout skips that step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
        }
    }

    fn sigint_timeout(&self) -> Duration {
        Duration::from_millis(self.sigint_ms)
    }

    fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }

    fn sigint_enabled(&self) -> bool {
        self.sigint_ms > 0
    }

    fn sigterm_enabled(&self) -> bool {
        self.sigterm_ms > 0
    }
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning { pid: u32 },
}

/// Starts, watches and stops the database process.
#[derive(Clone)]
pub struct Supervisor {
    state: Arc<Mutex<State>>,
    event_tx: mpsc::Sender<Event>,
    shutdown: ShutdownConfig,
}

#[derive(Default)]
struct State {
    current: Option<Running>,
    generation: u64,
}

struct Running {
    generation: u64,
    pid: u32,
    stop_requested: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    done_rx: watch::Receiver<bool>,
}

/// Everything the monitor task needs once the child is spawned.
struct Monitor {
    generation: u64,
    pid: u32,
    started_at: Instant,
    state: Arc<Mutex<State>>,
    event_tx: mpsc::Sender<Event>,
    shutdown: ShutdownConfig,
    stop_requested: Arc<AtomicBool>,
    saw_output: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(event_tx: mpsc::Sender<Event>, shutdown: ShutdownConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            event_tx,
            shutdown,
        }
    }

    /// Launches the database unless one is already running.
    ///
    /// A second start while running re-announces `database:start` so a
    /// frontend that reloaded can resync.
    pub async fn start(&self, plan: LaunchPlan) -> Result<StartOutcome, SupervisorError> {
        let mut state = self.state.lock().await;
        if let Some(running) = &state.current {
            let pid = running.pid;
            drop(state);
            tracing::debug!(pid, "database already running");
            self.emit(DatabaseEvent::Started { pid }).await;
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        tracing::info!(program = %plan.program, "serving database");
        let started_at = Instant::now();
        let mut child = match spawn_plan(&plan) {
            Ok(child) => child,
            Err(source) => {
                drop(state);
                let err = SupervisorError::Spawn {
                    program: plan.program.clone(),
                    source,
                };
                tracing::error!("{err}");
                self.emit(DatabaseEvent::Error {
                    message: err.to_string(),
                })
                .await;
                return Err(err);
            }
        };
        let pid = child.id().unwrap_or(0);

        state.generation += 1;
        let generation = state.generation;
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        state.current = Some(Running {
            generation,
            pid,
            stop_requested: stop_requested.clone(),
            stop_tx: Some(stop_tx),
            done_rx,
        });
        drop(state);

        tracing::info!(pid, generation, "database started");
        self.emit(DatabaseEvent::Started { pid }).await;

        let saw_output = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                LineSource::Stdout,
                stdout,
                self.event_tx.clone(),
                saw_output.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                LineSource::Stderr,
                stderr,
                self.event_tx.clone(),
                saw_output.clone(),
            )));
        }

        match plan.health_url {
            Some(url) => {
                tokio::spawn(wait_until_ready(url, alive.clone(), self.event_tx.clone()));
            }
            None => self.emit(DatabaseEvent::Ready).await,
        }

        let monitor = Monitor {
            generation,
            pid,
            started_at,
            state: self.state.clone(),
            event_tx: self.event_tx.clone(),
            shutdown: self.shutdown,
            stop_requested,
            saw_output,
            alive,
            done_tx,
        };
        tokio::spawn(monitor.run(child, stop_rx, readers));

        Ok(StartOutcome::Started { pid })
    }

    /// Stops the running database. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut done_rx = {
            let mut state = self.state.lock().await;
            let Some(running) = state.current.as_mut() else {
                return false;
            };
            running.stop_requested.store(true, Ordering::SeqCst);
            if let Some(stop_tx) = running.stop_tx.take() {
                tracing::info!(pid = running.pid, "stopping database");
                let _ = stop_tx.send(());
            }
            running.done_rx.clone()
        };

        match tokio::time::timeout(STOP_TIMEOUT, done_rx.wait_for(|done| *done)).await {
            Ok(_) => {}
            Err(_) => tracing::warn!("database did not stop within {STOP_TIMEOUT:?}"),
        }
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.current.is_some()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.state.lock().await.current.as_ref().map(|running| running.pid)
    }

    /// Stops the database when the shell exits.
    pub async fn shutdown(&self) {
        if self.stop().await {
            tracing::info!("database stopped on exit");
        }
    }

    async fn emit(&self, event: DatabaseEvent) {
        let _ = self.event_tx.send(Event::Database(event)).await;
    }
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        stop_rx: oneshot::Receiver<()>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            // A dropped sender means the supervisor is gone; stop either way.
            _ = stop_rx => None,
        };
        let status = match exited {
            Some(status) => status,
            None => terminate(&mut child, self.pid, self.shutdown).await,
        };
        self.alive.store(false, Ordering::SeqCst);

        for reader in readers {
            if tokio::time::timeout(READER_DRAIN, reader).await.is_err() {
                tracing::debug!(pid = self.pid, "output reader still open after exit");
            }
        }

        let events = self.final_events(status);

        {
            let mut state = self.state.lock().await;
            if state
                .current
                .as_ref()
                .is_some_and(|running| running.generation == self.generation)
            {
                state.current = None;
            }
        }

        for event in events {
            let _ = self.event_tx.send(Event::Database(event)).await;
        }
        let _ = self.done_tx.send(true);
    }

    fn final_events(&self, status: std::io::Result<ExitStatus>) -> Vec<DatabaseEvent> {
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(pid = self.pid, "failed to wait for database: {err}");
                return vec![DatabaseEvent::Error {
                    message: format!("failed to wait for database: {err}"),
                }];
            }
        };

        let stop_requested = self.stop_requested.load(Ordering::SeqCst);
        let elapsed = self.started_at.elapsed();
        tracing::info!(
            pid = self.pid,
            code = ?status.code(),
            elapsed_ms = elapsed.as_millis() as u64,
            stop_requested,
            "database exited"
        );

        let mut events = Vec::new();
        if !stop_requested && elapsed <= EARLY_EXIT_WINDOW {
            if !self.saw_output.load(Ordering::SeqCst) {
                events.push(shell_line(NOT_STARTED_LINE));
            }
            events.push(DatabaseEvent::Error {
                message: START_FAILED_MESSAGE.to_string(),
            });
            return events;
        }

        if let Some(code) = status.code().filter(|code| *code != 0) {
            events.push(shell_line(&format!("database exited with code {code}")));
        }
        events.push(DatabaseEvent::Stopped {
            code: status.code(),
        });
        events
    }
}

fn shell_line(text: &str) -> DatabaseEvent {
    DatabaseEvent::Output {
        line: text.to_string(),
        stream: LineSource::Shell,
    }
}

fn spawn_plan(plan: &LaunchPlan) -> std::io::Result<Child> {
    let mut command = Command::new(&plan.program);
    if plan.verbatim_args {
        append_verbatim(&mut command, &plan.args);
    } else {
        command.args(&plan.args);
    }
    if !plan.env.is_empty() {
        command.envs(&plan.env);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.kill_on_drop(true);

    #[cfg(windows)]
    {
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }

    #[cfg(unix)]
    command.process_group(0);

    command.spawn()
}

// Pre-quoted args must reach the command line untouched.
#[cfg(windows)]
fn append_verbatim(command: &mut Command, args: &[String]) {
    for arg in args {
        command.raw_arg(arg);
    }
}

#[cfg(not(windows))]
fn append_verbatim(command: &mut Command, args: &[String]) {
    command.args(args);
}

// Walks the ladder: SIGINT, SIGTERM, then a hard kill of the whole group.
async fn terminate(
    child: &mut Child,
    pid: u32,
    shutdown: ShutdownConfig,
) -> std::io::Result<ExitStatus> {
    if shutdown.sigint_enabled() {
        send_os_signal(pid, ProcessSignal::SigInt);
        if let Some(status) = wait_for_exit(child, shutdown.sigint_timeout()).await? {
            return Ok(status);
        }
    }
    if shutdown.sigterm_enabled() {
        send_os_signal(pid, ProcessSignal::SigTerm);
        if let Some(status) = wait_for_exit(child, shutdown.sigterm_timeout()).await? {
            return Ok(status);
        }
    }
    kill_process_tree(pid).await;
    let _ = child.start_kill();
    child.wait().await
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    let sig = match signal {
        ProcessSignal::SigInt => libc::SIGINT,
        ProcessSignal::SigTerm => libc::SIGTERM,
    };
    let pid = pid as i32;
    unsafe {
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(windows)]
fn send_os_signal(pid: u32, _signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    // CTRL_BREAK is the only console signal that reaches a new process group.
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(not(any(unix, windows)))]
fn send_os_signal(_pid: u32, _signal: ProcessSignal) {}

#[cfg(unix)]
async fn kill_process_tree(pid: u32) {
    let pid = pid as i32;
    if pid <= 0 {
        return;
    }
    unsafe {
        let _ = libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(windows)]
async fn kill_process_tree(pid: u32) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    let result = Command::new("taskkill")
        .args(["/pid", &pid.to_string(), "/t", "/f"])
        .creation_flags(CREATE_NO_WINDOW)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(err) = result {
        tracing::warn!(pid, "taskkill failed: {err}");
    }
}

#[cfg(not(any(unix, windows)))]
async fn kill_process_tree(_pid: u32) {}

async fn wait_for_exit(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(Some(status)),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(None),
    }
}

async fn read_stream<R>(
    source: LineSource,
    reader: R,
    tx: mpsc::Sender<Event>,
    saw_output: Arc<AtomicBool>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        saw_output.store(true, Ordering::SeqCst);
        tracing::info!(target: "dbdeck::database", "{}", sanitize_text(&line, true));
        let _ = tx
            .send(Event::Database(DatabaseEvent::Output {
                line,
                stream: source,
            }))
            .await;
    }
}

// Polls the health endpoint until it answers, the process dies or time runs out.
async fn wait_until_ready(url: String, alive: Arc<AtomicBool>, tx: mpsc::Sender<Event>) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!("readiness probe disabled: {err}");
            return;
        }
    };

    let deadline = Instant::now() + READY_TIMEOUT;
    while alive.load(Ordering::SeqCst) && Instant::now() < deadline {
        let ready = matches!(
            client.get(&url).send().await,
            Ok(response) if response.status().is_success()
        );
        if ready {
            if alive.load(Ordering::SeqCst) {
                tracing::info!("database is ready");
                let _ = tx.send(Event::Database(DatabaseEvent::Ready)).await;
            }
            return;
        }
        tokio::time::sleep(READY_POLL).await;
    }
    if alive.load(Ordering::SeqCst) {
        tracing::warn!(%url, "database did not become ready within {READY_TIMEOUT:?}");
    }
}
