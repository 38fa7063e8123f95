//! Single-flight supervisor for the external command.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::reassembler::LineReassembler;
use super::types::{LineEvent, Run, RunState};
use crate::config::RunnerConfig;
use crate::process;
use crate::ws::{BroadcastHub, HubEvent};

/// Bytes requested per read from a child pipe.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Marker timestamp format.
const MARKER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Environment applied to every run so Python output is unbuffered UTF-8.
const DEFAULT_CHILD_ENV: [(&str, &str); 2] =
    [("PYTHONUNBUFFERED", "1"), ("PYTHONIOENCODING", "utf-8")];

/// Errors returned by [`ProcessRunner`].
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("run {0} is already active")]
    AlreadyRunning(Uuid),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("run {id} did not stop within {timeout:?}")]
    StopTimeout { id: Uuid, timeout: Duration },
}

/// Runner settings.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// Time between SIGTERM and SIGKILL when stopping.
    pub kill_grace: Duration,
    /// How long `stop` waits for the run to end.
    pub stop_timeout: Duration,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            working_dir: None,
            env: HashMap::new(),
            kill_grace: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(15),
        }
    }
}

impl RunnerOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            working_dir: config.working_dir.clone(),
            env: config.env.clone(),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }
}

struct ActiveRun {
    id: Uuid,
    cancel: CancellationToken,
}

/// Runs at most one external command at a time and streams its output.
///
/// Output lines, plus start and exit markers, go to the [`BroadcastHub`]
/// with a per-run sequence number. The latest [`Run`] is published on a
/// watch channel.
pub struct ProcessRunner {
    hub: Arc<BroadcastHub>,
    options: RunnerOptions,
    slot: Arc<Mutex<Option<ActiveRun>>>,
    state: Arc<watch::Sender<Option<Run>>>,
}

impl ProcessRunner {
    pub fn new(hub: Arc<BroadcastHub>, options: RunnerOptions) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            hub,
            options,
            slot: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
        }
    }

    /// Start `command`, split with POSIX shell rules and executed directly.
    ///
    /// A command that cannot be spawned still produces a run: it is returned
    /// already `crashed` and the error is written to the transcript.
    pub async fn start(&self, command: &str) -> Result<Run, RunnerError> {
        let argv =
            shell_words::split(command).map_err(|e| RunnerError::InvalidCommand(e.to_string()))?;
        if argv.is_empty() {
            return Err(RunnerError::InvalidCommand("command is empty".to_string()));
        }

        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref() {
            return Err(RunnerError::AlreadyRunning(active.id));
        }

        let mut run = Run::new(command.trim());
        let emitter = LineEmitter::new(run.id, self.hub.clone());
        emitter
            .publish(vec![format!(
                "==> [{}] run started: {}",
                chrono::Local::now().format(MARKER_TIME_FORMAT),
                run.command
            )])
            .await;

        let (child, output) = match self.spawn_child(&argv) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to start '{}': {}", run.command, e);
                emitter
                    .publish(vec![format!("[run error] failed to start: {e}")])
                    .await;
                run.finish(RunState::Crashed {
                    error: e.to_string(),
                });
                self.state.send_replace(Some(run.clone()));
                return Ok(run);
            }
        };
        info!(
            "Started run {} (pid {:?}): {}",
            run.id,
            child.id(),
            run.command
        );

        let cancel = CancellationToken::new();
        *slot = Some(ActiveRun {
            id: run.id,
            cancel: cancel.clone(),
        });
        self.state.send_replace(Some(run.clone()));

        tokio::spawn(supervise(
            child,
            output,
            run.clone(),
            emitter,
            cancel,
            self.options.kill_grace,
            self.slot.clone(),
            self.state.clone(),
        ));
        Ok(run)
    }

    /// Stop the active run and wait for it to end.
    ///
    /// Returns `Ok(false)` when nothing was running.
    pub async fn stop(&self) -> Result<bool, RunnerError> {
        let (id, cancel) = {
            let slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(active) => (active.id, active.cancel.clone()),
                None => return Ok(false),
            }
        };

        info!("Stopping run {}", id);
        let mut rx = self.state.subscribe();
        cancel.cancel();

        let timeout = self.options.stop_timeout;
        let finished = tokio::time::timeout(
            timeout,
            rx.wait_for(|run| run.as_ref().is_some_and(|r| r.id != id || !r.is_running())),
        )
        .await
        .is_ok();

        if finished {
            Ok(true)
        } else {
            warn!("Run {} still alive after {:?}", id, timeout);
            Err(RunnerError::StopTimeout { id, timeout })
        }
    }

    /// The active run, or the most recent one.
    pub fn current(&self) -> Option<Run> {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().as_ref().is_some_and(Run::is_running)
    }

    /// Watch run state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<Option<Run>> {
        self.state.subscribe()
    }

    /// Spawn the child with stdout and stderr writing into one pipe, so the
    /// output is read back in the order the child wrote it.
    fn spawn_child(&self, argv: &[String]) -> io::Result<(Child, pipe::Receiver)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "command is empty"))?;

        let (reader, writer) = io::pipe()?;
        let stderr_writer = writer.try_clone()?;
        let output = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(stderr_writer)
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &self.options.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in DEFAULT_CHILD_ENV {
            cmd.env(key, value);
        }
        for (key, value) in &self.options.env {
            cmd.env(key, value);
        }

        // Our copies of the write ends go away with `cmd`, so EOF arrives
        // once the child and everything it forked are gone.
        let child = cmd.spawn()?;
        Ok((child, output))
    }
}

/// Publishes lines of one run with gap-free sequence numbers.
#[derive(Clone)]
struct LineEmitter {
    run_id: Uuid,
    seq: Arc<AtomicU64>,
    hub: Arc<BroadcastHub>,
}

impl LineEmitter {
    fn new(run_id: Uuid, hub: Arc<BroadcastHub>) -> Self {
        Self {
            run_id,
            seq: Arc::new(AtomicU64::new(0)),
            hub,
        }
    }

    fn emit(&self, text: impl Into<String>) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.hub.publish(HubEvent::Line(LineEvent {
            run_id: self.run_id,
            seq,
            text: text.into(),
        }));
    }

    fn emit_all(&self, lines: Vec<String>) {
        for line in lines {
            self.emit(line);
        }
    }

    /// Publish a batch off the async workers; transcript appends hit the disk.
    async fn publish(&self, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let emitter = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || emitter.emit_all(lines)).await {
            error!("Publishing output of run {} failed: {}", self.run_id, e);
        }
    }
}

/// Drive the run to completion, then record the outcome and free the slot.
async fn supervise(
    child: Child,
    output: pipe::Receiver,
    mut run: Run,
    emitter: LineEmitter,
    cancel: CancellationToken,
    kill_grace: Duration,
    slot: Arc<Mutex<Option<ActiveRun>>>,
    state: Arc<watch::Sender<Option<Run>>>,
) {
    let reader = tokio::spawn(drive_child(
        child,
        output,
        emitter.clone(),
        cancel,
        kill_grace,
    ));

    let outcome = match reader.await {
        Ok(code) => {
            emitter
                .publish(vec![format!("[run finished] exit code: {code}")])
                .await;
            RunState::from_exit_code(code)
        }
        Err(e) => {
            let message = if e.is_panic() {
                "output reader panicked".to_string()
            } else {
                format!("output reader aborted: {e}")
            };
            error!("Run {} crashed: {}", run.id, message);
            emitter.publish(vec![format!("[run error] {message}")]).await;
            RunState::Crashed { error: message }
        }
    };
    run.finish(outcome);
    info!("Run {} finished: {:?}", run.id, run.state);

    let mut slot = slot.lock().await;
    if slot.as_ref().is_some_and(|active| active.id == run.id) {
        *slot = None;
    }
    state.send_replace(Some(run));
}

/// Pump the merged output pipe into the hub until the child exits.
///
/// Returns the exit code, `-signal` for signal deaths, or `-1` when output
/// could not be read.
async fn drive_child(
    mut child: Child,
    output: pipe::Receiver,
    emitter: LineEmitter,
    cancel: CancellationToken,
    kill_grace: Duration,
) -> i32 {
    let pid = child.id();
    let mut output = Some(output);
    let mut lines = LineReassembler::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    let kill_timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(kill_timer);
    let mut kill_armed = false;
    let mut cancelled = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !cancelled => {
                cancelled = true;
                debug!("Cancelling pid {:?}", pid);
                if let Some(pid) = pid {
                    process::terminate_group(pid);
                }
                kill_timer.as_mut().reset(Instant::now() + kill_grace);
                kill_armed = true;
            }
            _ = &mut kill_timer, if kill_armed => {
                kill_armed = false;
                warn!("Process {:?} ignored SIGTERM for {:?}, killing", pid, kill_grace);
                if let Some(pid) = pid {
                    process::kill_group(pid);
                }
                if let Err(e) = child.start_kill() {
                    debug!("start_kill failed: {}", e);
                }
            }
            read = read_chunk(&mut output, &mut buf), if output.is_some() => {
                match read {
                    Ok(0) => {
                        emitter.publish(lines.finish().into_iter().collect()).await;
                        output = None;
                    }
                    Ok(n) => emitter.publish(lines.push(&buf[..n])).await,
                    Err(e) => {
                        return abort_on_read_error(&mut child, e, &emitter, &mut lines).await;
                    }
                }
            }
            status = child.wait(), if output.is_none() => {
                return match status {
                    Ok(status) => process::exit_code(status),
                    Err(e) => {
                        error!("Failed to wait for pid {:?}: {}", pid, e);
                        -1
                    }
                };
            }
        }
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn abort_on_read_error(
    child: &mut Child,
    err: io::Error,
    emitter: &LineEmitter,
    lines: &mut LineReassembler,
) -> i32 {
    error!("Reading output of pid {:?} failed: {}", child.id(), err);
    emitter.publish(lines.finish().into_iter().collect()).await;
    if let Some(pid) = child.id() {
        process::kill_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!("Killing child after read error failed: {}", e);
    }
    -1
}
