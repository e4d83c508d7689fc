//! Envelope: owns one weavelet process for its whole lifetime.
//!
//! `new` spawns the weavelet with its control pipes and captured output and
//! sends SETUP. `serve` then runs four tasks (stdout reader, stderr reader,
//! log delivery, control loop) and waits for the first terminal event:
//! cancellation, startup deadline, control stream end, or control failure.
//! Profiling and health requests may be issued concurrently with `serve`.
//! Cancelling the envelope kills the weavelet whether or not `serve` has
//! been called.

use crate::control::bootstrap::ControlPipes;
use crate::control::io::{AsyncFrameReader, ConnError};
use crate::control::messages::{
    HealthReply, LaunchConfig, ProfileReply, ProfileRequest, WeaveletIdentity, WeaveletSetup,
};
use crate::envelope::conn::{EnvelopeConn, Liveness};
use crate::envelope::handler::EnvelopeHandler;
use crate::envelope::log_relay::{self, CapturedLine, FirstLineHook, LogAttribution, LogStream};
use crate::envelope::profiling::ProfilingSlot;
use std::future::Future;
use std::io;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};

/// Errors reported by an [`Envelope`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to spawn weavelet {binary}: {message}")]
    Spawn { binary: String, message: String },

    #[error("control pipe setup failed: {0}")]
    Pipe(String),

    #[error("weavelet connection failed: {0}")]
    Transport(ConnError),

    #[error("envelope cancelled")]
    Cancelled,

    #[error("weavelet exited: {status}")]
    Exited { status: String, code: Option<i32> },

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("profiling already in progress")]
    ProfilingBusy,

    #[error("weavelet replied with error: {0}")]
    Remote(String),

    #[error("envelope is already serving")]
    AlreadyServing,
}

impl EnvelopeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EnvelopeError::Cancelled)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, EnvelopeError::DeadlineExceeded(_))
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, EnvelopeError::Exited { .. })
    }
}

impl From<ConnError> for EnvelopeError {
    fn from(e: ConnError) -> Self {
        match e {
            ConnError::Remote(msg) => EnvelopeError::Remote(msg),
            other => EnvelopeError::Transport(other),
        }
    }
}

/// Lifecycle of an envelope. Terminal states are set once.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeState {
    /// Spawned, SETUP sent, no sign of life yet
    Starting,
    /// First output line or first control message seen
    Running,
    /// Stopped by cancellation
    Stopped,
    /// Terminated by anything else
    Failed(EnvelopeError),
}

impl EnvelopeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeState::Stopped | EnvelopeState::Failed(_))
    }

    fn terminal_error(&self) -> Option<EnvelopeError> {
        match self {
            EnvelopeState::Stopped => Some(EnvelopeError::Cancelled),
            EnvelopeState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }
}

/// Tunables for an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeOptions {
    /// How long the weavelet may stay silent after spawn; `None` waits forever
    pub startup_timeout: Option<Duration>,
    /// How long to wait for exit and trailing output once the control stream closes
    pub exit_grace: Duration,
}

impl Default for EnvelopeOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Some(Duration::from_secs(30)),
            exit_grace: Duration::from_secs(2),
        }
    }
}

impl EnvelopeOptions {
    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }
}

/// Everything `serve` consumes, taken exactly once.
struct ServeParts {
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    control: AsyncFrameReader<pipe::Receiver>,
}

/// Aborts the wrapped tasks when dropped.
struct TaskSet(Vec<AbortHandle>);

impl Drop for TaskSet {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

type SharedState = Arc<watch::Sender<EnvelopeState>>;

fn mark_running(state: &watch::Sender<EnvelopeState>) {
    state.send_if_modified(|s| {
        if *s == EnvelopeState::Starting {
            *s = EnvelopeState::Running;
            true
        } else {
            false
        }
    });
}

fn mark_terminal(state: &watch::Sender<EnvelopeState>, err: &EnvelopeError) {
    state.send_if_modified(|s| {
        if s.is_terminal() {
            return false;
        }
        *s = if err.is_cancelled() {
            EnvelopeState::Stopped
        } else {
            EnvelopeState::Failed(err.clone())
        };
        true
    });
}

/// Resolves only if the weavelet is still `Starting` when the timeout fires.
async fn startup_deadline(mut rx: watch::Receiver<EnvelopeState>, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    let alive = rx.wait_for(|s| *s != EnvelopeState::Starting);
    if tokio::time::timeout(timeout, alive).await.is_ok() {
        std::future::pending::<()>().await;
    }
}

type SharedParts = Arc<Mutex<Option<ServeParts>>>;

/// Kill a weavelet whose envelope is cancelled before `serve` takes it over.
///
/// Returns without doing anything once the envelope is dropped or `serve`
/// owns the process.
async fn watch_unserved(
    cancel: CancellationToken,
    dropped: CancellationToken,
    parts: SharedParts,
    conn: Arc<EnvelopeConn>,
    state: SharedState,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = dropped.cancelled() => return,
    }
    // Terminal state is published under the lock so `serve` never sees the
    // parts gone without a terminal error to report.
    let unserved = match parts.lock() {
        Ok(mut parts) => {
            let taken = parts.take();
            if taken.is_some() {
                conn.close(ConnError::Closed);
                mark_terminal(&state, &EnvelopeError::Cancelled);
            }
            taken
        }
        Err(_) => None,
    };
    let Some(mut unserved) = unserved else {
        return;
    };
    let pid = unserved.child.id();
    if let Err(e) = unserved.child.kill().await {
        tracing::warn!(pid, error = %e, "failed to kill weavelet");
    }
    tracing::info!(pid, "weavelet stopped before serving");
}

pub struct Envelope {
    identity: WeaveletIdentity,
    config: LaunchConfig,
    options: EnvelopeOptions,
    cancel: CancellationToken,
    pid: Option<u32>,
    reported_pid: Arc<OnceLock<u32>>,
    conn: Arc<EnvelopeConn>,
    state: SharedState,
    profiling: ProfilingSlot,
    parts: SharedParts,
    /// Stops the cancellation watcher when the envelope goes away
    _watcher: DropGuard,
    /// Read end of the envelope→weavelet pipe, held so writes to a weavelet
    /// that already exited land in the pipe buffer instead of failing.
    _inbox: OwnedFd,
}

impl Envelope {
    /// Spawn the weavelet described by `config` with default options.
    pub async fn new(
        cancel: CancellationToken,
        identity: WeaveletIdentity,
        config: LaunchConfig,
    ) -> Result<Self, EnvelopeError> {
        Self::with_options(cancel, identity, config, EnvelopeOptions::default()).await
    }

    pub async fn with_options(
        cancel: CancellationToken,
        identity: WeaveletIdentity,
        config: LaunchConfig,
        options: EnvelopeOptions,
    ) -> Result<Self, EnvelopeError> {
        let pipes = ControlPipes::new().map_err(|e| EnvelopeError::Pipe(e.to_string()))?;

        let mut cmd = Command::new(&config.binary);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true); // No orphan weavelets
        pipes.configure(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| EnvelopeError::Spawn {
            binary: config.binary.display().to_string(),
            message: e.to_string(),
        })?;

        let ControlPipes {
            parent_reader,
            parent_writer,
            child_reader,
            child_writer,
        } = pipes;
        // The weavelet now holds the only write end; its exit closes the stream.
        drop(child_writer);

        let pid = child.id();
        tracing::info!(
            pid,
            binary = %config.binary.display(),
            weavelet_id = %identity.id,
            "spawned weavelet"
        );

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                let _ = child.kill().await;
                return Err(EnvelopeError::Pipe("weavelet output not captured".to_string()));
            }
        };

        let streams = pipe::Sender::from_owned_fd(parent_writer)
            .and_then(|tx| pipe::Receiver::from_owned_fd(parent_reader).map(|rx| (tx, rx)));
        let (to_weavelet, from_weavelet) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                let _ = child.kill().await;
                return Err(EnvelopeError::Pipe(e.to_string()));
            }
        };

        let setup = WeaveletSetup {
            identity: identity.clone(),
            config: config.clone(),
        };
        let conn = match EnvelopeConn::new(to_weavelet, &setup).await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = child.kill().await;
                return Err(EnvelopeError::Transport(e));
            }
        };

        let (state, _) = watch::channel(EnvelopeState::Starting);
        let conn = Arc::new(conn);
        let state = Arc::new(state);
        let parts = Arc::new(Mutex::new(Some(ServeParts {
            child,
            stdout,
            stderr,
            control: AsyncFrameReader::new(from_weavelet),
        })));

        let dropped = CancellationToken::new();
        tokio::spawn(watch_unserved(
            cancel.clone(),
            dropped.clone(),
            parts.clone(),
            conn.clone(),
            state.clone(),
        ));

        Ok(Self {
            identity,
            config,
            options,
            cancel,
            pid,
            reported_pid: Arc::new(OnceLock::new()),
            conn,
            state,
            profiling: ProfilingSlot::new(),
            parts,
            _watcher: dropped.drop_guard(),
            _inbox: child_reader,
        })
    }

    pub fn identity(&self) -> &WeaveletIdentity {
        &self.identity
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// OS process id of the weavelet, as seen at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pid the weavelet reported itself, from READY or its first stdout line.
    pub fn reported_pid(&self) -> Option<u32> {
        self.reported_pid.get().copied()
    }

    pub fn state(&self) -> EnvelopeState {
        self.state.borrow().clone()
    }

    /// Wait until the weavelet shows a sign of life.
    ///
    /// Fails with the terminal error if the envelope stops first. Only makes
    /// progress while `serve` is running.
    pub async fn wait_running(&self) -> Result<(), EnvelopeError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s != EnvelopeState::Starting)
            .await
            .map(|s| (*s).clone())
            .map_err(|_| EnvelopeError::Cancelled)?;
        match state.terminal_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn terminated(&self) -> EnvelopeError {
        let mut rx = self.state.subscribe();
        let err = match rx.wait_for(EnvelopeState::is_terminal).await {
            Ok(state) => state.terminal_error().unwrap_or(EnvelopeError::Cancelled),
            Err(_) => EnvelopeError::Cancelled,
        };
        err
    }

    /// Run a request against the weavelet, giving up on cancellation or termination.
    async fn request<T, F>(&self, cancel: Option<&CancellationToken>, call: F) -> Result<T, EnvelopeError>
    where
        F: Future<Output = Result<T, ConnError>>,
    {
        let terminal = self.state.borrow().terminal_error();
        if let Some(err) = terminal {
            return Err(err);
        }
        let caller_cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            result = call => result.map_err(EnvelopeError::from),
            _ = caller_cancelled => Err(EnvelopeError::Cancelled),
            _ = self.cancel.cancelled() => Err(EnvelopeError::Cancelled),
            err = self.terminated() => Err(err),
        }
    }

    /// Collect one profile from the weavelet.
    ///
    /// Only one profile may be in flight: a concurrent call fails immediately
    /// with [`EnvelopeError::ProfilingBusy`] without contacting the weavelet.
    pub async fn run_profiling(
        &self,
        cancel: &CancellationToken,
        req: ProfileRequest,
    ) -> Result<ProfileReply, EnvelopeError> {
        let _slot = self.profiling.try_acquire().ok_or(EnvelopeError::ProfilingBusy)?;
        tracing::debug!(pid = self.pid, kind = ?req.kind, duration = ?req.cpu_duration, "profiling weavelet");
        self.request(Some(cancel), self.conn.run_profiling(&req)).await
    }

    pub async fn get_health(&self) -> Result<HealthReply, EnvelopeError> {
        self.request(None, self.conn.get_health()).await
    }

    /// Supervise the weavelet until it terminates.
    ///
    /// Never returns `Ok`: the result is the terminal error, with
    /// [`EnvelopeError::Cancelled`] for a requested stop. May be called once;
    /// a call after the envelope already terminated returns that outcome.
    pub async fn serve(&self, handler: Arc<dyn EnvelopeHandler>) -> Result<(), EnvelopeError> {
        let taken = self.parts.lock().ok().and_then(|mut parts| parts.take());
        let Some(parts) = taken else {
            let terminal = self.state.borrow().terminal_error();
            return Err(terminal.unwrap_or(EnvelopeError::AlreadyServing));
        };
        let ServeParts {
            mut child,
            stdout,
            stderr,
            control,
        } = parts;

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let hook: FirstLineHook = {
            let state = self.state.clone();
            let reported = self.reported_pid.clone();
            Arc::new(move |line: &CapturedLine| {
                if line.stream == LogStream::Stdout {
                    if let Ok(pid) = line.text.trim().parse::<u32>() {
                        let _ = reported.set(pid);
                    }
                }
                mark_running(&state);
            })
        };
        let readers = vec![
            log_relay::spawn_reader(LogStream::Stdout, stdout, line_tx.clone(), hook.clone()),
            log_relay::spawn_reader(LogStream::Stderr, stderr, line_tx, hook),
        ];
        let delivery_task = tokio::spawn(log_relay::deliver(
            line_rx,
            handler.clone(),
            LogAttribution {
                identity: self.identity.clone(),
                pid: self.pid,
            },
        ));

        let mut control_task = tokio::spawn({
            let conn = self.conn.clone();
            let state = self.state.clone();
            let reported = self.reported_pid.clone();
            async move {
                conn.serve(control, handler, move |liveness| {
                    if let Liveness::Ready(pid) = liveness {
                        let _ = reported.set(pid);
                    }
                    mark_running(&state);
                })
                .await
            }
        });

        let reader_aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
        let _tasks = TaskSet(
            readers
                .iter()
                .map(JoinHandle::abort_handle)
                .chain([delivery_task.abort_handle(), control_task.abort_handle()])
                .collect(),
        );

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::debug!(pid = self.pid, "envelope cancelled, killing weavelet");
                EnvelopeError::Cancelled
            }
            _ = startup_deadline(self.state.subscribe(), self.options.startup_timeout) => {
                EnvelopeError::DeadlineExceeded(format!(
                    "weavelet showed no sign of life within {:?}",
                    self.options.startup_timeout.unwrap_or_default()
                ))
            }
            joined = &mut control_task => match joined {
                Ok(Ok(())) => {
                    let exited = async {
                        let err = self.await_exit(&mut child).await;
                        self.drain_output(readers, &reader_aborts, delivery_task).await;
                        err
                    };
                    // Cancellation still wins while the exit is being collected.
                    tokio::select! {
                        err = exited => {
                            self.finish(&err);
                            return Err(err);
                        }
                        _ = self.cancel.cancelled() => {
                            tracing::debug!(pid = self.pid, "envelope cancelled while weavelet was exiting");
                            EnvelopeError::Cancelled
                        }
                    }
                }
                Ok(Err(e)) => EnvelopeError::Transport(e),
                Err(e) => EnvelopeError::Transport(ConnError::Protocol(format!(
                    "control task failed: {}",
                    e
                ))),
            }
        };

        if let Err(e) = child.kill().await {
            tracing::warn!(pid = self.pid, error = %e, "failed to kill weavelet");
        }
        self.finish(&outcome);
        Err(outcome)
    }

    /// Reap the weavelet after its control stream closed.
    async fn await_exit(&self, child: &mut Child) -> EnvelopeError {
        let status = match tokio::time::timeout(self.options.exit_grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(pid = self.pid, "weavelet closed its control stream but kept running; killing");
                match child.kill().await {
                    Ok(()) => child.wait().await,
                    Err(e) => Err(e),
                }
            }
        };
        match status {
            Ok(status) => EnvelopeError::Exited {
                status: status.to_string(),
                code: status.code(),
            },
            Err(e) => EnvelopeError::Exited {
                status: format!("unknown ({})", e),
                code: None,
            },
        }
    }

    /// Let captured output reach the handler before reporting the exit.
    async fn drain_output(
        &self,
        readers: Vec<JoinHandle<io::Result<u64>>>,
        reader_aborts: &[AbortHandle],
        delivery: JoinHandle<u64>,
    ) {
        let all_closed = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(self.options.exit_grace, all_closed).await.is_err() {
            // A descendant still holds the pipes open.
            tracing::warn!(pid = self.pid, "weavelet output still open after exit; abandoning it");
            for abort in reader_aborts {
                abort.abort();
            }
        }
        match delivery.await {
            Ok(lines) => tracing::trace!(pid = self.pid, lines, "relayed weavelet output"),
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "log delivery task failed"),
        }
    }

    fn finish(&self, err: &EnvelopeError) {
        self.conn.close(ConnError::Closed);
        mark_terminal(&self.state, err);
        if err.is_cancelled() {
            tracing::info!(pid = self.pid, "weavelet stopped");
        } else {
            tracing::warn!(pid = self.pid, error = %err, "weavelet terminated");
        }
    }
}
