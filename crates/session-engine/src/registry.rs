//! Process-wide session table.
//!
//! A single actor task owns every session and applies
//! all lifecycle changes in order. Everything else talks to it through a
//! cloneable [`RegistryHandle`]. Each session additionally runs:
//!
//! - a supervisor task that owns the multiplexer and drives termination,
//! - an input task that serializes writes and resizes onto the PTY,
//! - a dispatch task for side-channel handlers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::connection::ConnectionId;
use crate::dispatch::{DispatchQueue, Dispatcher};
use crate::error::{EngineError, Result};
use crate::multiplexer::{Flush, FlushPolicy, FlushReason, FlushSink, Multiplexer, MuxExit};
use crate::osc::{Interceptor, SideChannelEvent};
use crate::pty::{self, Dimensions, PtyProcess, SessionSpec, TerminationPolicy};
use crate::scrollback::{FeedTotals, OutputFeed};

const COMMAND_QUEUE: usize = 64;
const INPUT_QUEUE: usize = 256;
/// Terminated sessions kept around for `info`.
const ENDED_HISTORY: usize = 64;

// ── Identity and state ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Starting,
    Running,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub pid: i32,
    pub shell: PathBuf,
    pub cwd: PathBuf,
    pub dimensions: Dimensions,
    pub state: SessionState,
    pub connections: usize,
    pub created_at: u64,
    pub exit_code: Option<i32>,
    pub stats: SessionStats,
}

/// I/O counters for one session. Ended sessions keep their final values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    /// Input bytes written to the PTY.
    pub bytes_in: u64,
    pub input_writes: u64,
    pub write_errors: u64,
    /// Cleaned output bytes delivered to subscribers.
    pub bytes_out: u64,
    /// Non-empty output flushes.
    pub frames: u64,
    pub uptime_ms: u64,
}

/// What subscribers of a session see, in production order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(Arc<[u8]>),
    SideChannel(SideChannelEvent),
    Exit { code: Option<i32> },
}

// ── Session input ───────────────────────────────────────────────────

enum InputCommand {
    Data(Vec<u8>),
    Resize(Dimensions),
}

/// Write side of a session, shared by every attached connection.
#[derive(Clone)]
pub struct SessionInput {
    session_id: SessionId,
    tx: mpsc::Sender<InputCommand>,
}

impl SessionInput {
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.send(InputCommand::Data(data)).await
    }

    pub async fn resize(&self, dimensions: Dimensions) -> Result<()> {
        self.send(InputCommand::Resize(dimensions)).await
    }

    async fn send(&self, command: InputCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| EngineError::SessionClosed(self.session_id))
    }
}

#[derive(Default)]
struct InputCounters {
    bytes: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
}

fn spawn_input_task(session_id: SessionId, process: Arc<PtyProcess>, counters: Arc<InputCounters>) -> SessionInput {
    let (tx, mut rx) = mpsc::channel(INPUT_QUEUE);
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                InputCommand::Data(bytes) => match process.write(&bytes).await {
                    Ok(()) => {
                        counters.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        counters.writes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        debug!(session = %session_id, %err, "PTY write failed");
                        break;
                    }
                },
                InputCommand::Resize(dims) => {
                    if let Err(err) = process.resize(dims) {
                        warn!(session = %session_id, %err, "PTY resize failed");
                    }
                }
            }
        }
    });
    SessionInput { session_id, tx }
}

/// Returned by [`RegistryHandle::attach`]. `replay` and `events` were taken
/// together, so the replay ends exactly where the live stream starts.
pub struct Attachment {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub dimensions: Dimensions,
    pub replay: Vec<u8>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub input: SessionInput,
}

// ── Commands ────────────────────────────────────────────────────────

enum Command {
    Create {
        spec: SessionSpec,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    Attach {
        session_id: SessionId,
        connection_id: ConnectionId,
        reply: oneshot::Sender<Result<Attachment>>,
    },
    Detach {
        session_id: SessionId,
        connection_id: ConnectionId,
    },
    Terminate {
        session_id: SessionId,
        reply: oneshot::Sender<Result<Option<i32>>>,
    },
    Info {
        session_id: SessionId,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Subscribe {
        session_id: SessionId,
        reply: oneshot::Sender<Result<broadcast::Receiver<SessionEvent>>>,
    },
    SweepOrphans {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    /// From a session's supervisor when the child exits on its own, before
    /// the final flush.
    Exiting { session_id: SessionId },
    /// From a session's supervisor once the process is gone.
    Ended {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
}

// ── Handle ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EngineError::RegistryClosed)?;
        rx.await.map_err(|_| EngineError::RegistryClosed)
    }

    pub async fn create(&self, spec: SessionSpec) -> Result<SessionId> {
        self.request(|reply| Command::Create { spec, reply }).await?
    }

    pub async fn attach(&self, session_id: SessionId, connection_id: ConnectionId) -> Result<Attachment> {
        self.request(|reply| Command::Attach {
            session_id,
            connection_id,
            reply,
        })
        .await?
    }

    pub async fn detach(&self, session_id: SessionId, connection_id: ConnectionId) {
        let _ = self
            .tx
            .send(Command::Detach {
                session_id,
                connection_id,
            })
            .await;
    }

    /// Resolves once the session has reached `Terminated`, with its exit code.
    pub async fn terminate(&self, session_id: SessionId) -> Result<Option<i32>> {
        self.request(|reply| Command::Terminate { session_id, reply }).await?
    }

    pub async fn info(&self, session_id: SessionId) -> Result<Option<SessionInfo>> {
        self.request(|reply| Command::Info { session_id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Read-only view of a session's event stream (recording, auditing).
    /// Does not count as an attached connection.
    pub async fn subscribe_output(&self, session_id: SessionId) -> Result<broadcast::Receiver<SessionEvent>> {
        self.request(|reply| Command::Subscribe { session_id, reply }).await?
    }

    /// Kill processes left behind by an earlier engine run. Returns how many
    /// were found.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        self.request(|reply| Command::SweepOrphans { reply }).await
    }

    /// Terminate every session and stop the registry.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

// ── Registry actor ──────────────────────────────────────────────────

struct SessionEntry {
    process: Arc<PtyProcess>,
    feed: Arc<OutputFeed>,
    input: SessionInput,
    counters: Arc<InputCounters>,
    started: Instant,
    state: SessionState,
    connections: HashSet<ConnectionId>,
    detached_since: Option<Instant>,
    created_at: u64,
    stop: Option<oneshot::Sender<()>>,
    waiters: Vec<oneshot::Sender<Result<Option<i32>>>>,
}

impl SessionEntry {
    fn info(&self, id: SessionId) -> SessionInfo {
        SessionInfo {
            id,
            pid: self.process.pid(),
            shell: self.process.shell().to_path_buf(),
            cwd: self.process.cwd().to_path_buf(),
            dimensions: self.process.dimensions(),
            state: self.state,
            connections: self.connections.len(),
            created_at: self.created_at,
            exit_code: None,
            stats: self.stats(),
        }
    }

    fn stats(&self) -> SessionStats {
        let FeedTotals { frames, bytes } = self.feed.totals();
        SessionStats {
            bytes_in: self.counters.bytes.load(Ordering::Relaxed),
            input_writes: self.counters.writes.load(Ordering::Relaxed),
            write_errors: self.counters.errors.load(Ordering::Relaxed),
            bytes_out: bytes,
            frames,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn request_stop(&mut self) {
        self.state = SessionState::Terminating;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub struct Registry {
    config: EngineConfig,
    dispatcher: Arc<Dispatcher>,
    sessions: HashMap<SessionId, SessionEntry>,
    ended: VecDeque<SessionInfo>,
    state_dir: Option<PathBuf>,
    rx: mpsc::Receiver<Command>,
    weak_tx: mpsc::WeakSender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Registry {
    /// Start the registry actor. Must be called inside a tokio runtime.
    pub fn spawn(config: EngineConfig, dispatcher: Dispatcher) -> (RegistryHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let state_dir = config.registry.state_dir.clone().filter(|dir| match fs::create_dir_all(dir) {
            Ok(()) => true,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot create state directory; session records disabled");
                false
            }
        });
        let registry = Registry {
            config,
            dispatcher: Arc::new(dispatcher),
            sessions: HashMap::new(),
            ended: VecDeque::new(),
            state_dir,
            rx,
            weak_tx: tx.downgrade(),
            shutdown: None,
        };
        let task = tokio::spawn(registry.run());
        (RegistryHandle { tx }, task)
    }

    async fn run(mut self) {
        let mut reap = time::interval(self.config.registry.reap_interval());
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);
        reap.tick().await;

        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else { break };
                    if self.handle(command) {
                        break;
                    }
                }
                _ = reap.tick() => {
                    self.reap_idle();
                    self.sweep_orphans();
                }
            }
        }
        debug!("registry stopped");
    }

    /// Returns `true` once the registry should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Create { spec, reply } => {
                let _ = reply.send(self.create(spec));
            }
            Command::Attach {
                session_id,
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.attach(session_id, connection_id));
            }
            Command::Detach {
                session_id,
                connection_id,
            } => self.detach(session_id, connection_id),
            Command::Terminate { session_id, reply } => match self.sessions.get_mut(&session_id) {
                Some(entry) => {
                    entry.waiters.push(reply);
                    if entry.state != SessionState::Terminating {
                        info!(session = %session_id, "terminating session");
                    }
                    entry.request_stop();
                }
                None => {
                    let _ = reply.send(Err(EngineError::SessionNotFound(session_id)));
                }
            },
            Command::Info { session_id, reply } => {
                let info = match self.sessions.get(&session_id) {
                    Some(entry) => Some(entry.info(session_id)),
                    None => self.ended.iter().find(|info| info.id == session_id).cloned(),
                };
                let _ = reply.send(info);
            }
            Command::List { reply } => {
                let mut list: Vec<_> = self.sessions.iter().map(|(id, entry)| entry.info(*id)).collect();
                list.sort_by_key(|info| info.created_at);
                let _ = reply.send(list);
            }
            Command::Subscribe { session_id, reply } => {
                let result = self
                    .sessions
                    .get(&session_id)
                    .map(|entry| entry.feed.subscribe())
                    .ok_or(EngineError::SessionNotFound(session_id));
                let _ = reply.send(result);
            }
            Command::SweepOrphans { reply } => {
                let _ = reply.send(self.sweep_orphans());
            }
            Command::Shutdown { reply } => {
                info!(sessions = self.sessions.len(), "registry shutting down");
                for entry in self.sessions.values_mut() {
                    entry.request_stop();
                }
                if self.sessions.is_empty() {
                    let _ = reply.send(());
                    return true;
                }
                self.shutdown = Some(reply);
            }
            Command::Exiting { session_id } => {
                if let Some(entry) = self.sessions.get_mut(&session_id) {
                    if entry.state == SessionState::Running {
                        debug!(session = %session_id, "session process exited");
                        entry.state = SessionState::Terminating;
                    }
                }
            }
            Command::Ended { session_id, exit_code } => {
                self.finish(session_id, exit_code);
                if self.sessions.is_empty() {
                    if let Some(reply) = self.shutdown.take() {
                        let _ = reply.send(());
                        return true;
                    }
                }
            }
        }
        false
    }

    fn create(&mut self, spec: SessionSpec) -> Result<SessionId> {
        if self.shutdown.is_some() {
            return Err(EngineError::RegistryClosed);
        }
        let registry_tx = self.weak_tx.upgrade().ok_or(EngineError::RegistryClosed)?;

        let process = Arc::new(PtyProcess::spawn(&spec, &self.config.spawn)?);
        let id = SessionId::new();
        let counters = Arc::new(InputCounters::default());
        let mut entry = SessionEntry {
            feed: Arc::new(OutputFeed::new(
                self.config.registry.scrollback_bytes,
                self.config.registry.broadcast_capacity,
            )),
            input: spawn_input_task(id, Arc::clone(&process), Arc::clone(&counters)),
            counters,
            started: Instant::now(),
            process,
            state: SessionState::Starting,
            connections: HashSet::new(),
            detached_since: Some(Instant::now()),
            created_at: unix_millis(),
            stop: None,
            waiters: Vec::new(),
        };

        let side_channel = &self.config.side_channel;
        let (dispatch, _) = self.dispatcher.spawn_session_task(id, side_channel.event_queue);
        let sink = SessionSink {
            interceptor: Interceptor::new(id, &side_channel.private_id, side_channel.residual_cap),
            dispatch,
            feed: Arc::clone(&entry.feed),
            forward_side_channel: side_channel.forward_to_clients,
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(supervise(SessionTask {
            id,
            process: Arc::clone(&entry.process),
            sink,
            flush: self.config.flush.policy(),
            termination: self.config.termination.policy(),
            stop: stop_rx,
            registry: registry_tx,
        }));
        entry.stop = Some(stop_tx);
        entry.state = SessionState::Running;

        self.write_record(id, &entry);
        info!(
            session = %id,
            pid = entry.process.pid(),
            shell = %entry.process.shell().display(),
            "session started"
        );
        self.sessions.insert(id, entry);
        Ok(id)
    }

    fn attach(&mut self, session_id: SessionId, connection_id: ConnectionId) -> Result<Attachment> {
        let entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(EngineError::SessionNotFound(session_id))?;
        if entry.state != SessionState::Running {
            return Err(EngineError::SessionClosed(session_id));
        }
        let (replay, events) = entry.feed.subscribe_with_replay();
        entry.connections.insert(connection_id);
        entry.detached_since = None;
        debug!(session = %session_id, connection = %connection_id, attached = entry.connections.len(), "connection attached");
        Ok(Attachment {
            session_id,
            connection_id,
            dimensions: entry.process.dimensions(),
            replay,
            events,
            input: entry.input.clone(),
        })
    }

    fn detach(&mut self, session_id: SessionId, connection_id: ConnectionId) {
        let Some(entry) = self.sessions.get_mut(&session_id) else {
            return;
        };
        if entry.connections.remove(&connection_id) {
            debug!(session = %session_id, connection = %connection_id, attached = entry.connections.len(), "connection detached");
        }
        if entry.connections.is_empty() && entry.detached_since.is_none() {
            entry.detached_since = Some(Instant::now());
        }
    }

    fn finish(&mut self, session_id: SessionId, exit_code: Option<i32>) {
        let Some(mut entry) = self.sessions.remove(&session_id) else {
            return;
        };
        entry.state = SessionState::Terminated;
        entry.feed.publish(SessionEvent::Exit { code: exit_code });
        self.remove_record(session_id);

        let mut info = entry.info(session_id);
        info.exit_code = exit_code;
        let stats = info.stats;
        self.ended.push_back(info);
        while self.ended.len() > ENDED_HISTORY {
            self.ended.pop_front();
        }

        for waiter in entry.waiters.drain(..) {
            let _ = waiter.send(Ok(exit_code));
        }
        info!(
            session = %session_id,
            exit_code = ?exit_code,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            frames = stats.frames,
            uptime_ms = stats.uptime_ms,
            "session terminated"
        );
    }

    fn reap_idle(&mut self) {
        let Some(idle_timeout) = self.config.registry.idle_timeout() else {
            return;
        };
        let now = Instant::now();
        for (id, entry) in self.sessions.iter_mut() {
            let idle = entry.state == SessionState::Running
                && entry
                    .detached_since
                    .is_some_and(|since| now.saturating_duration_since(since) >= idle_timeout);
            if idle {
                info!(session = %id, idle_secs = idle_timeout.as_secs(), "reaping detached session");
                entry.request_stop();
            }
        }
    }

    // ── Session records ─────────────────────────────────────────────

    fn record_path(&self, id: SessionId) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join(format!("{id}.json")))
    }

    fn write_record(&self, id: SessionId, entry: &SessionEntry) {
        let Some(path) = self.record_path(id) else {
            return;
        };
        let dims = entry.process.dimensions();
        let record = SessionRecord {
            id,
            pid: entry.process.pid(),
            shell: entry.process.shell().to_path_buf(),
            cwd: entry.process.cwd().to_path_buf(),
            cols: dims.cols,
            rows: dims.rows,
            created_at: entry.created_at,
            engine_pid: std::process::id(),
            start_ticks: entry.process.start_ticks(),
        };
        if let Err(err) = atomic_write_json(&path, &record) {
            warn!(session = %id, path = %path.display(), %err, "failed to write session record");
        }
    }

    fn remove_record(&self, id: SessionId) {
        if let Some(path) = self.record_path(id) {
            let _ = fs::remove_file(path);
        }
    }

    /// Kill processes named by records that no live table entry owns.
    fn sweep_orphans(&mut self) -> usize {
        let Some(dir) = self.state_dir.clone() else {
            return 0;
        };
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %dir.display(), %err, "cannot scan state directory");
                return 0;
            }
        };

        let own_pid = std::process::id();
        let mut found = 0;
        for path in entries.flatten().map(|e| e.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: SessionRecord = match fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(record) => record,
                None => {
                    debug!(path = %path.display(), "skipping unreadable session record");
                    continue;
                }
            };
            if self.sessions.contains_key(&record.id) {
                continue;
            }
            if record.engine_pid != own_pid && pty::pid_alive(record.engine_pid as i32) {
                // another live engine owns it
                continue;
            }

            let _ = fs::remove_file(&path);
            let same_process = pty::pid_alive(record.pid)
                && match record.start_ticks {
                    Some(ticks) => pty::process_start_ticks(record.pid) == Some(ticks),
                    None => true,
                };
            if !same_process {
                continue;
            }

            found += 1;
            warn!(session = %record.id, pid = record.pid, "terminating orphaned session process");
            let policy = self.config.termination.policy();
            tokio::spawn(async move {
                let report = pty::terminate_orphan(record.pid, &policy).await;
                debug!(pid = record.pid, forced = report.forced, "orphan terminated");
            });
        }
        found
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    id: SessionId,
    pid: i32,
    shell: PathBuf,
    cwd: PathBuf,
    cols: u16,
    rows: u16,
    created_at: u64,
    engine_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start_ticks: Option<u64>,
}

// ── Session supervisor ──────────────────────────────────────────────

/// Cleans each flush, fans it out, and queues side-channel events.
struct SessionSink {
    interceptor: Interceptor,
    dispatch: DispatchQueue,
    feed: Arc<OutputFeed>,
    forward_side_channel: bool,
}

impl FlushSink for SessionSink {
    fn flush(&mut self, flush: Flush) {
        let mut out = self.interceptor.process(&flush.bytes);
        if flush.reason == FlushReason::Terminating {
            out.clean.extend(self.interceptor.finish());
        }
        self.feed.publish_output(out.clean);
        for event in out.events {
            if self.forward_side_channel {
                self.feed.publish(SessionEvent::SideChannel(event.clone()));
            }
            self.dispatch.submit(event);
        }
    }
}

struct SessionTask {
    id: SessionId,
    process: Arc<PtyProcess>,
    sink: SessionSink,
    flush: FlushPolicy,
    termination: TerminationPolicy,
    stop: oneshot::Receiver<()>,
    registry: mpsc::Sender<Command>,
}

/// Runs for the life of one session: watches for a stop request, the PTY
/// closing, or the child exiting; then takes the process down, lets the
/// multiplexer do its final flush, and reports back.
async fn supervise(task: SessionTask) {
    let SessionTask {
        id,
        process,
        mut sink,
        flush,
        termination,
        mut stop,
        registry,
    } = task;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut reader = process.reader();
    let mut mux = tokio::spawn(async move { Multiplexer::new(flush).run(&mut reader, &mut sink, shutdown_rx).await });

    let mut exit_poll = time::interval(termination.poll_interval);
    exit_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut mux_result = None;
    let requested = loop {
        tokio::select! {
            _ = &mut stop => break true,
            result = &mut mux => {
                mux_result = Some(result);
                break false;
            }
            _ = exit_poll.tick() => {
                if process.try_wait().is_some() {
                    break false;
                }
            }
        }
    };

    if !requested {
        let _ = registry.send(Command::Exiting { session_id: id }).await;
    }

    let exit_code = if requested {
        process.terminate(&termination).await.exit_code
    } else if mux_result.is_some() {
        reap_after_eof(&process, &termination).await
    } else {
        process.try_wait()
    };

    let _ = shutdown_tx.send(true);
    let result = match mux_result {
        Some(result) => result,
        None => mux.await,
    };
    match result {
        Ok(summary) => {
            if let MuxExit::ReadError(err) = summary.exit {
                error!(session = %id, error = %EngineError::Read(err), "session output failed");
            }
            debug!(session = %id, frames = summary.frames, bytes = summary.bytes, "output closed");
        }
        Err(err) => error!(session = %id, %err, "multiplexer task failed"),
    }

    let _ = registry.send(Command::Ended { session_id: id, exit_code }).await;
}

/// The PTY closed. Usually the child is already exiting; give it a moment
/// before escalating.
async fn reap_after_eof(process: &PtyProcess, termination: &TerminationPolicy) -> Option<i32> {
    for _ in 0..20 {
        if let Some(code) = process.try_wait() {
            return Some(code);
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    process.terminate(termination).await.exit_code
}

// ── Utility functions ───────────────────────────────────────────────

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write to a temp file then rename, so readers never see a partial record.
fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)?;
    fs::rename(&tmp_path, path)
}

// ── Unit tests ──────────────────────────────────────────────────────
