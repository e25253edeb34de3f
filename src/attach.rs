//! PTY supervision with Unix-socket attach
//!
//! An [`AttachServer`] runs one process under a pseudo-terminal and lets any
//! number of clients watch and drive it over a Unix socket. Recent output is
//! kept in a ring buffer so late attachers see what they missed.
//!
//! ```text
//!   PTY reader thread ─┐                 ┌─► writer task ─► client A
//!                      ├─► pump task ─► lock ─► writer task ─► client B
//!   waiter thread ─────┘        ▲        └─► ...
//!                               │
//!   client reader tasks ────────┘
//! ```
//!
//! All mutations of the ring buffer and client table go through one lock
//! that is never held across an await. Each client has a bounded frame
//! queue; a client whose queue is full or closed is dropped on its own.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AttachConfig;
use crate::protocol::{
    encode_with_limit, signal_name, ClientMessage, FrameDecoder, LifecycleState, ProtocolError,
    ServerMessage, Signal, StateSnapshot,
};
use crate::ring_buffer::RingBuffer;

/// How long the waiter lets the PTY reader drain after the process exits
const READER_DRAIN: Duration = Duration::from_millis(100);
/// A single frame write slower than this drops the client
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on the JSON around a `history` frame's base64 data
const HISTORY_ENVELOPE_BYTES: usize = 64;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("Cannot start from state {0:?}")]
    InvalidState(LifecycleState),

    #[error("Another server is listening on {0}")]
    SocketInUse(PathBuf),

    #[error("Socket error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {command}: {reason:#}")]
    Spawn {
        command: String,
        reason: anyhow::Error,
    },

    #[error("PTY error: {0:#}")]
    Pty(anyhow::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// What to run and how to serve it
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Session id, usually the agent id
    pub id: String,
    pub socket_path: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub ring_buffer_bytes: usize,
    pub stop_timeout: Duration,
    pub exit_grace: Duration,
    pub client_queue_frames: usize,
    pub max_frame_bytes: usize,
    /// Remove the socket's directory on exit once nothing else is in it
    pub remove_empty_parent: bool,
}

impl AttachOptions {
    pub fn new(
        id: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        command: impl Into<String>,
    ) -> Self {
        Self::from_config(&AttachConfig::default(), id, socket_path, command)
    }

    pub fn from_config(
        config: &AttachConfig,
        id: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            socket_path: socket_path.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            cols: config.cols,
            rows: config.rows,
            ring_buffer_bytes: config.ring_buffer_bytes,
            stop_timeout: config.stop_timeout(),
            exit_grace: config.exit_grace(),
            client_queue_frames: config.client_queue_frames,
            max_frame_bytes: config.max_frame_bytes,
            remove_empty_parent: true,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Ring size actually used: the whole history must fit one frame
    pub fn history_capacity(&self) -> usize {
        let fits = self.max_frame_bytes.saturating_sub(HISTORY_ENVELOPE_BYTES) / 4 * 3;
        self.ring_buffer_bytes.min(fits)
    }
}

enum PtyEvent {
    Output(Vec<u8>),
    Exit {
        code: Option<i32>,
        signal: Option<String>,
    },
}

struct Connection {
    frames: mpsc::Sender<Vec<u8>>,
    /// Set once the connection sent `attach`
    client_id: Option<String>,
    /// Dropping this ends the connection's reader task
    _hangup: oneshot::Sender<()>,
}

struct Shared {
    state: LifecycleState,
    pid: Option<u32>,
    exit_code: Option<i32>,
    exit_signal: Option<String>,
    cols: u16,
    rows: u16,
    ring: RingBuffer,
    connections: HashMap<u64, Connection>,
    master: Option<Box<dyn MasterPty + Send>>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    accept: Option<JoinHandle<()>>,
}

impl Shared {
    fn client_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.client_id.is_some())
            .count()
    }

    /// Queue a frame; a full or closed queue drops the connection
    fn enqueue(&mut self, conn: u64, frame: Vec<u8>) -> bool {
        let Some(connection) = self.connections.get(&conn) else {
            return false;
        };
        if connection.frames.try_send(frame).is_ok() {
            return true;
        }
        self.connections.remove(&conn);
        false
    }
}

struct Inner {
    options: AttachOptions,
    shared: Mutex<Shared>,
    next_conn: AtomicU64,
    state_tx: watch::Sender<LifecycleState>,
    closed_tx: watch::Sender<bool>,
}

/// Supervises one process under a PTY and serves it over a Unix socket
pub struct AttachServer {
    inner: Arc<Inner>,
}

impl AttachServer {
    pub fn new(options: AttachOptions) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Stopped);
        let (closed_tx, _) = watch::channel(false);
        let capacity = options.history_capacity();
        if capacity < options.ring_buffer_bytes {
            warn!(
                agent_id = %options.id,
                requested = options.ring_buffer_bytes,
                capacity,
                max_frame_bytes = options.max_frame_bytes,
                "Ring buffer shrunk to fit one history frame"
            );
        }
        let shared = Shared {
            state: LifecycleState::Stopped,
            pid: None,
            exit_code: None,
            exit_signal: None,
            cols: options.cols,
            rows: options.rows,
            ring: RingBuffer::new(capacity),
            connections: HashMap::new(),
            master: None,
            stdin: None,
            accept: None,
        };

        Self {
            inner: Arc::new(Inner {
                options,
                shared: Mutex::new(shared),
                next_conn: AtomicU64::new(1),
                state_tx,
                closed_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.options.id
    }

    pub fn socket_path(&self) -> &Path {
        &self.inner.options.socket_path
    }

    /// Bind the socket, then spawn the process
    ///
    /// Only valid from `stopped`. On failure the server is back in
    /// `stopped` and whatever it created is removed again.
    pub async fn start(&self) -> Result<(), AttachError> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != LifecycleState::Stopped {
                return Err(AttachError::InvalidState(shared.state));
            }
            shared.state = LifecycleState::Starting;
        }
        self.inner.state_tx.send_replace(LifecycleState::Starting);

        let listener = match self.inner.bind().await {
            Ok(listener) => listener,
            Err(err) => {
                self.inner.abort_start(false);
                return Err(err);
            }
        };

        let accept = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));
        self.inner.shared.lock().accept = Some(accept);

        if let Err(err) = Inner::spawn_process(&self.inner) {
            warn!(agent_id = %self.id(), error = %err, "Failed to start supervised process");
            self.inner.abort_start(true);
            return Err(err);
        }
        Ok(())
    }

    /// Stop with SIGTERM
    pub async fn stop(&self) {
        self.stop_with(Signal::Terminate).await
    }

    /// Send `signal`, wait for the stop timeout, then escalate to SIGKILL
    ///
    /// A no-op unless the process is running.
    pub async fn stop_with(&self, signal: Signal) {
        let pid = {
            let mut shared = self.inner.shared.lock();
            if shared.state != LifecycleState::Running {
                return;
            }
            shared.state = LifecycleState::Exiting;
            shared.pid
        };
        self.inner.state_tx.send_replace(LifecycleState::Exiting);

        let Some(pid) = pid else {
            return;
        };
        info!(agent_id = %self.id(), pid, signal = signal.name(), "Stopping supervised process");
        if let Err(e) = send_signal(pid, signal) {
            warn!(agent_id = %self.id(), pid, error = %e, "Failed to signal process");
        }

        let timeout = self.inner.options.stop_timeout;
        let mut state = self.inner.state_tx.subscribe();
        let exited = tokio::time::timeout(timeout, state.wait_for(|s| *s == LifecycleState::Exited));
        if exited.await.is_ok() {
            return;
        }

        warn!(agent_id = %self.id(), pid, "Process ignored {}, sending SIGKILL", signal.name());
        if let Err(e) = send_signal(pid, Signal::Kill) {
            warn!(agent_id = %self.id(), pid, error = %e, "Failed to kill process");
        }
        let killed = tokio::time::timeout(timeout, state.wait_for(|s| *s == LifecycleState::Exited));
        if killed.await.is_err() {
            warn!(agent_id = %self.id(), pid, "Process still running after SIGKILL");
        }
    }

    pub fn state(&self) -> StateSnapshot {
        self.inner.snapshot(&self.inner.shared.lock())
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.shared.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the process has exited; never returns for a server that
    /// was not started
    pub async fn wait_for_exit(&self) -> StateSnapshot {
        let mut state = self.inner.state_tx.subscribe();
        let _ = state.wait_for(|s| *s == LifecycleState::Exited).await;
        self.state()
    }

    /// Wait until the socket file has been cleaned up after exit
    pub async fn wait_closed(&self) {
        let mut closed = self.inner.closed_tx.subscribe();
        let _ = closed.wait_for(|done| *done).await;
    }
}

impl Inner {
    fn snapshot(&self, shared: &Shared) -> StateSnapshot {
        StateSnapshot {
            id: self.options.id.clone(),
            state: shared.state,
            pid: shared.pid,
            exit_code: shared.exit_code,
            exit_signal: shared.exit_signal.clone(),
            client_count: shared.client_count(),
            buffer_size: shared.ring.len(),
        }
    }

    fn encode(&self, message: &ServerMessage) -> Option<Vec<u8>> {
        match encode_with_limit(message, self.options.max_frame_bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(agent_id = %self.options.id, error = %e, "Dropping unencodable frame");
                None
            }
        }
    }

    async fn bind(&self) -> Result<UnixListener, AttachError> {
        let path = &self.options.socket_path;
        let io_err = |source| AttachError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        if tokio::fs::symlink_metadata(path).await.is_ok() {
            if UnixStream::connect(path).await.is_ok() {
                return Err(AttachError::SocketInUse(path.clone()));
            }
            debug!(path = %path.display(), "Removing stale socket");
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }

        let listener = UnixListener::bind(path).map_err(io_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        debug!(agent_id = %self.options.id, path = %path.display(), "Attach socket bound");
        Ok(listener)
    }

    fn spawn_process(this: &Arc<Self>) -> Result<(), AttachError> {
        let options = &this.options;
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(AttachError::Pty)?;

        let mut cmd = CommandBuilder::new(&options.command);
        cmd.args(&options.args);
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }
        if !options.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|reason| AttachError::Spawn {
                command: options.command.clone(),
                reason,
            })?;
        drop(pair.slave);
        let pid = child.process_id();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let threads = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)))
            .and_then(|(reader, writer)| {
                spawn_io_threads(&options.id, reader, writer, stdin_rx, child, events_tx)
                    .map_err(Into::into)
            });
        if let Err(e) = threads {
            if let Some(pid) = pid {
                let _ = send_signal(pid, Signal::Kill);
            }
            return Err(AttachError::Pty(e));
        }

        tokio::spawn(pump(Arc::clone(this), events_rx));

        let became_running = {
            let mut shared = this.shared.lock();
            shared.pid = pid;
            if shared.state == LifecycleState::Starting {
                shared.state = LifecycleState::Running;
                shared.master = Some(pair.master);
                shared.stdin = Some(stdin_tx);
                true
            } else {
                false
            }
        };
        if became_running {
            this.state_tx.send_replace(LifecycleState::Running);
        }

        info!(
            agent_id = %options.id,
            pid = ?pid,
            command = %options.command,
            "Supervised process started"
        );
        Ok(())
    }

    fn abort_start(&self, bound: bool) {
        let accept = {
            let mut shared = self.shared.lock();
            shared.state = LifecycleState::Stopped;
            shared.pid = None;
            shared.master = None;
            shared.stdin = None;
            shared.connections.clear();
            shared.accept.take()
        };
        if let Some(accept) = accept {
            accept.abort();
        }
        if bound {
            self.remove_socket();
        }
        self.state_tx.send_replace(LifecycleState::Stopped);
    }

    fn open_connection(self: &Arc<Self>, stream: UnixStream) {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::channel(self.options.client_queue_frames.max(1));
        let (hangup_tx, hangup_rx) = oneshot::channel();

        {
            let mut shared = self.shared.lock();
            if shared.state == LifecycleState::Exited {
                return;
            }
            shared.connections.insert(
                conn,
                Connection {
                    frames: frames_tx,
                    client_id: None,
                    _hangup: hangup_tx,
                },
            );
        }
        debug!(agent_id = %self.options.id, conn, "Connection accepted");

        tokio::spawn(write_frames(writer, frames_rx));
        tokio::spawn(serve_connection(Arc::clone(self), conn, reader, hangup_rx));
    }

    fn drop_connection(&self, conn: u64) {
        if self.shared.lock().connections.remove(&conn).is_some() {
            debug!(agent_id = %self.options.id, conn, "Connection closed");
        }
    }

    /// Returns false when the connection should close
    fn handle_message(&self, conn: u64, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Attach {
                client_id,
                cols,
                rows,
            } => {
                self.attach(conn, client_id, cols, rows);
                true
            }
            ClientMessage::Detach { client_id } => {
                debug!(agent_id = %self.options.id, client_id = %client_id, "Client detached");
                self.drop_connection(conn);
                false
            }
            ClientMessage::Resize { cols, rows } => {
                self.resize(&mut self.shared.lock(), cols, rows);
                true
            }
            ClientMessage::Signal { signal } => {
                self.forward_signal(signal);
                true
            }
            ClientMessage::Stdin { data } => {
                let shared = self.shared.lock();
                if shared.state == LifecycleState::Running {
                    if let Some(stdin) = &shared.stdin {
                        let _ = stdin.send(data);
                    }
                }
                true
            }
        }
    }

    fn attach(&self, conn: u64, client_id: String, cols: Option<u16>, rows: Option<u16>) {
        let mut shared = self.shared.lock();

        let replaced: Vec<u64> = shared
            .connections
            .iter()
            .filter(|(id, c)| **id != conn && c.client_id.as_deref() == Some(client_id.as_str()))
            .map(|(id, _)| *id)
            .collect();
        for id in replaced {
            debug!(agent_id = %self.options.id, client_id = %client_id, "Replacing earlier connection");
            shared.connections.remove(&id);
        }

        match shared.connections.get_mut(&conn) {
            Some(connection) => connection.client_id = Some(client_id.clone()),
            None => return,
        }

        let history = self.encode(&ServerMessage::History {
            data: shared.ring.contents(),
        });
        let state = self.encode(&ServerMessage::State(self.snapshot(&shared)));
        for frame in [history, state].into_iter().flatten() {
            if !shared.enqueue(conn, frame) {
                return;
            }
        }
        info!(
            agent_id = %self.options.id,
            client_id = %client_id,
            clients = shared.client_count(),
            "Client attached"
        );

        if cols.is_some() || rows.is_some() {
            let cols = cols.unwrap_or(shared.cols);
            let rows = rows.unwrap_or(shared.rows);
            self.resize(&mut shared, cols, rows);
        }
    }

    fn resize(&self, shared: &mut Shared, cols: u16, rows: u16) {
        if shared.state != LifecycleState::Running || cols == 0 || rows == 0 {
            return;
        }
        let result = match shared.master.as_ref() {
            Some(master) => master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }),
            None => return,
        };
        match result {
            Ok(()) => {
                shared.cols = cols;
                shared.rows = rows;
            }
            Err(e) => warn!(agent_id = %self.options.id, error = %e, "Resize failed"),
        }
    }

    fn forward_signal(&self, signal: Signal) {
        let pid = {
            let shared = self.shared.lock();
            match shared.state {
                LifecycleState::Running | LifecycleState::Exiting => shared.pid,
                _ => None,
            }
        };
        if let Some(pid) = pid {
            debug!(agent_id = %self.options.id, pid, signal = signal.name(), "Forwarding signal");
            if let Err(e) = send_signal(pid, signal) {
                warn!(agent_id = %self.options.id, pid, error = %e, "Failed to forward signal");
            }
        }
    }

    fn broadcast_output(&self, data: &[u8]) {
        let frame = self.encode(&ServerMessage::output(data));
        let mut shared = self.shared.lock();
        shared.ring.push(data);

        let Some(frame) = frame else {
            return;
        };
        let attached: Vec<u64> = shared
            .connections
            .iter()
            .filter(|(_, c)| c.client_id.is_some())
            .map(|(id, _)| *id)
            .collect();
        for conn in attached {
            if !shared.enqueue(conn, frame.clone()) {
                warn!(agent_id = %self.options.id, conn, "Dropping client that stopped reading");
            }
        }
    }

    /// Send a best-effort error frame, then close the connection
    fn reject(&self, conn: u64, err: &ProtocolError) {
        warn!(agent_id = %self.options.id, conn, error = %err, "Closing connection after protocol error");
        let frame = self.encode(&ServerMessage::error(err.to_string()));
        let mut shared = self.shared.lock();
        if let Some(frame) = frame {
            shared.enqueue(conn, frame);
        }
        shared.connections.remove(&conn);
    }

    fn finish(&self, code: Option<i32>, signal: Option<String>) {
        let exit = self.encode(&ServerMessage::Exit {
            code,
            signal: signal.clone(),
        });

        let accept = {
            let mut shared = self.shared.lock();
            shared.state = LifecycleState::Exited;
            shared.exit_code = code;
            shared.exit_signal = signal.clone();
            shared.master = None;
            shared.stdin = None;
            for (_, connection) in shared.connections.drain() {
                if let (Some(frame), Some(_)) = (&exit, &connection.client_id) {
                    let _ = connection.frames.try_send(frame.clone());
                }
            }
            shared.accept.take()
        };
        if let Some(accept) = accept {
            accept.abort();
        }
        self.state_tx.send_replace(LifecycleState::Exited);

        info!(
            agent_id = %self.options.id,
            code = ?code,
            signal = ?signal,
            "Supervised process exited"
        );
    }

    fn remove_socket(&self) {
        let path = &self.options.socket_path;
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed attach socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove attach socket"),
        }

        if self.options.remove_empty_parent {
            if let Some(parent) = path.parent() {
                // Fails while other sockets remain
                if std::fs::remove_dir(parent).is_ok() {
                    debug!(path = %parent.display(), "Removed empty socket directory");
                }
            }
        }
    }
}

async fn pump(inner: Arc<Inner>, mut events: mpsc::UnboundedReceiver<PtyEvent>) {
    let (code, signal) = loop {
        match events.recv().await {
            Some(PtyEvent::Output(data)) => inner.broadcast_output(&data),
            Some(PtyEvent::Exit { code, signal }) => break (code, signal),
            None => break (None, None),
        }
    };

    inner.finish(code, signal);
    tokio::time::sleep(inner.options.exit_grace).await;
    inner.remove_socket();
    inner.closed_tx.send_replace(true);
}

async fn accept_loop(inner: Arc<Inner>, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => inner.open_connection(stream),
            Err(e) => {
                warn!(agent_id = %inner.options.id, error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_connection(
    inner: Arc<Inner>,
    conn: u64,
    mut reader: OwnedReadHalf,
    mut hangup: oneshot::Receiver<()>,
) {
    let mut decoder = FrameDecoder::<ClientMessage>::with_max_payload(inner.options.max_frame_bytes);
    let mut buf = vec![0u8; 8192];

    loop {
        let n = tokio::select! {
            _ = &mut hangup => return,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(agent_id = %inner.options.id, conn, error = %e, "Read failed");
                    break;
                }
            },
        };

        decoder.push(&buf[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(message)) => {
                    if !inner.handle_message(conn, message) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    inner.reject(conn, &err);
                    return;
                }
            }
        }
    }

    inner.drop_connection(conn);
}

async fn write_frames(mut writer: OwnedWriteHalf, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.recv().await {
        match tokio::time::timeout(CLIENT_WRITE_TIMEOUT, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }
    let _ = writer.shutdown().await;
}

fn spawn_io_threads(
    id: &str,
    mut reader: Box<dyn Read + Send>,
    mut writer: Box<dyn Write + Send>,
    mut stdin: mpsc::UnboundedReceiver<Vec<u8>>,
    child: Box<dyn Child + Send + Sync>,
    events: mpsc::UnboundedSender<PtyEvent>,
) -> std::io::Result<()> {
    let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();

    let output = events.clone();
    std::thread::Builder::new()
        .name(format!("pty-read-{id}"))
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output.send(PtyEvent::Output(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the last slave fd closes
                    Err(_) => break,
                }
            }
            let _ = drained_tx.send(());
        })?;

    std::thread::Builder::new()
        .name(format!("pty-write-{id}"))
        .spawn(move || {
            while let Some(data) = stdin.blocking_recv() {
                if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                    break;
                }
            }
        })?;

    std::thread::Builder::new()
        .name(format!("pty-wait-{id}"))
        .spawn(move || {
            let (code, signal) = wait_child(child);
            let _ = drained_rx.recv_timeout(READER_DRAIN);
            let _ = events.send(PtyEvent::Exit { code, signal });
        })?;

    Ok(())
}

/// Reap the child and decode how it ended
fn wait_child(mut child: Box<dyn Child + Send + Sync>) -> (Option<i32>, Option<String>) {
    let Some(pid) = child.process_id() else {
        return match child.wait() {
            Ok(status) => (Some(status.exit_code() as i32), None),
            Err(_) => (None, None),
        };
    };

    let pid = pid as libc::pid_t;
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waiting on our own child with a valid status pointer
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        if rc == -1 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return (None, None);
    }

    if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(signal_name(libc::WTERMSIG(status))))
    } else {
        (None, None)
    }
}

/// Signal the process group led by `pid`, falling back to the process itself
///
/// Signalling a process that is already gone succeeds.
pub fn send_signal(pid: u32, signal: Signal) -> std::io::Result<()> {
    let pid = pid as libc::pid_t;
    // SAFETY: kill has no memory-safety preconditions
    if unsafe { libc::kill(-pid, signal.as_raw()) } == 0 {
        return Ok(());
    }
    if unsafe { libc::kill(pid, signal.as_raw()) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}
