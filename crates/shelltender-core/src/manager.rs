//! Session manager
//!
//! Owns every PTY child process. Each session gets a dedicated blocking
//! reader thread feeding an async loop; input and resize requests travel
//! over channels owned by that loop, so the PTY handle never leaves it.
//! Every output chunk is pushed synchronously through the pipeline, and a
//! per-session persistence task coalesces buffer snapshots to disk.

use crate::buffer::BufferManager;
use crate::error::{Result, ShelltenderError};
use crate::pipeline::{ChunkMetadata, Pipeline};
use crate::store::{SessionStore, StoredSession};
use chrono::Utc;
use portable_pty::{Child, CommandBuilder, NativePtySystem, PtySize, PtySystem};
use shelltender_types::{DataSource, Session, SessionOptions};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const PTY_READ_BUF: usize = 4096;
/// Snapshot writes triggered closer together than this are coalesced.
const PERSIST_COALESCE: Duration = Duration::from_millis(500);

/// Server-side lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Spawning,
    Running,
    Resizing,
    Terminating,
    Exited,
}

/// Lifecycle events pushed to subscribers (the multiplexer forwards these
/// as `exit` frames and performs cleanup).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session was killed or reaped by the server.
    SessionEnd {
        session_id: String,
        reason: Option<String>,
    },
    /// The PTY child exited on its own.
    Exited {
        session_id: String,
        exit_code: Option<i32>,
    },
}

/// Fixed set of special keys accepted by `send_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKey {
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Up,
    Down,
    Right,
    Left,
    Home,
    End,
    PageUp,
    PageDown,
    CtrlC,
    CtrlD,
    CtrlZ,
    CtrlL,
}

impl TerminalKey {
    pub fn bytes(self) -> &'static [u8] {
        match self {
            TerminalKey::Enter => b"\r",
            TerminalKey::Tab => b"\t",
            TerminalKey::Escape => b"\x1b",
            TerminalKey::Backspace => b"\x7f",
            TerminalKey::Delete => b"\x1b[3~",
            TerminalKey::Up => b"\x1b[A",
            TerminalKey::Down => b"\x1b[B",
            TerminalKey::Right => b"\x1b[C",
            TerminalKey::Left => b"\x1b[D",
            TerminalKey::Home => b"\x1b[H",
            TerminalKey::End => b"\x1b[F",
            TerminalKey::PageUp => b"\x1b[5~",
            TerminalKey::PageDown => b"\x1b[6~",
            TerminalKey::CtrlC => b"\x03",
            TerminalKey::CtrlD => b"\x04",
            TerminalKey::CtrlZ => b"\x1a",
            TerminalKey::CtrlL => b"\x0c",
        }
    }
}

struct SessionHandle {
    session: Arc<RwLock<Session>>,
    state: Arc<RwLock<SessionState>>,
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    shutdown_tx: mpsc::Sender<()>,
    /// Set after restoration until the first live PTY chunk arrives.
    restored: Arc<AtomicBool>,
    /// Set by `kill`/`suspend` so the PTY loop skips its natural-exit path.
    killed: Arc<AtomicBool>,
    last_output: Arc<std::sync::Mutex<Instant>>,
    dirty_tx: watch::Sender<u64>,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    store: Arc<SessionStore>,
    buffers: Arc<BufferManager>,
    pipeline: Arc<Pipeline>,
    events_tx: broadcast::Sender<SessionEvent>,
    max_sessions: usize,
}

/// See the module docs.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        buffers: Arc<BufferManager>,
        pipeline: Arc<Pipeline>,
        max_sessions: usize,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                store,
                buffers,
                pipeline,
                events_tx,
                max_sessions,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Create a session and spawn its PTY.
    pub async fn create(&self, options: SessionOptions) -> Result<Session> {
        let id = options.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        {
            let sessions = self.inner.sessions.read().await;
            if sessions.contains_key(&id) {
                return Err(ShelltenderError::SessionAlreadyExists(id));
            }
            if sessions.len() >= self.inner.max_sessions {
                return Err(ShelltenderError::Internal(format!(
                    "session limit reached ({})",
                    self.inner.max_sessions
                )));
            }
        }

        let cols = options.cols.unwrap_or(DEFAULT_COLS);
        let rows = options.rows.unwrap_or(DEFAULT_ROWS);
        validate_dimensions(cols, rows)?;

        let command = options
            .command
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let cwd = options.cwd.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string())
        });

        let mut env = options.env.clone();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        for key in ["LANG", "LC_ALL", "LC_CTYPE"] {
            env.entry(key.to_string())
                .or_insert_with(|| "en_US.UTF-8".to_string());
        }

        let mut locked = options.locked;
        if let Some(restrictions) = &options.restrictions {
            if let Some(root) = &restrictions.allowed_root {
                env.insert("SHELLTENDER_ALLOWED_ROOT".to_string(), root.clone());
            }
            if !restrictions.blocked_commands.is_empty() {
                env.insert(
                    "SHELLTENDER_BLOCKED_COMMANDS".to_string(),
                    restrictions.blocked_commands.join(":"),
                );
            }
            locked |= restrictions.read_only;
        }

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            created_at: now,
            last_accessed_at: now,
            cols,
            rows,
            command,
            args: options.args.clone(),
            cwd: cwd.clone(),
            env,
            locked,
            restrictions: options.restrictions.clone(),
        };

        // The record must exist before the PTY loop starts: a fast-exiting
        // child deletes its record on the way out, and a save racing in
        // afterwards would resurrect it.
        let stored = StoredSession {
            session: session.clone(),
            buffer: Vec::new(),
            last_sequence: 0,
            cwd,
            env: session.env.clone(),
            patterns: Vec::new(),
        };
        if let Err(e) = self.inner.store.save(&stored).await {
            // Persistence failures never fail a live session.
            warn!("failed to save initial record for {}: {}", id, e);
        }

        if let Err(e) = self.spawn_session(session.clone(), false).await {
            let _ = self.inner.store.delete(&id).await;
            return Err(e);
        }

        info!("created session {} ({})", id, session.command);
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(id) {
            Some(handle) => Some(handle.session.read().await.clone()),
            None => None,
        }
    }

    pub async fn get_all(&self) -> Vec<Session> {
        let sessions = self.inner.sessions.read().await;
        let mut result = Vec::with_capacity(sessions.len());
        for handle in sessions.values() {
            result.push(handle.session.read().await.clone());
        }
        result.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at));
        result
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(id)
    }

    pub async fn state(&self, id: &str) -> Option<SessionState> {
        let sessions = self.inner.sessions.read().await;
        match sessions.get(id) {
            Some(handle) => Some(*handle.state.read().await),
            None => None,
        }
    }

    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        validate_dimensions(cols, rows)?;
        let handle = self.handle(id).await?;
        {
            let mut state = handle.state.write().await;
            if *state == SessionState::Exited {
                return Err(ShelltenderError::SessionNotFound(id.to_string()));
            }
            *state = SessionState::Resizing;
        }
        handle
            .resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| ShelltenderError::SessionNotFound(id.to_string()))?;
        let mut session = handle.session.write().await;
        session.cols = cols;
        session.rows = rows;
        session.touch();
        Ok(())
    }

    /// Forward bytes to the PTY. Returns `false` when the write was refused
    /// (locked session and a non-admin source, or the PTY is gone).
    pub async fn write_input(&self, id: &str, data: &[u8], source: DataSource) -> Result<bool> {
        let handle = self.handle(id).await?;
        {
            let session = handle.session.read().await;
            if session.locked && source != DataSource::Admin {
                debug!("rejecting write to locked session {}", id);
                return Ok(false);
            }
        }
        if handle.input_tx.send(data.to_vec()).await.is_err() {
            return Ok(false);
        }
        handle.session.write().await.touch();
        Ok(true)
    }

    /// Typed convenience: send a command line, appending the newline.
    pub async fn send_command(&self, id: &str, command: &str) -> Result<bool> {
        let mut data = command.as_bytes().to_vec();
        data.push(b'\n');
        self.write_input(id, &data, DataSource::User).await
    }

    /// Typed convenience: send one special key as its escape sequence.
    pub async fn send_key(&self, id: &str, key: TerminalKey) -> Result<bool> {
        self.write_input(id, key.bytes(), DataSource::User).await
    }

    /// Kill the PTY, emit `SessionEnd`, drop the buffer and delete the
    /// stored record.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let handle = self
            .inner
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ShelltenderError::SessionNotFound(id.to_string()))?;

        *handle.state.write().await = SessionState::Terminating;
        handle.killed.store(true, Ordering::SeqCst);
        let _ = handle.shutdown_tx.send(()).await;

        self.inner.buffers.remove(id);
        if let Err(e) = self.inner.store.delete(id).await {
            warn!("failed to delete stored record for {}: {}", id, e);
        }
        let _ = self.inner.events_tx.send(SessionEvent::SessionEnd {
            session_id: id.to_string(),
            reason: None,
        });
        info!("killed session {}", id);
        Ok(())
    }

    /// Persist the session and stop its PTY, keeping the stored record so a
    /// later restart resurrects it. Used by the idle reaper.
    pub async fn suspend(&self, id: &str, reason: &str) -> Result<()> {
        let handle = self
            .inner
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ShelltenderError::SessionNotFound(id.to_string()))?;

        let snapshot = self.inner.buffers.get_full(id);
        if let Err(e) = self
            .inner
            .store
            .update_buffer(id, &snapshot.data, snapshot.last_seq)
            .await
        {
            warn!("failed to persist {} before suspend: {}", id, e);
        }

        *handle.state.write().await = SessionState::Terminating;
        handle.killed.store(true, Ordering::SeqCst);
        let _ = handle.shutdown_tx.send(()).await;
        self.inner.buffers.remove(id);

        let _ = self.inner.events_tx.send(SessionEvent::SessionEnd {
            session_id: id.to_string(),
            reason: Some(reason.to_string()),
        });
        info!("suspended session {} ({})", id, reason);
        Ok(())
    }

    /// Instant of the last PTY output, for the idle reaper.
    pub async fn last_output(&self, id: &str) -> Option<Instant> {
        let sessions = self.inner.sessions.read().await;
        sessions
            .get(id)
            .map(|handle| *handle.last_output.lock().unwrap())
    }

    /// Flush every live session's buffer to disk (graceful shutdown).
    pub async fn persist_all(&self) {
        let ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let snapshot = self.inner.buffers.get_full(&id);
            if let Err(e) = self
                .inner
                .store
                .update_buffer(&id, &snapshot.data, snapshot.last_seq)
                .await
            {
                warn!("failed to persist session {}: {}", id, e);
            }
        }
    }

    /// Respawn every persisted session. Buffers are seeded past the
    /// persisted high-water sequence and the stored bytes are replayed once
    /// through the pipeline tagged `restored`. A failed respawn deletes that
    /// record and never aborts the rest.
    pub async fn restore_all(&self) -> usize {
        let stored = self.inner.store.load_all().await;
        let mut restored_count = 0usize;

        for (id, record) in stored {
            let mut session = record.session.clone();
            session.touch();

            self.inner
                .buffers
                .seed(&id, &record.buffer, record.last_sequence);

            match self.spawn_session(session, true).await {
                Ok(()) => {
                    if !record.buffer.is_empty() {
                        // Synthetic replay: not persisted again (no dirty
                        // notification) and not pattern-scanned downstream.
                        self.inner.pipeline.process(
                            &id,
                            &record.buffer,
                            ChunkMetadata::from_source(DataSource::Restored),
                        );
                    }
                    restored_count += 1;
                    info!(
                        "restored session {} ({} buffered bytes, seq {})",
                        id,
                        record.buffer.len(),
                        record.last_sequence
                    );
                }
                Err(e) => {
                    error!("failed to respawn session {}: {}; dropping record", id, e);
                    self.inner.buffers.remove(&id);
                    let _ = self.inner.store.delete(&id).await;
                }
            }
        }
        restored_count
    }

    async fn handle(&self, id: &str) -> Result<Arc<SessionHandle>> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ShelltenderError::SessionNotFound(id.to_string()))
    }

    /// Open the PTY, spawn the child and start the I/O loop plus the
    /// persistence task.
    async fn spawn_session(&self, session: Session, restored: bool) -> Result<()> {
        let id = session.id.clone();
        let size = PtySize {
            rows: session.rows,
            cols: session.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        if !command_exists(&session.command) {
            return Err(ShelltenderError::ShellNotFound(session.command.clone()));
        }

        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(size)
            .map_err(|e| spawn_error(&session, e))?;

        let mut cmd = CommandBuilder::new(&session.command);
        cmd.args(&session.args);
        cmd.cwd(&session.cwd);
        for (key, value) in &session.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| classify_spawn_error(&session, e))?;
        debug!("spawned pid {:?} for session {}", child.process_id(), id);

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(100);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(10);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (dirty_tx, dirty_rx) = watch::channel(0u64);

        let handle = Arc::new(SessionHandle {
            session: Arc::new(RwLock::new(session)),
            state: Arc::new(RwLock::new(SessionState::Spawning)),
            input_tx,
            resize_tx,
            shutdown_tx,
            restored: Arc::new(AtomicBool::new(restored)),
            killed: Arc::new(AtomicBool::new(false)),
            last_output: Arc::new(std::sync::Mutex::new(Instant::now())),
            dirty_tx,
        });

        self.inner
            .sessions
            .write()
            .await
            .insert(id.clone(), handle.clone());

        spawn_persist_task(
            id.clone(),
            dirty_rx,
            self.inner.buffers.clone(),
            self.inner.store.clone(),
        );

        let loop_ctx = PtyLoopContext {
            session_id: id,
            inner: self.inner.clone(),
            handle,
        };
        tokio::spawn(run_pty_loop(pair, child, input_rx, resize_rx, shutdown_rx, loop_ctx));
        Ok(())
    }
}

fn validate_dimensions(cols: u16, rows: u16) -> Result<()> {
    use shelltender_types::session::MAX_DIMENSION;
    if cols == 0 || rows == 0 || cols >= MAX_DIMENSION || rows >= MAX_DIMENSION {
        return Err(ShelltenderError::InvalidMessage(format!(
            "terminal dimensions out of range: {cols}x{rows}"
        )));
    }
    Ok(())
}

fn spawn_error(session: &Session, error: anyhow::Error) -> ShelltenderError {
    ShelltenderError::PtySpawnFailed {
        command: session.command.clone(),
        args: session.args.clone(),
        cwd: session.cwd.clone(),
        platform: std::env::consts::OS,
        message: error.to_string(),
    }
}

fn command_exists(command: &str) -> bool {
    if command.contains('/') {
        return std::path::Path::new(command).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).exists()))
        .unwrap_or(false)
}

fn classify_spawn_error(session: &Session, error: anyhow::Error) -> ShelltenderError {
    let not_found = error
        .downcast_ref::<std::io::Error>()
        .map(|e| e.kind() == std::io::ErrorKind::NotFound)
        .unwrap_or_else(|| {
            let message = error.to_string();
            message.contains("No such file") || message.contains("ENOENT")
        });
    if not_found {
        ShelltenderError::ShellNotFound(session.command.clone())
    } else {
        spawn_error(session, error)
    }
}

/// Coalescing persistence: at most one write in flight per session, and a
/// burst of dirty notifications collapses into the newest snapshot.
fn spawn_persist_task(
    session_id: String,
    mut dirty_rx: watch::Receiver<u64>,
    buffers: Arc<BufferManager>,
    store: Arc<SessionStore>,
) {
    tokio::spawn(async move {
        while dirty_rx.changed().await.is_ok() {
            tokio::time::sleep(PERSIST_COALESCE).await;
            dirty_rx.borrow_and_update();
            let snapshot = buffers.get_full(&session_id);
            match store
                .update_buffer(&session_id, &snapshot.data, snapshot.last_seq)
                .await
            {
                Ok(_) => {}
                Err(ShelltenderError::SessionNotFound(_)) => break,
                Err(e) => warn!("failed to persist session {}: {}", session_id, e),
            }
        }
        debug!("persistence task for {} stopped", session_id);
    });
}

struct PtyLoopContext {
    session_id: String,
    inner: Arc<ManagerInner>,
    handle: Arc<SessionHandle>,
}

/// The dedicated PTY I/O loop. The blocking reader and writer each live on
/// their own blocking task; this loop owns the master handle for resizes.
async fn run_pty_loop(
    pair: portable_pty::PtyPair,
    mut child: Box<dyn Child + Send + Sync>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    mut resize_rx: mpsc::Receiver<(u16, u16)>,
    mut shutdown_rx: mpsc::Receiver<()>,
    ctx: PtyLoopContext,
) {
    let session_id = ctx.session_id.clone();

    let mut reader = match pair.master.try_clone_reader() {
        Ok(reader) => reader,
        Err(e) => {
            error!("failed to get PTY reader for {}: {}", session_id, e);
            return;
        }
    };
    let mut writer = match pair.master.take_writer() {
        Ok(writer) => writer,
        Err(e) => {
            error!("failed to get PTY writer for {}: {}", session_id, e);
            return;
        }
    };

    // Writer task: drains the input channel into the PTY.
    let writer_handle = tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    // Reader task: blocking reads feed the async loop through a channel.
    let (chunk_tx, mut chunk_rx) = mpsc::channel::<bytes::Bytes>(1000);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; PTY_READ_BUF];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if chunk_tx
                        .blocking_send(bytes::Bytes::copy_from_slice(&buf[..n]))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        tokio::select! {
            chunk = chunk_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if chunk.is_empty() {
                    continue;
                }
                if ctx.handle.restored.swap(false, Ordering::SeqCst) {
                    debug!("session {} saw first live output after restore", session_id);
                }
                {
                    let mut state = ctx.handle.state.write().await;
                    if matches!(*state, SessionState::Spawning | SessionState::Resizing) {
                        *state = SessionState::Running;
                    }
                }
                *ctx.handle.last_output.lock().unwrap() = Instant::now();

                // Synchronous fan-out: filters, processors, buffer append
                // and broadcast all happen before the next read.
                ctx.inner.pipeline.process(
                    &session_id,
                    &chunk,
                    ChunkMetadata::from_source(DataSource::Pty),
                );
                ctx.handle.dirty_tx.send_modify(|n| *n += 1);
            }

            resize = resize_rx.recv() => {
                let Some((cols, rows)) = resize else { break };
                if let Err(e) = pair.master.resize(PtySize { cols, rows, pixel_width: 0, pixel_height: 0 }) {
                    warn!("resize of {} failed: {}", session_id, e);
                }
                let mut state = ctx.handle.state.write().await;
                if *state == SessionState::Resizing {
                    *state = SessionState::Running;
                }
            }

            _ = shutdown_rx.recv() => {
                debug!("shutting down PTY for session {}", session_id);
                let _ = child.kill();
                break;
            }
        }
    }

    let exit_code = child.wait().ok().map(|status| status.exit_code() as i32);
    *ctx.handle.state.write().await = SessionState::Exited;
    writer_handle.abort();

    if ctx.handle.killed.load(Ordering::SeqCst) {
        info!("session {} terminated", session_id);
        return;
    }

    // Natural exit: notify subscribers, then clean up like a kill.
    info!("session {} exited with code {:?}", session_id, exit_code);
    ctx.inner.sessions.write().await.remove(&session_id);
    ctx.inner.buffers.remove(&session_id);
    if let Err(e) = ctx.inner.store.delete(&session_id).await {
        warn!("failed to delete record for exited session {}: {}", session_id, e);
    }
    let _ = ctx.inner.events_tx.send(SessionEvent::Exited {
        session_id,
        exit_code,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn new_manager(dir: &TempDir) -> (SessionManager, Arc<BufferManager>) {
        let store = Arc::new(SessionStore::new(dir.path()));
        store.init().await.unwrap();
        let buffers = Arc::new(BufferManager::new(1 << 20));
        let pipeline = Arc::new(Pipeline::new());

        // Wire the canonical data path: processed chunks land in the buffer
        // unless they are a restored replay (the buffer is seeded directly).
        let sink = buffers.clone();
        pipeline.on_data(move |event| {
            if event.metadata.source != DataSource::Restored {
                sink.append(&event.session_id, &event.processed_data);
            }
        });

        (
            SessionManager::new(store, buffers.clone(), pipeline, 10),
            buffers,
        )
    }

    async fn wait_for_output(buffers: &BufferManager, id: &str, needle: &[u8]) -> Vec<u8> {
        for _ in 0..100 {
            let snapshot = buffers.get_full(id);
            if snapshot
                .data
                .windows(needle.len().max(1))
                .any(|w| w == needle)
            {
                return snapshot.data;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {:?}", String::from_utf8_lossy(needle));
    }

    #[tokio::test]
    async fn create_streams_output_and_kill_deletes_record() {
        let dir = TempDir::new().unwrap();
        let (manager, buffers) = new_manager(&dir).await;

        let session = manager
            .create(SessionOptions {
                id: Some("s1".to_string()),
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), "printf READY; exec cat".to_string()],
                cwd: Some("/tmp".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(session.id, "s1");
        assert_eq!(session.env.get("TERM").unwrap(), "xterm-256color");

        wait_for_output(&buffers, "s1", b"READY").await;
        assert!(manager.exists("s1").await);
        assert!(buffers.last_seq("s1") >= 1);

        manager.kill("s1").await.unwrap();
        assert!(!manager.exists("s1").await);
        assert!(!dir.path().join("s1.json").exists());
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_dimensions() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = new_manager(&dir).await;
        let err = manager
            .create(SessionOptions {
                cols: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShelltenderError::InvalidMessage(_)));

        let err = manager
            .create(SessionOptions {
                rows: Some(1000),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShelltenderError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn missing_shell_reports_shell_not_found() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = new_manager(&dir).await;
        let err = manager
            .create(SessionOptions {
                command: Some("/definitely/not/a/shell".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShelltenderError::ShellNotFound(_)));
    }

    #[tokio::test]
    async fn locked_session_rejects_non_admin_writes() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = new_manager(&dir).await;
        manager
            .create(SessionOptions {
                id: Some("s1".to_string()),
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), "exec cat".to_string()],
                cwd: Some("/tmp".to_string()),
                locked: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(!manager
            .write_input("s1", b"nope\n", DataSource::User)
            .await
            .unwrap());
        assert!(manager
            .write_input("s1", b"ok\n", DataSource::Admin)
            .await
            .unwrap());
        manager.kill("s1").await.unwrap();
    }

    #[tokio::test]
    async fn suspend_then_restore_replays_buffer_and_advances_sequence() {
        let dir = TempDir::new().unwrap();
        let (manager, buffers) = new_manager(&dir).await;

        manager
            .create(SessionOptions {
                id: Some("s1".to_string()),
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), "printf HELLO; exec cat".to_string()],
                cwd: Some("/tmp".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        wait_for_output(&buffers, "s1", b"HELLO").await;
        let persisted_seq = buffers.last_seq("s1");

        manager.suspend("s1", "idle-timeout").await.unwrap();
        assert!(dir.path().join("s1.json").exists());

        // "Restart": a fresh manager over the same store.
        let (manager2, buffers2) = new_manager(&dir).await;
        let restored = manager2.restore_all().await;
        assert_eq!(restored, 1);

        // The respawned shell may already have produced fresh output, so the
        // seeded bytes are a prefix and the sequence never went backwards.
        let snapshot = buffers2.get_full("s1");
        assert!(snapshot.data.starts_with(b"HELLO"));
        assert!(snapshot.last_seq >= persisted_seq);

        // New output gets a strictly greater sequence.
        assert!(manager2
            .write_input("s1", b"x\n", DataSource::User)
            .await
            .unwrap());
        wait_for_output(&buffers2, "s1", b"x").await;
        assert!(buffers2.last_seq("s1") > persisted_seq);

        manager2.kill("s1").await.unwrap();
    }

    #[tokio::test]
    async fn failed_respawn_drops_only_that_record() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path()));
        store.init().await.unwrap();

        // Hand-craft a record whose command no longer exists.
        let now = Utc::now();
        let bad = StoredSession {
            session: Session {
                id: "ghost".to_string(),
                created_at: now,
                last_accessed_at: now,
                cols: 80,
                rows: 24,
                command: "/gone/shell".to_string(),
                args: vec![],
                cwd: "/tmp".to_string(),
                env: HashMap::new(),
                locked: false,
                restrictions: None,
            },
            buffer: b"old".to_vec(),
            last_sequence: 2,
            cwd: "/tmp".to_string(),
            env: HashMap::new(),
            patterns: vec![],
        };
        store.save(&bad).await.unwrap();

        let buffers = Arc::new(BufferManager::new(1 << 20));
        let pipeline = Arc::new(Pipeline::new());
        let manager = SessionManager::new(store.clone(), buffers, pipeline, 10);
        assert_eq!(manager.restore_all().await, 0);
        assert!(store.load("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn natural_exit_emits_event_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (manager, _buffers) = new_manager(&dir).await;
        let mut events = manager.subscribe_events();

        manager
            .create(SessionOptions {
                id: Some("short".to_string()),
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), "exit 7".to_string()],
                cwd: Some("/tmp".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for exit event")
            .unwrap();
        match event {
            SessionEvent::Exited {
                session_id,
                exit_code,
            } => {
                assert_eq!(session_id, "short");
                assert_eq!(exit_code, Some(7));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!manager.exists("short").await);
        assert!(!dir.path().join("short.json").exists());
    }

    #[tokio::test]
    async fn send_command_and_send_key_reach_the_pty() {
        let dir = TempDir::new().unwrap();
        let (manager, buffers) = new_manager(&dir).await;
        manager
            .create(SessionOptions {
                id: Some("typed".to_string()),
                command: Some("/bin/sh".to_string()),
                args: vec!["-c".to_string(), "exec cat".to_string()],
                cwd: Some("/tmp".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        // cat echoes the line back once the newline arrives.
        assert!(manager.send_command("typed", "marco").await.unwrap());
        wait_for_output(&buffers, "typed", b"marco").await;

        assert!(manager.send_key("typed", TerminalKey::Enter).await.unwrap());
        manager.kill("typed").await.unwrap();
    }

    #[test]
    fn terminal_keys_map_to_escape_sequences() {
        assert_eq!(TerminalKey::Enter.bytes(), b"\r");
        assert_eq!(TerminalKey::Up.bytes(), b"\x1b[A");
        assert_eq!(TerminalKey::CtrlC.bytes(), b"\x03");
        assert_eq!(TerminalKey::PageDown.bytes(), b"\x1b[6~");
    }
}
