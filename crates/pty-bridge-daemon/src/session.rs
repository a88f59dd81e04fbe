use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pty_bridge_terminal::{PtyError, PtyHandle, ReadEvent, SpawnSpec};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::SessionError;
use crate::registry::{Session, SessionInfo, SessionRegistry};

pub const TERM_PROGRAM: &str = "pty-bridge";
pub const SESSION_ID_ENV: &str = "PTY_BRIDGE_SESSION_ID";
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// 128 random bits as lowercase hex. Used for session ids and bearer tokens.
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn generate_session_id() -> String {
    generate_token()
}

#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    /// Program followed by its arguments. Empty means the configured default command.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    pub profile: Option<String>,
}

impl CreateSpec {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            ..Self::default()
        }
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub id: String,
    pub pid: Option<u32>,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    max_sessions: usize,
    read_buffer_bytes: usize,
    default_command: Vec<String>,
    create_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(registry: Arc<SessionRegistry>, config: &BridgeConfig) -> Self {
        Self {
            registry,
            max_sessions: config.max_sessions,
            read_buffer_bytes: config.read_buffer_bytes,
            default_command: config.command.clone(),
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Spawns a process on a new PTY and registers it.
    ///
    /// Nothing is registered unless the spawn succeeds end to end.
    pub async fn create(&self, spec: CreateSpec) -> Result<CreatedSession, SessionError> {
        if spec.rows == 0 || spec.cols == 0 {
            return Err(SessionError::InvalidSize {
                rows: spec.rows,
                cols: spec.cols,
            });
        }

        let _creating = self.create_lock.lock().await;
        if self.registry.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let id = generate_session_id();
        let argv = if spec.command.is_empty() {
            self.default_command.clone()
        } else {
            spec.command
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(SessionError::Pty(PtyError::spawn(
                "no command configured",
                pty_bridge_terminal::SpawnErrorKind::NotFound,
            )));
        };
        let display = shell_words::join(&argv);

        let mut pty_spec = SpawnSpec::new(program.clone())
            .args(args.iter().cloned())
            .size(spec.rows, spec.cols)
            .env("TERM_PROGRAM", TERM_PROGRAM)
            .env(SESSION_ID_ENV, id.clone());
        pty_spec.read_buffer_bytes = self.read_buffer_bytes;
        pty_spec.env.extend(spec.env);
        if let Some(cwd) = spec.cwd.or_else(home_dir) {
            pty_spec = pty_spec.cwd(cwd);
        }

        let spawned = tokio::task::spawn_blocking(move || PtyHandle::spawn(pty_spec))
            .await
            .map_err(PtyError::open)??;
        let pid = spawned.handle.pid();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let session = Arc::new(Session::new(
            id.clone(),
            spawned.handle,
            output_rx,
            display,
            spec.profile,
            spec.rows,
            spec.cols,
        ));
        self.registry.put(Arc::clone(&session));
        tokio::spawn(supervise(
            Arc::clone(&self.registry),
            Arc::clone(&session),
            spawned.output,
            output_tx,
            spawned.exit,
        ));

        info!(
            session_id = %id,
            pid = ?pid,
            command = %session.command(),
            rows = spec.rows,
            cols = spec.cols,
            "Session created"
        );
        Ok(CreatedSession { id, pid })
    }

    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    pub fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<(), SessionError> {
        if rows == 0 || cols == 0 {
            return Err(SessionError::InvalidSize { rows, cols });
        }
        let session = self.get(id)?;
        session.resize(rows, cols)?;
        debug!(session_id = %id, rows, cols, "Session resized");
        Ok(())
    }

    /// Tears a session down. Returns false if it was already gone.
    pub fn close(&self, id: &str) -> bool {
        match self.registry.remove(id) {
            Some(session) => {
                session.shutdown();
                info!(session_id = %id, "Session closed");
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) -> usize {
        let sessions = self.registry.drain();
        for session in &sessions {
            session.shutdown();
        }
        if !sessions.is_empty() {
            info!(count = sessions.len(), "Closed all sessions");
        }
        sessions.len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .registry
            .list()
            .iter()
            .map(|session| session.info())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

#[derive(Debug)]
enum EndReason {
    Exited(Option<u32>),
    ReadEof,
    ReadError(String),
    Closed,
}

/// Pumps raw PTY output into the session's stream and tears the session down when
/// the child exits, the reader stops, or the session is closed.
async fn supervise(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    mut raw: mpsc::Receiver<ReadEvent>,
    output: mpsc::Sender<ReadEvent>,
    mut exit: oneshot::Receiver<Option<u32>>,
) {
    let mut closed = session.closed();
    let reason = loop {
        tokio::select! {
            code = &mut exit => {
                drain_after_exit(&mut raw, &output).await;
                break EndReason::Exited(code.ok().flatten());
            }
            _ = wait_closed(&mut closed) => break EndReason::Closed,
            event = raw.recv() => match event {
                Some(ReadEvent::Data(data)) => {
                    tokio::select! {
                        sent = output.send(ReadEvent::Data(data)) => {
                            if sent.is_err() {
                                break EndReason::Closed;
                            }
                        }
                        code = &mut exit => {
                            drain_after_exit(&mut raw, &output).await;
                            break EndReason::Exited(code.ok().flatten());
                        }
                        _ = wait_closed(&mut closed) => break EndReason::Closed,
                    }
                }
                Some(ReadEvent::Eof) | None => break EndReason::ReadEof,
                Some(ReadEvent::Error(err)) => break EndReason::ReadError(err),
            },
        }
    };

    let last = match &reason {
        EndReason::ReadError(err) => ReadEvent::Error(err.clone()),
        _ => ReadEvent::Eof,
    };
    let _ = output.try_send(last);

    let removed = registry.remove(session.id()).is_some();
    session.shutdown();
    match reason {
        EndReason::ReadError(ref err) => {
            warn!(session_id = %session.id(), error = %err, "Session ended on PTY read error")
        }
        _ => info!(session_id = %session.id(), reason = ?reason, removed, "Session ended"),
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Forwards output the child wrote just before exiting.
async fn drain_after_exit(raw: &mut mpsc::Receiver<ReadEvent>, output: &mpsc::Sender<ReadEvent>) {
    let deadline = Instant::now() + EXIT_DRAIN_GRACE;
    while let Ok(Some(ReadEvent::Data(data))) = tokio::time::timeout_at(deadline, raw.recv()).await
    {
        let sent = tokio::time::timeout_at(deadline, output.send(ReadEvent::Data(data))).await;
        if !matches!(sent, Ok(Ok(()))) {
            break;
        }
    }
}
