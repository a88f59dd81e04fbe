use std::ffi::OsStr;
use std::io;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::MasterPty;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use pty_bridge_common::mutex_lock_or_recover;

use crate::error::{PtyError, SpawnErrorKind};

pub const DEFAULT_READ_BUFFER_BYTES: usize = 4096;
const PTY_READ_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEvent {
    Data(Vec<u8>),
    Eof,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
    pub read_buffer_bytes: usize,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A freshly spawned PTY: the handle plus the receiving ends of its reader and exit threads.
#[derive(Debug)]
pub struct SpawnedPty {
    pub handle: PtyHandle,
    pub output: mpsc::Receiver<ReadEvent>,
    /// Resolves with the exit code once the child is reaped (`None` if waiting failed).
    pub exit: oneshot::Receiver<Option<u32>>,
}

pub struct PtyHandle {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Resolves the executable, opens a PTY, and starts the child with its reader and
    /// exit-waiter threads.
    pub fn spawn(spec: SpawnSpec) -> Result<SpawnedPty, PtyError> {
        let path_var = spec
            .env
            .iter()
            .rev()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| std::ffi::OsString::from(value))
            .or_else(|| std::env::var_os("PATH"));
        let program = resolve_executable(&spec.program, path_var.as_deref(), spec.cwd.as_deref())?;

        let size = PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = native_pty_system().openpty(size).map_err(PtyError::open)?;

        let mut cmd = CommandBuilder::new(&program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair.slave.spawn_command(cmd).map_err(|e| {
            let kind = e
                .downcast_ref::<io::Error>()
                .map(SpawnErrorKind::from_io)
                .unwrap_or(SpawnErrorKind::Other);
            PtyError::spawn(e, kind)
        })?;
        drop(pair.slave);

        let pid = child.process_id();
        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(err) => {
                if let Err(kill_err) = child.kill() {
                    warn!(pid = ?pid, error = %kill_err, "Failed to kill child after PTY setup error");
                }
                let _ = child.wait();
                return Err(PtyError::open(err));
            }
        };

        let killer = child.clone_killer();
        let output = spawn_reader(reader, spec.read_buffer_bytes.max(1));
        let exited = Arc::new(AtomicBool::new(false));
        let exit = spawn_exit_waiter(child, Arc::clone(&exited));

        debug!(pid = ?pid, program = %program.display(), rows = spec.rows, cols = spec.cols, "PTY spawned");

        Ok(SpawnedPty {
            handle: PtyHandle {
                master: Mutex::new(pair.master),
                writer: Arc::new(Mutex::new(writer)),
                killer: Mutex::new(killer),
                exited,
                pid,
            },
            output,
            exit,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Blocking write of the whole buffer.
    pub fn write_all(&self, data: &[u8]) -> Result<(), PtyError> {
        write_all_locked(&self.writer, data)
    }

    /// Writes on the blocking pool so a stalled PTY cannot park a runtime worker.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        if data.is_empty() {
            return Ok(());
        }
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || write_all_locked(&writer, &data))
            .await
            .map_err(|e| PtyError::Write {
                reason: e.to_string(),
                source: None,
            })?
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        mutex_lock_or_recover(&self.master)
            .resize(size)
            .map_err(|e| PtyError::Resize {
                reason: e.to_string(),
            })
    }

    /// Size as reported by the PTY itself, `(rows, cols)`.
    pub fn size(&self) -> Result<(u16, u16), PtyError> {
        let size = mutex_lock_or_recover(&self.master)
            .get_size()
            .map_err(|e| PtyError::Resize {
                reason: e.to_string(),
            })?;
        Ok((size.rows, size.cols))
    }

    pub fn kill(&self) -> Result<(), PtyError> {
        if self.has_exited() {
            return Ok(());
        }
        mutex_lock_or_recover(&self.killer)
            .kill()
            .map_err(|e| PtyError::spawn(e, SpawnErrorKind::Other))
    }
}

fn write_all_locked(writer: &Mutex<Box<dyn Write + Send>>, data: &[u8]) -> Result<(), PtyError> {
    let mut writer = mutex_lock_or_recover(writer);
    let mut offset = 0;
    while offset < data.len() {
        match writer.write(&data[offset..]) {
            Ok(0) => {
                return Err(PtyError::Write {
                    reason: "write returned 0 bytes, PTY closed".to_string(),
                    source: None,
                });
            }
            Ok(n) => offset += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PtyError::write(e)),
        }
    }
    writer.flush().map_err(PtyError::write)
}

/// Looks `program` up the way `execvp` would, so a missing or non-executable command
/// fails before a PTY is allocated. A relative path with a slash is taken from `cwd`,
/// the directory the child will start in.
pub fn resolve_executable(
    program: &str,
    path_var: Option<&OsStr>,
    cwd: Option<&Path>,
) -> Result<PathBuf, PtyError> {
    if program.trim().is_empty() {
        return Err(PtyError::spawn("empty command", SpawnErrorKind::NotFound));
    }

    if program.contains('/') {
        let path = match cwd {
            Some(dir) if Path::new(program).is_relative() => dir.join(program),
            _ => PathBuf::from(program),
        };
        return match check_executable(&path) {
            Ok(()) => Ok(path),
            Err(kind) => Err(PtyError::spawn(
                format!("{program}: {}", describe(kind)),
                kind,
            )),
        };
    }

    let mut denied = false;
    if let Some(path_var) = path_var {
        for dir in std::env::split_paths(path_var) {
            let candidate = dir.join(program);
            match check_executable(&candidate) {
                Ok(()) => return Ok(candidate),
                Err(SpawnErrorKind::PermissionDenied) => denied = true,
                Err(_) => {}
            }
        }
    }

    let kind = if denied {
        SpawnErrorKind::PermissionDenied
    } else {
        SpawnErrorKind::NotFound
    };
    Err(PtyError::spawn(
        format!("{program}: {}", describe(kind)),
        kind,
    ))
}

fn check_executable(path: &Path) -> Result<(), SpawnErrorKind> {
    let metadata = std::fs::metadata(path).map_err(|e| SpawnErrorKind::from_io(&e))?;
    if !metadata.is_file() {
        return Err(SpawnErrorKind::PermissionDenied);
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(SpawnErrorKind::PermissionDenied);
    }
    Ok(())
}

fn describe(kind: SpawnErrorKind) -> &'static str {
    match kind {
        SpawnErrorKind::NotFound => "command not found",
        SpawnErrorKind::PermissionDenied => "permission denied",
        SpawnErrorKind::Other => "cannot execute",
    }
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, chunk_bytes: usize) -> mpsc::Receiver<ReadEvent> {
    let (tx, rx) = mpsc::channel(PTY_READ_CHANNEL_CAPACITY);
    let span = tracing::debug_span!("pty_reader");
    let builder = std::thread::Builder::new().name("pty-reader".to_string());
    let tx_thread = tx.clone();
    if let Err(err) = builder.spawn(move || {
        let _guard = span.enter();
        let mut buf = vec![0u8; chunk_bytes];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    let _ = tx_thread.blocking_send(ReadEvent::Eof);
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if tx_thread.blocking_send(ReadEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave side is gone.
                Err(e) if e.raw_os_error() == Some(5) => {
                    let _ = tx_thread.blocking_send(ReadEvent::Eof);
                    debug!("PTY reader EOF (EIO)");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "PTY reader error");
                    let _ = tx_thread.blocking_send(ReadEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    }) {
        let _ = tx.try_send(ReadEvent::Error(err.to_string()));
    }
    rx
}

fn spawn_exit_waiter(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    exited: Arc<AtomicBool>,
) -> oneshot::Receiver<Option<u32>> {
    let (tx, rx) = oneshot::channel();
    let pid = child.process_id();
    let result = std::thread::Builder::new()
        .name("pty-wait".to_string())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "Failed to wait for PTY child");
                    None
                }
            };
            exited.store(true, Ordering::Release);
            debug!(pid = ?pid, exit_code = ?code, "PTY child exited");
            let _ = tx.send(code);
        });
    if let Err(err) = result {
        warn!(pid = ?pid, error = %err, "Failed to start PTY wait thread");
    }
    rx
}
