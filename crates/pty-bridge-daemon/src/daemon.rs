//! Daemon runtime: wires the host, sessions, and listeners together and owns shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pty_bridge_ipc::FrameWriter;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::error::DaemonError;
use crate::handlers::{DaemonEvent, MethodContext, register_methods};
use crate::host::RpcHost;
use crate::launch::Launcher;
use crate::registry::SessionRegistry;
use crate::server::{BoundTcp, ServerContext, ServerHandle, http_url, serve_unix};
use crate::session::{SessionManager, generate_token};

pub const STATE_FILE_NAME: &str = "daemon.json";
const SOCKETS_DIR: &str = "sockets";
const EVENT_QUEUE_CAPACITY: usize = 8;

/// Connection details for local callers, written next to the sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonState {
    pub pid: u32,
    pub url: String,
    pub token: String,
    pub started_at: DateTime<Utc>,
}

impl DaemonState {
    pub fn path(runtime_dir: &Path) -> PathBuf {
        runtime_dir.join(STATE_FILE_NAME)
    }

    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(std::io::Error::other)
    }

    fn write(&self, path: &Path) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, payload)?;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        std::fs::rename(&tmp_path, path)
    }
}

pub fn socket_path(runtime_dir: &Path, browser_id: &str) -> PathBuf {
    runtime_dir
        .join(SOCKETS_DIR)
        .join(format!("{browser_id}.sock"))
}

/// Serves the browser over stdin/stdout until it hangs up or SIGINT/SIGTERM arrives.
pub async fn run(config: BridgeConfig) -> Result<(), DaemonError> {
    let shutdown = shutdown_signal()?;
    run_with_io(config, tokio::io::stdin(), tokio::io::stdout(), shutdown).await
}

fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static, DaemonError> {
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
    let mut interrupt =
        signal(SignalKind::interrupt()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
    Ok(async move {
        let name = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        info!(signal = name, "Received signal, initiating graceful shutdown");
    })
}

/// Same as [`run`] over arbitrary pipes, stopping early when `shutdown` resolves.
pub async fn run_with_io<R, W, S>(
    config: BridgeConfig,
    reader: R,
    writer: W,
    shutdown: S,
) -> Result<(), DaemonError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + 'static,
    S: Future<Output = ()>,
{
    let token = config.token.clone().unwrap_or_else(generate_token);
    let bound = BoundTcp::bind(&config.listen, config.allow_remote)?;
    let stream_addr = bound.local_addr();

    let manager = Arc::new(SessionManager::new(
        Arc::new(SessionRegistry::new()),
        &config,
    ));
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    let methods = Arc::new(MethodContext {
        manager: Arc::clone(&manager),
        stream_addr,
        token: token.clone(),
        events: events_tx,
        launcher: Launcher::from_config(&config),
    });
    let builder = RpcHost::builder(FrameWriter::new(writer))
        .call_timeout(config.call_timeout)
        .max_frame_bytes(config.max_frame_bytes);
    let host = register_methods(builder, methods).build();

    let server_ctx = ServerContext::new(Arc::clone(&host), Arc::clone(&manager), &config);
    let tcp = bound.serve(server_ctx.clone(), token.clone())?;

    let state_path = DaemonState::path(&config.runtime_dir);
    let state = DaemonState {
        pid: std::process::id(),
        url: http_url(&stream_addr),
        token,
        started_at: Utc::now(),
    };
    if let Err(err) = state.write(&state_path) {
        warn!(path = %state_path.display(), error = %err, "Failed to write daemon state file");
    }
    info!(
        pid = state.pid,
        url = %state.url,
        runtime_dir = %config.runtime_dir.display(),
        "Daemon started"
    );

    let mut sockets: HashMap<String, ServerHandle> = HashMap::new();
    let listen = host.listen(reader);
    tokio::pin!(listen);
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            result = &mut listen => break result.map_err(DaemonError::from),
            _ = &mut shutdown => break Ok(()),
            Some(event) = events_rx.recv() => {
                handle_event(event, &server_ctx, &config.runtime_dir, &mut sockets).await;
            }
        }
    };

    info!("Shutting down daemon");
    let closed = manager.close_all();
    debug!(sessions = closed, "Sessions closed");
    for (_, handle) in sockets.drain() {
        handle.shutdown().await;
    }
    tcp.shutdown().await;
    if let Err(err) = std::fs::remove_file(&state_path) {
        debug!(path = %state_path.display(), error = %err, "State file not removed");
    }
    outcome
}

async fn handle_event(
    event: DaemonEvent,
    ctx: &ServerContext,
    runtime_dir: &Path,
    sockets: &mut HashMap<String, ServerHandle>,
) {
    match event {
        DaemonEvent::Initialize { browser_id, reply } => {
            if let Some(previous) = sockets.remove(&browser_id) {
                debug!(browser_id = %browser_id, "Replacing socket for re-initialized browser");
                previous.retire();
            }
            let path = socket_path(runtime_dir, &browser_id);
            let result = match serve_unix(ctx.clone(), &path) {
                Ok(handle) => {
                    sockets.insert(browser_id, handle);
                    Ok(path)
                }
                Err(err) => {
                    warn!(browser_id = %browser_id, error = %err, "Failed to open browser socket");
                    Err(DaemonError::from(err))
                }
            };
            let _ = reply.send(result);
        }
    }
}
