//! Local HTTP surface: `/rpc` for command-line callers and `/tty/{id}` for streams.
//!
//! The same router serves the token-protected loopback TCP listener and the
//! per-browser Unix socket, which relies on filesystem permissions instead.

use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use pty_bridge_ipc::{Message, Request, Response as RpcResponse, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bridge::{StreamSettings, run_bridge};
use crate::config::BridgeConfig;
use crate::error::{ServerError, SessionError};
use crate::host::RpcHost;
use crate::session::SessionManager;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);
const TOKEN_HEADER: &str = "x-pty-bridge-token";

/// Everything a listener needs to answer requests.
#[derive(Clone)]
pub struct ServerContext {
    pub host: Arc<RpcHost>,
    pub manager: Arc<SessionManager>,
    pub stream: StreamSettings,
    pub close_on_disconnect: bool,
}

impl ServerContext {
    pub fn new(host: Arc<RpcHost>, manager: Arc<SessionManager>, config: &BridgeConfig) -> Self {
        Self {
            host,
            manager,
            stream: StreamSettings::from_config(config),
            close_on_disconnect: config.close_on_disconnect,
        }
    }
}

struct AppState {
    ctx: ServerContext,
    token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", http_url(addr)),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

pub struct ServerHandle {
    addr: ListenAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Stops accepting, waits briefly for in-flight requests, and removes the
    /// socket file for Unix listeners.
    pub async fn shutdown(self) {
        self.stop(true).await;
    }

    /// Stops this listener in the background, leaving its socket path alone so a
    /// replacement bound at the same path keeps working.
    pub fn retire(self) {
        tokio::spawn(self.stop(false));
    }

    async fn stop(self, remove_socket: bool) {
        let ServerHandle {
            addr,
            shutdown_tx,
            mut join,
        } = self;
        shutdown_tx.send_replace(true);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut join).await {
            Ok(Err(err)) => error!(error = %err, "Server task failed"),
            Ok(Ok(())) => {}
            Err(_) => {
                warn!(
                    timeout_ms = SHUTDOWN_TIMEOUT.as_millis(),
                    addr = %addr,
                    "Server shutdown timed out; aborting"
                );
                join.abort();
            }
        }
        if !remove_socket {
            return;
        }
        if let ListenAddr::Unix(path) = &addr {
            if let Err(err) = std::fs::remove_file(path) {
                debug!(path = %path.display(), error = %err, "Socket file not removed");
            }
        }
    }
}

/// Loopback TCP listener bound but not yet serving, so its address can be
/// handed out before the router exists.
pub struct BoundTcp {
    listener: std::net::TcpListener,
    addr: SocketAddr,
}

impl BoundTcp {
    pub fn bind(listen: &str, allow_remote: bool) -> Result<Self, ServerError> {
        let (listener, addr) = bind_listener(listen, allow_remote)?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn serve(self, ctx: ServerContext, token: String) -> Result<ServerHandle, ServerError> {
        let listener = TcpListener::from_std(self.listener)
            .map_err(|e| ServerError::io("create async listener", e))?;
        let router = build_router(ctx, Some(token));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
                .await;
            if let Err(err) = served {
                error!(error = %err, "TCP server failed");
            }
        });
        info!(url = %http_url(&self.addr), "Local server listening");
        Ok(ServerHandle {
            addr: ListenAddr::Tcp(self.addr),
            shutdown_tx,
            join,
        })
    }
}

/// Serves the router on a Unix socket at `path`, replacing a stale socket file.
pub fn serve_unix(ctx: ServerContext, path: &StdPath) -> Result<ServerHandle, ServerError> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent).map_err(|e| ServerError::io("create socket directory", e))?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(ServerError::io("remove stale socket", err)),
    }

    let listener = UnixListener::bind(path).map_err(|e| ServerError::io("bind unix socket", e))?;
    set_owner_only(path).map_err(|e| ServerError::io("set socket permissions", e))?;

    let router = build_router(ctx, None);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
            .await;
        if let Err(err) = served {
            error!(error = %err, "Unix socket server failed");
        }
    });
    info!(path = %path.display(), "Local socket listening");
    Ok(ServerHandle {
        addr: ListenAddr::Unix(path.to_path_buf()),
        shutdown_tx,
        join,
    })
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

pub fn build_router(ctx: ServerContext, token: Option<String>) -> Router {
    let state = Arc::new(AppState { ctx, token });
    Router::new()
        .route("/", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .route("/tty/{id}", get(tty_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamQuery {
    token: Option<String>,
    rows: Option<u16>,
    cols: Option<u16>,
    profile: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<i32>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.ctx.manager.len(),
    }))
    .into_response()
}

async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    body: Bytes,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers, query.token.as_deref()) {
        return *resp;
    }
    let host = &state.ctx.host;

    let message = match Message::from_slice(&body) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "Rejecting malformed RPC body");
            return rpc_reply(RpcResponse::error("", RpcError::parse_error(err)));
        }
    };

    match message {
        Message::Request(request) => rpc_reply(route_request(host, request).await),
        Message::Notification(notification) => {
            if host.has_notification_handler(&notification.method) {
                host.dispatch_notification(notification).await;
            } else if let Err(err) = host
                .notify(&notification.method, notification.params)
                .await
            {
                warn!(method = %notification.method, error = %err, "Failed to forward notification");
            }
            StatusCode::NO_CONTENT.into_response()
        }
        Message::Response(response) => rpc_reply(RpcResponse::error(
            response.id,
            RpcError::invalid_request("expected a request or notification"),
        )),
    }
}

/// Local methods run here; everything else is a browser call for the extension.
async fn route_request(host: &RpcHost, request: Request) -> RpcResponse {
    if host.has_request_handler(&request.method) {
        return host.dispatch_local(request).await;
    }
    let id = request.id.clone();
    let method = request.method.clone();
    match host.send_request(request).await {
        Ok(response) => response,
        Err(err) => {
            debug!(method = %method, error = %err, "Forwarded call failed");
            RpcResponse::error(id, err.into())
        }
    }
}

fn rpc_reply(response: RpcResponse) -> Response {
    Json(Message::from(response)).into_response()
}

async fn tty_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(resp) = require_auth(&state, &headers, query.token.as_deref()) {
        return *resp;
    }
    let manager = Arc::clone(&state.ctx.manager);

    let session = match manager.get(&id) {
        Ok(session) => session,
        Err(err) => return session_error_response(StatusCode::NOT_FOUND, &err),
    };

    let size = match (query.rows, query.cols) {
        (None, None) => None,
        (rows, cols) => {
            let (current_rows, current_cols) = session.size();
            let rows = rows.unwrap_or(current_rows);
            let cols = cols.unwrap_or(current_cols);
            if rows == 0 || cols == 0 {
                let err = SessionError::InvalidSize { rows, cols };
                return session_error_response(StatusCode::BAD_REQUEST, &err);
            }
            Some((rows, cols))
        }
    };

    if let Some(requested) = query.profile.as_deref() {
        if session.profile() != Some(requested) {
            let err = SessionError::ProfileMismatch {
                id: id.clone(),
                requested: requested.to_string(),
                actual: session.profile().unwrap_or_default().to_string(),
            };
            return session_error_response(StatusCode::BAD_REQUEST, &err);
        }
    }

    let Some(lease) = session.lease() else {
        let err = SessionError::Busy(id);
        return session_error_response(StatusCode::CONFLICT, &err);
    };

    if let Some((rows, cols)) = size {
        if let Err(err) = manager.resize(&id, rows, cols) {
            return session_error_response(StatusCode::BAD_GATEWAY, &err);
        }
    }

    let settings = state.ctx.stream;
    let close_on_disconnect = state.ctx.close_on_disconnect;
    ws.on_upgrade(move |socket| async move {
        let end = run_bridge(socket, lease, settings).await;
        debug!(session_id = %id, reason = ?end, "Stream finished");
        if close_on_disconnect {
            manager.close(&id);
        }
    })
    .into_response()
}

fn require_auth(
    state: &AppState,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<(), Box<Response>> {
    let Some(expected) = state.token.as_deref() else {
        return Ok(());
    };
    let candidate = query_token
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        })
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|auth| auth.strip_prefix("Bearer "))
                .map(|token| token.trim().to_string())
        });

    if candidate.as_deref() == Some(expected) {
        Ok(())
    } else {
        Err(Box::new(error_response(
            StatusCode::UNAUTHORIZED,
            "invalid token",
            None,
        )))
    }
}

fn session_error_response(status: StatusCode, err: &SessionError) -> Response {
    error_response(status, &err.to_string(), Some(err.code()))
}

fn error_response(status: StatusCode, message: &str, code: Option<i32>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message,
            code,
        }),
    )
        .into_response()
}

fn bind_listener(
    listen: &str,
    allow_remote: bool,
) -> Result<(std::net::TcpListener, SocketAddr), ServerError> {
    let mut addrs = listen
        .to_socket_addrs()
        .map_err(|e| ServerError::InvalidListen {
            message: format!("{listen}: {e}"),
        })?;
    let addr = addrs.next().ok_or_else(|| ServerError::InvalidListen {
        message: format!("{listen}: no resolved address"),
    })?;

    if !allow_remote && !addr.ip().is_loopback() {
        return Err(ServerError::InvalidListen {
            message: "refusing to bind non-loopback address without PTY_BRIDGE_ALLOW_REMOTE=1"
                .to_string(),
        });
    }

    let listener =
        std::net::TcpListener::bind(addr).map_err(|e| ServerError::io("bind", e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::io("set non-blocking", e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| ServerError::io("read local address", e))?;
    Ok((listener, local_addr))
}

fn host_port(addr: &SocketAddr) -> String {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => format!("{}:{}", ip, addr.port()),
        std::net::IpAddr::V6(ip) => format!("[{}]:{}", ip, addr.port()),
    }
}

pub fn http_url(addr: &SocketAddr) -> String {
    format!("http://{}", host_port(addr))
}

/// WebSocket URL a client dials to attach to session `id`.
pub fn stream_url(addr: &SocketAddr, id: &str, token: Option<&str>) -> String {
    let mut url = format!("ws://{}/tty/{}", host_port(addr), id);
    if let Some(token) = token {
        url.push_str("?token=");
        url.extend(url::form_urlencoded::byte_serialize(token.as_bytes()));
    }
    url
}

fn create_private_dir(dir: &StdPath) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

fn set_owner_only(path: &StdPath) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}
