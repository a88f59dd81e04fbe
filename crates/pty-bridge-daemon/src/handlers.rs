//! Method table for the extension and local callers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use pty_bridge_ipc::{RpcError, parse_params};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::error::DaemonError;
use crate::files;
use crate::host::RpcHostBuilder;
use crate::launch::{LaunchMode, LaunchRequest, Launcher};
use crate::server::stream_url;
use crate::session::{CreateSpec, SessionManager};

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const CREATE_SESSION: &str = "create-session";
    pub const RESIZE_SESSION: &str = "resize-session";
    pub const CLOSE_SESSION: &str = "close-session";
    pub const LIST_SESSIONS: &str = "list-sessions";
    pub const PING: &str = "ping";
    pub const READ_FILE: &str = "read-file";
    pub const WRITE_FILE: &str = "write-file";
}

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Requests the daemon runtime handles on behalf of a method.
#[derive(Debug)]
pub enum DaemonEvent {
    /// Open (or reopen) the Unix socket for one browser instance.
    Initialize {
        browser_id: String,
        reply: oneshot::Sender<Result<PathBuf, DaemonError>>,
    },
}

pub struct MethodContext {
    pub manager: Arc<SessionManager>,
    /// Address of the TCP listener that stream URLs point at.
    pub stream_addr: SocketAddr,
    pub token: String,
    pub events: mpsc::Sender<DaemonEvent>,
    pub launcher: Launcher,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    #[serde(default)]
    version: Option<String>,
    browser_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateParams {
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default)]
    mode: LaunchMode,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    app: Option<String>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    profile: Option<String>,
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

#[derive(Debug, Deserialize)]
struct ResizeParams {
    #[serde(alias = "tty")]
    id: String,
    rows: u16,
    cols: u16,
}

#[derive(Debug, Deserialize)]
struct SessionRef {
    #[serde(alias = "tty")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ReadFileParams {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct WriteFileParams {
    path: PathBuf,
    content: String,
}

/// Registers every daemon method on `builder`.
pub fn register_methods(builder: RpcHostBuilder, ctx: Arc<MethodContext>) -> RpcHostBuilder {
    let initialize_ctx = Arc::clone(&ctx);
    let create_ctx = Arc::clone(&ctx);
    let resize_ctx = Arc::clone(&ctx);
    let resize_notify_ctx = Arc::clone(&ctx);
    let close_ctx = Arc::clone(&ctx);
    let list_ctx = ctx;

    builder
        .request_fn(methods::INITIALIZE, move |params| {
            let ctx = Arc::clone(&initialize_ctx);
            async move { initialize(&ctx, params).await }
        })
        .request_fn(methods::CREATE_SESSION, move |params| {
            let ctx = Arc::clone(&create_ctx);
            async move { create_session(&ctx, params).await }
        })
        .request_fn(methods::RESIZE_SESSION, move |params| {
            let ctx = Arc::clone(&resize_ctx);
            async move { resize_session(&ctx, params).map(|()| json!({})) }
        })
        .notification_fn(methods::RESIZE_SESSION, move |params| {
            let ctx = Arc::clone(&resize_notify_ctx);
            async move { resize_session(&ctx, params) }
        })
        .request_fn(methods::CLOSE_SESSION, move |params| {
            let ctx = Arc::clone(&close_ctx);
            async move { close_session(&ctx, params) }
        })
        .request_fn(methods::LIST_SESSIONS, move |_params| {
            let ctx = Arc::clone(&list_ctx);
            async move { Ok(json!({ "sessions": ctx.manager.list() })) }
        })
        .request_fn(methods::PING, |_params| async { Ok(json!({ "pong": true })) })
        .request_fn(methods::READ_FILE, read_file)
        .request_fn(methods::WRITE_FILE, write_file)
}

async fn initialize(ctx: &MethodContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: InitializeParams = parse_params(params)?;
    validate_browser_id(&params.browser_id)?;
    info!(
        browser_id = %params.browser_id,
        extension_version = params.version.as_deref().unwrap_or("unknown"),
        "Extension initialized"
    );

    let (reply, rx) = oneshot::channel();
    ctx.events
        .send(DaemonEvent::Initialize {
            browser_id: params.browser_id,
            reply,
        })
        .await
        .map_err(|_| RpcError::internal("daemon is shutting down"))?;
    let socket = rx
        .await
        .map_err(|_| RpcError::internal("daemon is shutting down"))??;

    Ok(json!({
        "socket": socket,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Browser ids become socket file names, so only a conservative charset is allowed.
fn validate_browser_id(browser_id: &str) -> Result<(), RpcError> {
    let valid = !browser_id.is_empty()
        && !browser_id.starts_with('.')
        && browser_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RpcError::invalid_params(format!(
            "browserId '{browser_id}' must be non-empty and use only [A-Za-z0-9._-]"
        )))
    }
}

async fn create_session(ctx: &MethodContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: CreateParams = parse_params(params)?;
    let command = ctx.launcher.command(LaunchRequest {
        mode: params.mode,
        command: params.command,
        app: params.app,
        file: params.file,
        args: params.args,
    })?;
    let mut spec = CreateSpec::new(params.rows, params.cols).command(command);
    spec.cwd = params.cwd;
    spec.env = params.env.into_iter().collect();
    spec.profile = params.profile;

    let created = ctx.manager.create(spec).await?;
    let url = stream_url(&ctx.stream_addr, &created.id, Some(&ctx.token));
    Ok(json!({
        "id": created.id,
        "url": url,
        "pid": created.pid,
    }))
}

async fn read_file(params: Option<Value>) -> Result<Value, RpcError> {
    let params: ReadFileParams = parse_params(params)?;
    let content = files::read_file(&params.path).await?;
    Ok(json!({ "content": content }))
}

async fn write_file(params: Option<Value>) -> Result<Value, RpcError> {
    let params: WriteFileParams = parse_params(params)?;
    files::write_file(&params.path, &params.content).await?;
    Ok(json!({}))
}

fn resize_session(ctx: &MethodContext, params: Option<Value>) -> Result<(), RpcError> {
    let params: ResizeParams = parse_params(params)?;
    ctx.manager.resize(&params.id, params.rows, params.cols)?;
    Ok(())
}

fn close_session(ctx: &MethodContext, params: Option<Value>) -> Result<Value, RpcError> {
    let params: SessionRef = parse_params(params)?;
    let closed = ctx.manager.close(&params.id);
    Ok(json!({ "closed": closed }))
}
