//! JSON-RPC host over the native-messaging pipe.
//!
//! The handler tables are fixed once [`RpcHostBuilder::build`] returns. `listen` owns
//! the read side; any number of tasks may issue outbound calls through `send` while
//! it runs, and their responses are routed back by id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pty_bridge_common::mutex_lock_or_recover;
use pty_bridge_ipc::frame::DEFAULT_MAX_FRAME_BYTES;
use pty_bridge_ipc::{
    FrameError, FrameReader, FrameWriter, Message, Notification, Request, Response, RpcError,
    generate_request_id,
};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, warn};

use crate::config::{DEFAULT_CALL_TIMEOUT_SECS, clamp_call_timeout};
use crate::error::CallError;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError>;
}

/// Fire-and-forget handler. Errors are logged by the host, never sent back.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>) -> Result<(), RpcError>;
}

struct FnRequestHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<Value, RpcError> {
        (self.0)(params).await
    }
}

struct FnNotificationHandler<F>(F);

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>) -> Result<(), RpcError> {
        (self.0)(params).await
    }
}

pub struct RpcHostBuilder {
    writer: FrameWriter,
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
    call_timeout: Duration,
    max_frame_bytes: usize,
}

impl RpcHostBuilder {
    pub fn new(writer: FrameWriter) -> Self {
        Self {
            writer,
            requests: HashMap::new(),
            notifications: HashMap::new(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Registers a request handler. A later registration for the same method wins.
    pub fn request<H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        self.requests.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn request_fn<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.request(method, FnRequestHandler(f))
    }

    pub fn notification<H>(mut self, method: impl Into<String>, handler: H) -> Self
    where
        H: NotificationHandler + 'static,
    {
        self.notifications.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn notification_fn<F, Fut>(self, method: impl Into<String>, f: F) -> Self
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.notification(method, FnNotificationHandler(f))
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = clamp_call_timeout(timeout);
        self
    }

    pub fn max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    pub fn build(self) -> Arc<RpcHost> {
        Arc::new(RpcHost {
            writer: self.writer,
            requests: self.requests,
            notifications: self.notifications,
            pending: Mutex::new(HashMap::new()),
            call_timeout: self.call_timeout,
            max_frame_bytes: self.max_frame_bytes,
        })
    }
}

pub struct RpcHost {
    writer: FrameWriter,
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    call_timeout: Duration,
    max_frame_bytes: usize,
}

/// Removes its pending-call entry on every exit path of `send_request`.
struct PendingGuard<'a> {
    host: &'a RpcHost,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        mutex_lock_or_recover(&self.host.pending).remove(&self.id);
    }
}

impl RpcHost {
    pub fn builder(writer: FrameWriter) -> RpcHostBuilder {
        RpcHostBuilder::new(writer)
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn has_request_handler(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }

    pub fn has_notification_handler(&self, method: &str) -> bool {
        self.notifications.contains_key(method)
    }

    pub fn pending_calls(&self) -> usize {
        mutex_lock_or_recover(&self.pending).len()
    }

    /// Calls `method` on the extension with a fresh id.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Response, CallError> {
        self.send_request(Request::new(generate_request_id(), method, params))
            .await
    }

    /// Sends `request` as-is, keeping the caller's id.
    pub async fn send_request(&self, request: Request) -> Result<Response, CallError> {
        let (tx, rx) = oneshot::channel();
        let _guard = self.register_pending(&request.id, tx)?;
        let method = request.method.clone();

        self.writer
            .write_message(&Message::Request(request))
            .await?;

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                warn!(method = %method, timeout_ms = self.call_timeout.as_millis(), "Outbound call timed out");
                Err(CallError::Timeout {
                    method,
                    timeout: self.call_timeout,
                })
            }
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), FrameError> {
        self.writer
            .write_message(&Message::Notification(Notification::new(method, params)))
            .await
    }

    fn register_pending(
        &self,
        id: &str,
        tx: oneshot::Sender<Response>,
    ) -> Result<PendingGuard<'_>, CallError> {
        let mut pending = mutex_lock_or_recover(&self.pending);
        if pending.contains_key(id) {
            return Err(CallError::DuplicateId(id.to_string()));
        }
        pending.insert(id.to_string(), tx);
        Ok(PendingGuard {
            host: self,
            id: id.to_string(),
        })
    }

    /// Runs a request through the handler table and builds its response.
    ///
    /// The handler runs in its own task so a panic still answers the caller with
    /// an internal error.
    pub async fn dispatch_local(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        let Some(handler) = self.requests.get(&method).cloned() else {
            debug!(method = %method, "No handler for request");
            return Response::error(id, RpcError::method_not_found(&method));
        };

        let span = tracing::debug_span!("rpc_request", method = %method, request_id = %id);
        async move {
            let handled =
                tokio::spawn(async move { handler.handle(params).await }.in_current_span()).await;
            match handled {
                Ok(Ok(result)) => Response::success(id, result),
                Ok(Err(err)) => {
                    debug!(code = err.code, error = %err, "Request handler failed");
                    Response::error(id, err)
                }
                Err(err) => {
                    warn!(error = %err, "Request handler did not complete");
                    let reason = if err.is_panic() {
                        format!("handler for {method} panicked")
                    } else {
                        format!("handler for {method} was cancelled")
                    };
                    Response::error(id, RpcError::internal(reason))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs a notification handler inline. Returns false when none is registered.
    pub async fn dispatch_notification(&self, notification: Notification) -> bool {
        let Some(handler) = self.notifications.get(&notification.method).cloned() else {
            return false;
        };
        if let Err(err) = handler.handle(notification.params).await {
            warn!(method = %notification.method, code = err.code, error = %err, "Notification handler failed");
        }
        true
    }

    /// Serves the extension until it closes the pipe cleanly or the framing breaks.
    ///
    /// Undecodable payloads are dropped. In-flight handlers get a bounded window to
    /// flush their responses before this returns, and any call still pending fails
    /// with [`CallError::Closed`].
    pub async fn listen<R>(self: &Arc<Self>, reader: R) -> Result<(), FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::new(reader).with_max_frame_bytes(self.max_frame_bytes);
        let mut tasks = JoinSet::new();

        let result = loop {
            while let Some(joined) = tasks.try_join_next() {
                log_join(joined);
            }

            let frame = match frames.next_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Native messaging channel closed");
                    break Ok(());
                }
                Err(err) => {
                    warn!(error = %err, "Fatal framing error on native messaging channel");
                    break Err(err);
                }
            };

            let message = match Message::from_slice(&frame) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, bytes = frame.len(), "Dropping undecodable message");
                    continue;
                }
            };

            match message {
                Message::Response(response) => self.route_response(response),
                Message::Notification(notification) => {
                    if !self.has_notification_handler(&notification.method) {
                        debug!(method = %notification.method, "No handler for notification");
                        continue;
                    }
                    let host = Arc::clone(self);
                    tasks.spawn(async move {
                        host.dispatch_notification(notification).await;
                    });
                }
                Message::Request(request) => {
                    if !self.has_request_handler(&request.method) {
                        let response =
                            Response::error(request.id, RpcError::method_not_found(&request.method));
                        if let Err(err) = self.writer.write_message(&response.into()).await {
                            warn!(error = %err, "Failed to write method-not-found response");
                        }
                        continue;
                    }
                    let host = Arc::clone(self);
                    tasks.spawn(async move {
                        let response = host.dispatch_local(request).await;
                        if let Err(err) = host.writer.write_message(&response.into()).await {
                            warn!(error = %err, "Failed to write response");
                        }
                    });
                }
            }
        };

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "In-flight handlers did not finish, aborting");
            tasks.abort_all();
        }

        mutex_lock_or_recover(&self.pending).clear();
        result
    }

    fn route_response(&self, response: Response) {
        let sender = mutex_lock_or_recover(&self.pending).remove(&response.id);
        match sender {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("Caller gave up before the response arrived");
                }
            }
            None => debug!(id = %response.id, "Dropping response for unknown call"),
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    match joined {
        Err(err) if err.is_panic() => warn!(error = %err, "Handler task panicked"),
        _ => {}
    }
}
