//! One-shot JSON-RPC client for the daemon's local `/rpc` endpoint.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::Method;
use hyper::StatusCode;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use url::Url;

use crate::error::ClientError;
use crate::message::{Message, Notification, Request};

const RPC_PATH: &str = "/rpc";
/// Outlasts the daemon's default forwarding timeout so a forwarded call that goes
/// unanswered reports the daemon's timeout error rather than a client-side one.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parses an `http://host:port` base URL as printed by the daemon.
    pub fn from_url(raw: &str) -> Result<Self, ClientError> {
        let url = Url::parse(raw).map_err(|e| ClientError::Endpoint(format!("{raw}: {e}")))?;
        match url.scheme() {
            "http" | "ws" => {}
            other => {
                return Err(ClientError::Endpoint(format!(
                    "unsupported scheme '{other}' (expected http)"
                )));
            }
        }
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::Endpoint(format!("{raw}: missing host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ClientError::Endpoint(format!("{raw}: missing port")))?;
        Ok(Endpoint::Tcp { host, port })
    }

    fn authority(&self) -> String {
        match self {
            Endpoint::Unix(_) => "localhost".to_string(),
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "http://{host}:{port}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalClient {
    endpoint: Endpoint,
    token: Option<String>,
    timeout: Duration,
}

impl LocalClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            token: None,
            timeout: DEFAULT_CLIENT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issues one request and returns its result, or the daemon's RPC error.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let request = Message::from(Request::new(generate_request_id(), method, params));
        let body = serde_json::to_vec(&request).map_err(ClientError::Encode)?;
        let (status, body) = self.post_with_timeout(body).await?;
        if status != StatusCode::OK {
            return Err(status_error(status, &body));
        }

        match Message::from_slice(&body) {
            Ok(Message::Response(response)) => response.into_result().map_err(ClientError::Rpc),
            Ok(other) => Err(ClientError::InvalidResponse(format!(
                "expected a response, got {other:?}"
            ))),
            Err(err) => Err(ClientError::InvalidResponse(err.to_string())),
        }
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let notification = Message::from(Notification::new(method, params));
        let body = serde_json::to_vec(&notification).map_err(ClientError::Encode)?;
        let (status, body) = self.post_with_timeout(body).await?;
        if status == StatusCode::NO_CONTENT || status == StatusCode::OK {
            Ok(())
        } else {
            Err(status_error(status, &body))
        }
    }

    async fn post_with_timeout(&self, body: Vec<u8>) -> Result<(StatusCode, Bytes), ClientError> {
        tokio::time::timeout(self.timeout, self.post(body))
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
    }

    async fn post(&self, body: Vec<u8>) -> Result<(StatusCode, Bytes), ClientError> {
        let connect_err = |source: std::io::Error| ClientError::Connect {
            endpoint: self.endpoint.to_string(),
            source,
        };
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_err)?;
                self.exchange(stream, body).await
            }
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(connect_err)?;
                self.exchange(stream, body).await
            }
        }
    }

    async fn exchange<S>(&self, stream: S, body: Vec<u8>) -> Result<(StatusCode, Bytes), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        let conn_task = tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!(error = %err, "Local RPC connection closed with error");
            }
        });

        let mut builder = hyper::Request::builder()
            .method(Method::POST)
            .uri(RPC_PATH)
            .header(HOST, self.endpoint.authority())
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder.body(Full::new(Bytes::from(body)))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        conn_task.abort();
        Ok((status, bytes))
    }
}

fn status_error(status: StatusCode, body: &[u8]) -> ClientError {
    ClientError::Status {
        status: status.as_u16(),
        body: String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_url() {
        assert_eq!(
            Endpoint::from_url("http://127.0.0.1:4567").unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".into(),
                port: 4567
            }
        );
        assert!(matches!(
            Endpoint::from_url("ftp://127.0.0.1:21"),
            Err(ClientError::Endpoint(_))
        ));
        assert!(Endpoint::from_url("not a url").is_err());
    }

    #[test]
    fn test_endpoint_display() {
        let unix = Endpoint::Unix(PathBuf::from("/tmp/pty-bridge/a.sock"));
        assert_eq!(unix.to_string(), "unix:/tmp/pty-bridge/a.sock");
        assert_eq!(unix.authority(), "localhost");
    }

    #[test]
    fn test_default_timeout() {
        let client = LocalClient::new(Endpoint::Unix(PathBuf::from("/tmp/a.sock")));
        assert_eq!(client.timeout(), DEFAULT_CLIENT_TIMEOUT);
        let client = client.with_timeout(Duration::from_secs(3));
        assert_eq!(client.timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(generate_request_id(), generate_request_id());
    }

    #[tokio::test]
    async fn test_missing_socket_is_connect_error() {
        let client = LocalClient::new(Endpoint::Unix(PathBuf::from(
            "/nonexistent/pty-bridge/missing.sock",
        )));
        let err = client.call("ping", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
        assert!(err.suggestion().is_some());
    }
}
