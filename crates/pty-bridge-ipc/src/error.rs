use std::io;

use thiserror::Error;

use crate::error_codes;
use crate::message::RpcError;

/// Fatal failures of the length-prefixed stdio channel.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A correctly framed payload that is not a usable message. Never fatal.
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    Json(serde_json::Error),

    #[error("unrecognized message shape: {0}")]
    Shape(String),
}

impl MessageError {
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            MessageError::Json(err) => RpcError::parse_error(err),
            MessageError::Shape(reason) => RpcError::invalid_request(reason),
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),

    #[error("timed out after {0:?} waiting for the daemon")]
    Timeout(std::time::Duration),

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("failed to encode request: {0}")]
    Encode(serde_json::Error),
}

impl ClientError {
    pub fn code(&self) -> i32 {
        match self {
            ClientError::Rpc(err) => err.code,
            ClientError::Timeout(_) => error_codes::CALL_TIMEOUT,
            ClientError::Connect { .. } => error_codes::PEER_UNAVAILABLE,
            ClientError::InvalidResponse(_) => error_codes::PARSE_ERROR,
            ClientError::Endpoint(_) => error_codes::INVALID_PARAMS,
            ClientError::Http(_)
            | ClientError::Request(_)
            | ClientError::Status { .. }
            | ClientError::Encode(_) => error_codes::GENERIC_ERROR,
        }
    }

    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            ClientError::Connect { .. } => {
                Some("Is the browser extension running? The socket is created on initialize.")
            }
            ClientError::Status { status: 401, .. } => {
                Some("Pass the daemon token with --token or PTY_BRIDGE_TOKEN.")
            }
            ClientError::Timeout(_) => Some("The browser did not answer in time; retry."),
            _ => None,
        }
    }

    /// Message shown to local callers: the RPC error text verbatim, otherwise the display form.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Rpc(err) => err.message.clone(),
            other => other.to_string(),
        }
    }
}
