#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod client;
mod error;
pub mod frame;
mod message;

pub use pty_bridge_common::error_codes;

pub use client::DEFAULT_CLIENT_TIMEOUT;
pub use client::Endpoint;
pub use client::LocalClient;
pub use client::generate_request_id;
pub use error::ClientError;
pub use error::FrameError;
pub use error::MessageError;
pub use frame::FrameReader;
pub use frame::FrameWriter;
pub use message::JSONRPC_VERSION;
pub use message::Message;
pub use message::Notification;
pub use message::Outcome;
pub use message::Request;
pub use message::Response;
pub use message::RpcError;
pub use message::parse_params;

pub type Result<T> = std::result::Result<T, ClientError>;
