#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod error;
pub mod files;
pub mod handlers;
pub mod host;
pub mod launch;
pub mod registry;
pub mod server;
pub mod session;

pub use bridge::StreamEnd;
pub use bridge::StreamSettings;
pub use bridge::run_bridge;
pub use config::BridgeConfig;
pub use daemon::DaemonState;
pub use daemon::run;
pub use daemon::run_with_io;
pub use error::CallError;
pub use error::DaemonError;
pub use error::FileError;
pub use error::LaunchError;
pub use error::ServerError;
pub use error::SessionError;
pub use handlers::DaemonEvent;
pub use handlers::MethodContext;
pub use handlers::methods;
pub use handlers::register_methods;
pub use host::NotificationHandler;
pub use host::RequestHandler;
pub use host::RpcHost;
pub use host::RpcHostBuilder;
pub use launch::LaunchMode;
pub use launch::Launcher;
pub use registry::PtyLease;
pub use registry::Session;
pub use registry::SessionInfo;
pub use registry::SessionRegistry;
pub use server::BoundTcp;
pub use server::ListenAddr;
pub use server::ServerContext;
pub use server::ServerHandle;
pub use server::build_router;
pub use server::serve_unix;
pub use server::stream_url;
pub use session::CreateSpec;
pub use session::CreatedSession;
pub use session::SessionManager;
