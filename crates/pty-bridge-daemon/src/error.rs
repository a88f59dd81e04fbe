//! Domain errors for daemon operations.
//!
//! Every error maps to a JSON-RPC code from the shared table so handlers can
//! convert with `?` and callers see consistent codes on both transports.

use std::time::Duration;

use pty_bridge_ipc::error_codes::{self, ErrorCategory};
use pty_bridge_ipc::{FrameError, RpcError};
use pty_bridge_terminal::PtyError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session limit reached: maximum {0} sessions allowed")]
    LimitReached(usize),
    #[error("Session {0} is already streaming")]
    Busy(String),
    #[error("Invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
    #[error("Session {id} uses profile '{actual}', not '{requested}'")]
    ProfileMismatch {
        id: String,
        requested: String,
        actual: String,
    },
    #[error("PTY error: {0}")]
    Pty(#[from] PtyError),
}

impl SessionError {
    pub fn code(&self) -> i32 {
        match self {
            SessionError::NotFound(_) => error_codes::SESSION_NOT_FOUND,
            SessionError::LimitReached(_) => error_codes::SESSION_LIMIT,
            SessionError::Busy(_) => error_codes::SESSION_BUSY,
            SessionError::InvalidSize { .. } | SessionError::ProfileMismatch { .. } => {
                error_codes::INVALID_PARAMS
            }
            SessionError::Pty(pty_err) => pty_err.code(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        error_codes::category_for_code(self.code())
    }

    pub fn suggestion(&self) -> String {
        match self {
            SessionError::NotFound(_) => {
                "The session has exited or was closed. Call 'list-sessions' or create a new one."
                    .to_string()
            }
            SessionError::LimitReached(_) => {
                "Close unused sessions with 'close-session' or raise PTY_BRIDGE_MAX_SESSIONS."
                    .to_string()
            }
            SessionError::Busy(_) => {
                "Another stream is attached to this session. Close it first.".to_string()
            }
            SessionError::InvalidSize { .. } => "Rows and cols must be positive.".to_string(),
            SessionError::ProfileMismatch { .. } => {
                "Reconnect with the profile the session was created with.".to_string()
            }
            SessionError::Pty(pty_err) => pty_err.suggestion(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Pty(pty_err) => pty_err.is_retryable(),
            _ => error_codes::is_retryable(self.code()),
        }
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        let suggestion = err.suggestion();
        RpcError::new(err.code(), err.to_string()).with_category(Some(suggestion))
    }
}

/// Failures choosing the program for an app or editor session.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Missing '{field}' for {mode} mode")]
    MissingField {
        mode: &'static str,
        field: &'static str,
    },
    #[error("Invalid app name: {0}")]
    InvalidAppName(String),
    #[error("App not found in {dir}: {name}")]
    AppNotFound { name: String, dir: String },
    #[error("App entrypoint is a directory, expected a file: {0}")]
    AppIsDirectory(String),
    #[error("Failed to prepare app {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub fn code(&self) -> i32 {
        match self {
            LaunchError::MissingField { .. }
            | LaunchError::InvalidAppName(_)
            | LaunchError::AppIsDirectory(_) => error_codes::INVALID_PARAMS,
            LaunchError::AppNotFound { .. } => error_codes::COMMAND_NOT_FOUND,
            LaunchError::Io { source, .. } => io_error_code(source),
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            LaunchError::MissingField { field, .. } => format!("Pass '{field}' in the params."),
            LaunchError::InvalidAppName(_) => {
                "App names are plain file names inside the app directory.".to_string()
            }
            LaunchError::AppNotFound { .. } => {
                "Place an executable in PTY_BRIDGE_APP_DIR or check the app name.".to_string()
            }
            LaunchError::AppIsDirectory(_) => "Point the app name at a file.".to_string(),
            LaunchError::Io { .. } => "Check permissions on the app directory.".to_string(),
        }
    }
}

impl From<LaunchError> for RpcError {
    fn from(err: LaunchError) -> Self {
        let suggestion = err.suggestion();
        RpcError::new(err.code(), err.to_string()).with_category(Some(suggestion))
    }
}

/// Failures of `read-file` and `write-file`.
#[derive(Error, Debug)]
pub enum FileError {
    #[error("Path must be absolute: {0}")]
    RelativePath(String),
    #[error("Failed to {operation} {path}: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    pub fn code(&self) -> i32 {
        match self {
            FileError::RelativePath(_) => error_codes::INVALID_PARAMS,
            FileError::Io { source, .. } => io_error_code(source),
        }
    }
}

impl From<FileError> for RpcError {
    fn from(err: FileError) -> Self {
        RpcError::new(err.code(), err.to_string()).with_category(None)
    }
}

fn io_error_code(err: &std::io::Error) -> i32 {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => error_codes::PERMISSION_DENIED,
        _ => error_codes::FILE_ERROR,
    }
}

/// Failures of an outbound call to the extension.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("call '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("a call with id '{0}' is already pending")]
    DuplicateId(String),
    #[error("failed to write call: {0}")]
    Write(#[from] FrameError),
    #[error("the extension channel closed before answering")]
    Closed,
}

impl CallError {
    pub fn code(&self) -> i32 {
        match self {
            CallError::Timeout { .. } => error_codes::CALL_TIMEOUT,
            CallError::DuplicateId(_) => error_codes::INVALID_REQUEST,
            CallError::Write(_) | CallError::Closed => error_codes::PEER_UNAVAILABLE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }
}

impl From<CallError> for RpcError {
    fn from(err: CallError) -> Self {
        RpcError::new(err.code(), err.to_string()).with_category(None)
    }
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid listen address: {message}")]
    InvalidListen { message: String },
    #[error("Server I/O error ({operation}): {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ServerError {
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        ServerError::Io { operation, source }
    }
}

/// Daemon startup and lifecycle errors.
#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to start local server: {0}")]
    Server(#[from] ServerError),
    #[error("Native messaging channel failed: {0}")]
    Channel(#[from] FrameError),
    #[error("Failed to setup signal handler: {0}")]
    SignalSetup(String),
    #[error("Failed to prepare runtime directory {path}: {reason}")]
    RuntimeDir { path: String, reason: String },
}

impl DaemonError {
    pub fn code(&self) -> i32 {
        error_codes::DAEMON_ERROR
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn suggestion(&self) -> String {
        match self {
            DaemonError::Server(ServerError::InvalidListen { .. }) => {
                "Use a loopback PTY_BRIDGE_LISTEN address or set PTY_BRIDGE_ALLOW_REMOTE=1."
                    .to_string()
            }
            DaemonError::Server(_) => {
                "Check that the listen port is free and the runtime directory is writable."
                    .to_string()
            }
            DaemonError::Channel(_) => {
                "The browser closed the messaging pipe mid-frame. Reload the extension.".to_string()
            }
            DaemonError::SignalSetup(_) => {
                "Signal handler setup failed. Check system signal configuration.".to_string()
            }
            DaemonError::RuntimeDir { .. } => {
                "Set PTY_BRIDGE_RUNTIME_DIR to a writable directory.".to_string()
            }
        }
    }
}

impl From<DaemonError> for RpcError {
    fn from(err: DaemonError) -> Self {
        let suggestion = err.suggestion();
        RpcError::new(err.code(), err.to_string()).with_category(Some(suggestion))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pty_bridge_terminal::SpawnErrorKind;

    #[test]
    fn test_session_error_codes() {
        assert_eq!(
            SessionError::NotFound("x".into()).code(),
            error_codes::SESSION_NOT_FOUND
        );
        assert_eq!(SessionError::LimitReached(4).code(), error_codes::SESSION_LIMIT);
        assert_eq!(SessionError::Busy("x".into()).code(), error_codes::SESSION_BUSY);
        assert_eq!(
            SessionError::InvalidSize { rows: 0, cols: 80 }.code(),
            error_codes::INVALID_PARAMS
        );
    }

    #[test]
    fn test_pty_spawn_codes_pass_through() {
        let err = SessionError::from(PtyError::spawn("missing", SpawnErrorKind::NotFound));
        assert_eq!(err.code(), error_codes::COMMAND_NOT_FOUND);
        assert_eq!(err.category(), ErrorCategory::External);
    }

    #[test]
    fn test_session_error_into_rpc_error_carries_data() {
        let rpc: RpcError = SessionError::NotFound("abc".into()).into();
        assert_eq!(rpc.code, error_codes::SESSION_NOT_FOUND);
        assert_eq!(rpc.message, "Session not found: abc");
        let data = rpc.data.unwrap();
        assert_eq!(data["category"], "not_found");
        assert_eq!(data["retryable"], false);
    }

    #[test]
    fn test_call_timeout_maps_to_call_timeout_code() {
        let err = CallError::Timeout {
            method: "list-tabs".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        let rpc: RpcError = err.into();
        assert_eq!(rpc.code, error_codes::CALL_TIMEOUT);
    }

    #[test]
    fn test_launch_and_file_error_codes() {
        let missing = LaunchError::AppNotFound {
            name: "todo".into(),
            dir: "/apps".into(),
        };
        assert_eq!(missing.code(), error_codes::COMMAND_NOT_FOUND);
        assert_eq!(
            LaunchError::InvalidAppName("../x".into()).code(),
            error_codes::INVALID_PARAMS
        );

        let denied = FileError::Io {
            operation: "write",
            path: "/etc/x".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert_eq!(denied.code(), error_codes::PERMISSION_DENIED);
        let other = FileError::Io {
            operation: "read",
            path: "/x".into(),
            source: std::io::Error::other("disk"),
        };
        assert_eq!(other.code(), error_codes::FILE_ERROR);
    }

    #[test]
    fn test_daemon_error_code() {
        let err = DaemonError::SignalSetup("x".into());
        assert_eq!(err.code(), error_codes::DAEMON_ERROR);
        assert!(err.suggestion().contains("Signal"));
    }
}
