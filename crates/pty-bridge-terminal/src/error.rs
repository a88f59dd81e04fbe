//! PTY errors with structured context.
//!
//! Each error maps to a JSON-RPC code so the daemon can hand it to callers
//! without re-classifying, and carries a suggestion for humans.

use std::io;

use pty_bridge_common::error_codes::{self, ErrorCategory};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorKind {
    NotFound,
    PermissionDenied,
    Other,
}

impl SpawnErrorKind {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => SpawnErrorKind::PermissionDenied,
            _ => SpawnErrorKind::Other,
        }
    }
}

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {reason}")]
    Open { reason: String },
    #[error("Failed to spawn process: {reason}")]
    Spawn {
        reason: String,
        kind: SpawnErrorKind,
    },
    #[error("Failed to write to PTY: {reason}")]
    Write {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },
    #[error("Failed to read from PTY: {reason}")]
    Read { reason: String },
    #[error("Failed to resize PTY: {reason}")]
    Resize { reason: String },
}

impl PtyError {
    pub fn open(reason: impl ToString) -> Self {
        PtyError::Open {
            reason: reason.to_string(),
        }
    }

    pub fn spawn(reason: impl ToString, kind: SpawnErrorKind) -> Self {
        PtyError::Spawn {
            reason: reason.to_string(),
            kind,
        }
    }

    pub fn write(err: io::Error) -> Self {
        PtyError::Write {
            reason: err.to_string(),
            source: Some(err),
        }
    }

    pub fn code(&self) -> i32 {
        match self.spawn_kind() {
            Some(SpawnErrorKind::NotFound) => error_codes::COMMAND_NOT_FOUND,
            Some(SpawnErrorKind::PermissionDenied) => error_codes::PERMISSION_DENIED,
            _ => error_codes::PTY_ERROR,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::External
    }

    pub fn spawn_kind(&self) -> Option<SpawnErrorKind> {
        match self {
            PtyError::Spawn { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn suggestion(&self) -> String {
        match self {
            PtyError::Open { .. } => {
                "PTY allocation failed. Check system resource limits (ulimit -n) or try restarting."
                    .to_string()
            }
            PtyError::Spawn { kind, .. } => match kind {
                SpawnErrorKind::NotFound => {
                    "Command not found. Check if the command exists and is in PATH.".to_string()
                }
                SpawnErrorKind::PermissionDenied => {
                    "Permission denied. Check that the command is executable.".to_string()
                }
                SpawnErrorKind::Other => {
                    "Process spawn failed. Check command syntax and permissions.".to_string()
                }
            },
            PtyError::Write { .. } => {
                "Failed to send input to the terminal. The session may have ended.".to_string()
            }
            PtyError::Read { .. } => {
                "Failed to read terminal output. The session may have ended.".to_string()
            }
            PtyError::Resize { .. } => {
                "Failed to resize terminal. Try again or recreate the session.".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, PtyError::Read { .. } | PtyError::Write { .. })
    }

    pub fn operation(&self) -> &'static str {
        match self {
            PtyError::Open { .. } => "open",
            PtyError::Spawn { .. } => "spawn",
            PtyError::Write { .. } => "write",
            PtyError::Read { .. } => "read",
            PtyError::Resize { .. } => "resize",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PtyError::Open { reason }
            | PtyError::Spawn { reason, .. }
            | PtyError::Write { reason, .. }
            | PtyError::Read { reason }
            | PtyError::Resize { reason } => reason,
        }
    }
}
