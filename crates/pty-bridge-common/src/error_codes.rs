//! JSON-RPC error codes shared by the host, the local transport, and clients.
//!
//! Codes follow JSON-RPC 2.0:
//! - -32700 to -32600: reserved protocol errors
//! - -32000 to -32099: server errors (we use -32001 to -32020 for domain errors)

// Protocol errors
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Session errors
pub const SESSION_NOT_FOUND: i32 = -32001;
pub const SESSION_LIMIT: i32 = -32006;
pub const PTY_ERROR: i32 = -32008;
pub const SESSION_BUSY: i32 = -32009;

// Peer errors
pub const PEER_UNAVAILABLE: i32 = -32010;
pub const CALL_TIMEOUT: i32 = -32011;

// Process errors
pub const COMMAND_NOT_FOUND: i32 = -32014;
pub const PERMISSION_DENIED: i32 = -32015;

// Daemon errors
pub const DAEMON_ERROR: i32 = -32016;
pub const FILE_ERROR: i32 = -32017;

pub const GENERIC_ERROR: i32 = -32000;

/// Error category for programmatic handling by local callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Resource not found (session, method)
    NotFound,
    /// Invalid input parameters or malformed message
    InvalidInput,
    /// Resource busy (already streaming, limit reached)
    Busy,
    /// Internal server error
    Internal,
    /// External dependency failure (PTY, process, browser peer)
    External,
    /// Operation timed out
    Timeout,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidInput => "invalid_input",
            ErrorCategory::Busy => "busy",
            ErrorCategory::Internal => "internal",
            ErrorCategory::External => "external",
            ErrorCategory::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returns whether an error code represents a transient condition worth retrying.
pub fn is_retryable(code: i32) -> bool {
    matches!(code, CALL_TIMEOUT | SESSION_BUSY | PEER_UNAVAILABLE)
}

pub fn category_for_code(code: i32) -> ErrorCategory {
    match code {
        SESSION_NOT_FOUND | METHOD_NOT_FOUND => ErrorCategory::NotFound,
        PARSE_ERROR | INVALID_REQUEST | INVALID_PARAMS => ErrorCategory::InvalidInput,
        SESSION_LIMIT | SESSION_BUSY => ErrorCategory::Busy,
        PTY_ERROR | COMMAND_NOT_FOUND | PERMISSION_DENIED | DAEMON_ERROR | FILE_ERROR
        | PEER_UNAVAILABLE => ErrorCategory::External,
        CALL_TIMEOUT => ErrorCategory::Timeout,
        _ => ErrorCategory::Internal,
    }
}
