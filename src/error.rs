use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Transport-layer status of a remote call, as observed by the client side.
///
/// Mirrors the small set of statuses the routing layer cares about: the
/// first three indicate the server (or the path to it) is gone; `Unknown`
/// needs message inspection before it can be classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcStatus {
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    Unknown,
}

impl std::fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcStatus::Unavailable => write!(f, "UNAVAILABLE"),
            RpcStatus::DeadlineExceeded => write!(f, "DEADLINE_EXCEEDED"),
            RpcStatus::Cancelled => write!(f, "CANCELLED"),
            RpcStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Category of a SQL-level error, carried in the structured error trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlErrorKind {
    SqlException,
    SqlDataException,
    SqlSyntaxException,
    SqlIntegrityException,
    SqlTimeoutException,
    XaException,
}

/// Structured error detail returned by a server with a failed response.
///
/// The client reconstructs a typed [`ProxyError`] from this; the server
/// builds it from whatever the backend raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub sql_state: String,
    pub vendor_code: i32,
    pub reason: String,
    pub error_type: SqlErrorKind,
}

impl ErrorDetail {
    pub fn new(sql_state: &str, vendor_code: i32, reason: String, error_type: SqlErrorKind) -> Self {
        Self {
            sql_state: sql_state.to_string(),
            vendor_code,
            reason,
            error_type,
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.sql_state, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("RPC failed with status {status}: {message}")]
    Rpc { status: RpcStatus, message: String },

    #[error("Pool exhausted: {active} active, {max} max (waited {timeout:?})")]
    PoolExhausted {
        active: usize,
        max: usize,
        timeout: Duration,
    },

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("{0}")]
    SessionNotBound(String),

    #[error("XA error {code}: {message}")]
    XaProtocol { code: i32, message: String },

    #[error("{0}")]
    Sql(ErrorDetail),

    #[error("No provider available: {0}")]
    NoProvider(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Shorthand for an XA protocol violation.
    pub fn xa(code: i32, message: impl Into<String>) -> Self {
        ProxyError::XaProtocol {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a transport-level failure with the given status.
    pub fn rpc(status: RpcStatus, message: impl Into<String>) -> Self {
        ProxyError::Rpc {
            status,
            message: message.into(),
        }
    }
}

impl From<bincode::error::EncodeError> for ProxyError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ProxyError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for ProxyError {
    fn from(e: bincode::error::DecodeError) -> Self {
        ProxyError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
