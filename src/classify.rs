// # Error Classification
//
// Decides whether a failure is connection-level (the server or the path to
// it is gone, so the endpoint should be marked DOWN) or database-level (the
// server is fine, the operation failed). Pool exhaustion is resource
// pressure, not connectivity, and must never take an endpoint out of
// rotation.

use crate::error::{ProxyError, RpcStatus};

/// Keywords that mark a non-RPC failure as connection-level.
const CONNECTION_KEYWORDS: [&str; 3] = ["connection", "timeout", "unavailable"];

/// Pure classifier over proxy errors.
pub struct ErrorClassifier;

impl ErrorClassifier {
    /// Returns true iff the error indicates the server endpoint itself is
    /// unreachable or unresponsive.
    pub fn is_connection_level(error: &ProxyError) -> bool {
        match error {
            ProxyError::Rpc { status, message } => match status {
                RpcStatus::Unavailable
                | RpcStatus::DeadlineExceeded
                | RpcStatus::Cancelled => true,
                RpcStatus::Unknown => message.contains("connection") || message.contains("Connection"),
            },
            // Resource pressure on a healthy server.
            ProxyError::PoolExhausted { .. } | ProxyError::PoolClosed => false,
            // Typed SQL and XA failures come from a server that answered.
            ProxyError::Sql(_) | ProxyError::XaProtocol { .. } => false,
            other => Self::message_indicates_connection(&other.to_string()),
        }
    }

    fn message_indicates_connection(message: &str) -> bool {
        let lower = message.to_lowercase();
        if lower.contains("pool exhausted") || lower.contains("pool is exhausted") {
            return false;
        }
        CONNECTION_KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorDetail, SqlErrorKind};
    use std::time::Duration;

    #[test]
    fn test_rpc_statuses() {
        assert!(ErrorClassifier::is_connection_level(&ProxyError::rpc(
            RpcStatus::Unavailable,
            "server2:1059 unreachable"
        )));
        assert!(ErrorClassifier::is_connection_level(&ProxyError::rpc(
            RpcStatus::DeadlineExceeded,
            "deadline exceeded after 5s"
        )));
        assert!(ErrorClassifier::is_connection_level(&ProxyError::rpc(
            RpcStatus::Cancelled,
            "call cancelled"
        )));
    }

    #[test]
    fn test_unknown_status_needs_connection_in_message() {
        assert!(ErrorClassifier::is_connection_level(&ProxyError::rpc(
            RpcStatus::Unknown,
            "Connection reset by peer"
        )));
        assert!(!ErrorClassifier::is_connection_level(&ProxyError::rpc(
            RpcStatus::Unknown,
            "something else entirely"
        )));
    }

    #[test]
    fn test_pool_exhaustion_is_not_connection_level() {
        let err = ProxyError::PoolExhausted {
            active: 5,
            max: 5,
            timeout: Duration::from_secs(30),
        };
        assert!(!ErrorClassifier::is_connection_level(&err));
        assert!(!ErrorClassifier::is_connection_level(&ProxyError::Network(
            "pool is exhausted, 10 waiters".to_string()
        )));
    }

    #[test]
    fn test_database_errors_are_not_connection_level() {
        let detail = ErrorDetail::new(
            "42501",
            0,
            "permission denied for table accounts".to_string(),
            SqlErrorKind::SqlException,
        );
        assert!(!ErrorClassifier::is_connection_level(&ProxyError::Sql(detail)));
        assert!(!ErrorClassifier::is_connection_level(&ProxyError::xa(
            -6,
            "branch not in a prepareable state"
        )));
    }

    #[test]
    fn test_keyword_match_on_plain_errors() {
        assert!(ErrorClassifier::is_connection_level(&ProxyError::Network(
            "Connection refused".to_string()
        )));
        assert!(ErrorClassifier::is_connection_level(&ProxyError::Network(
            "read timeout".to_string()
        )));
        assert!(!ErrorClassifier::is_connection_level(&ProxyError::Internal(
            "unexpected state".to_string()
        )));
    }
}
