//! Per-request failure types
//!
//! Every way a single `send_request` call can fail. These never affect
//! unrelated callers: each error is delivered only to the future of the
//! request it belongs to.

use serde_json::Value;
use std::time::Duration;

use crate::rpc::protocol::JsonRpcErrorCode;

/// Failure of one logical request
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The child process is not running; nothing was written
    #[error("Mail tool process is not running")]
    NotRunning,

    /// The child's stdin is closed; nothing was written
    #[error("Mail tool stdin is not available")]
    StdinUnavailable,

    /// No response arrived within the per-request budget
    #[error("Request timeout: {method} ({timeout:?}), id {id}")]
    Timeout {
        method: String,
        id: String,
        timeout: Duration,
    },

    /// The child answered with a JSON-RPC error object
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The supervisor is stopping
    #[error("Service shutting down")]
    ShuttingDown,

    /// The child exited while the request was pending
    #[error("Service stopped: {reason}")]
    ServiceStopped { reason: String },

    /// Writing the framed request failed
    #[error("Failed to write to mail tool stdin: {0}")]
    Write(String),

    /// The request could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An id collided with an in-flight request
    #[error("Duplicate request id: {0}")]
    DuplicateId(String),
}

impl RpcError {
    /// JSON-RPC style numeric code for this failure
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Server { code, .. } => *code,
            RpcError::Serialization(_) => JsonRpcErrorCode::InvalidRequest as i64,
            _ => JsonRpcErrorCode::InternalError as i64,
        }
    }

    /// Whether retrying the same call later could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::NotRunning
                | RpcError::StdinUnavailable
                | RpcError::Timeout { .. }
                | RpcError::ServiceStopped { .. }
                | RpcError::Write(_)
        )
    }

    /// Operator-facing remediation
    pub fn hint(&self) -> Option<String> {
        match self {
            RpcError::NotRunning | RpcError::StdinUnavailable => Some(
                "Start the daemon (or wait for the automatic restart) before issuing requests"
                    .to_string(),
            ),
            RpcError::Timeout { timeout, .. } => Some(format!(
                "The mail tool did not answer within {timeout:?}; raise --request-timeout-ms or check the tool's logs"
            )),
            RpcError::ServiceStopped { .. } => {
                Some("The mail tool exited; the request can be retried after it restarts".to_string())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let server = RpcError::Server {
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        };
        assert_eq!(server.code(), -32601);
        assert_eq!(RpcError::NotRunning.code(), -32603);
        assert_eq!(RpcError::Serialization("x".into()).code(), -32600);
    }

    #[test]
    fn test_timeout_message_names_method_and_id() {
        let err = RpcError::Timeout {
            method: "tools/call".to_string(),
            id: "tools/call-1-abc".to_string(),
            timeout: Duration::from_millis(50),
        };
        let text = err.to_string();
        assert!(text.contains("tools/call"));
        assert!(text.contains("tools/call-1-abc"));
        assert!(err.is_transient());
        assert!(err.hint().unwrap().contains("--request-timeout-ms"));
    }
}
