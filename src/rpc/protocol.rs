//! JSON-RPC 2.0 protocol layer
//!
//! Message types for the line-delimited wire format, request id generation
//! and dispatch of inbound lines against the request registry.
//!
//! Outbound: `{"jsonrpc":"2.0","method":...,"params":{...},"id":"..."}\n`
//! Inbound:  `{"jsonrpc":"2.0","result":...,"id":"..."}\n` or
//!           `{"jsonrpc":"2.0","error":{"code":..,"message":..,"data":..},"id":"..."}\n`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::rpc::error::RpcError;
use crate::rpc::registry::RequestRegistry;

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Parameters, always an object on the wire
    pub params: Value,

    /// Request identifier
    pub id: String,
}

impl JsonRpcRequest {
    pub fn new(id: String, method: &str, params: Value) -> Self {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Serialize into a single newline-terminated line
    pub fn to_line(&self) -> Result<String, RpcError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| RpcError::Serialization(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    #[serde(default)]
    pub jsonrpc: Option<String>,

    /// Request identifier (matches the request)
    #[serde(default)]
    pub id: Option<Value>,

    /// Result (present if successful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,

    /// Set on notifications and server-initiated requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i64,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Standard JSON-RPC 2.0 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum JsonRpcErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    InvalidParams = -32602,
    InternalError = -32603,
}

// ============================================================================
// Request Ids
// ============================================================================

/// Generate a request id of the form `<method>-<unix millis>-<random suffix>`
pub fn generate_request_id(method: &str) -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{method}-{millis}-{}", &suffix[..7])
}

/// Registry key for an id that may arrive as a string or a number
fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ============================================================================
// Inbound Dispatch
// ============================================================================

/// What happened to one inbound line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Matched a pending request and resolved it
    Resolved { id: String },
    /// Matched a pending request and rejected it with the server error
    Rejected { id: String },
    /// Well-formed response whose id is not pending (late, duplicate, unknown)
    Unmatched { id: String },
    /// Notification or server-initiated message
    Notification { method: String },
    /// JSON object with nothing we can correlate
    Ignored,
    /// Not JSON at all (log noise interleaved with protocol lines)
    ParseError,
}

/// Parse one complete line and settle the matching pending request
///
/// Never fails: malformed lines and unknown ids are logged and reported
/// through the outcome only.
pub fn dispatch_line(line: &str, registry: &RequestRegistry) -> DispatchOutcome {
    let line = line.trim();

    let response = match serde_json::from_str::<JsonRpcResponse>(line) {
        Ok(response) => response,
        Err(e) => {
            debug!("Failed to parse line as JSON-RPC ({}): {}", e, truncate(line, 200));
            return DispatchOutcome::ParseError;
        }
    };

    let Some(id) = response.id.as_ref().and_then(id_key) else {
        return match response.method {
            Some(method) => {
                debug!("Received notification: {}", method);
                DispatchOutcome::Notification { method }
            }
            None => {
                trace!("Ignoring JSON line without id: {}", truncate(line, 200));
                DispatchOutcome::Ignored
            }
        };
    };

    if let Some(method) = response.method {
        // Server-initiated request; we do not serve any methods
        debug!("Received server request {} ({})", method, id);
        return DispatchOutcome::Notification { method };
    }

    match response.error {
        Some(error) => {
            warn!(
                "Received error response for {}: ({}) {}",
                id, error.code, error.message
            );
            let rpc_error = RpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            };
            if registry.reject(&id, rpc_error) {
                DispatchOutcome::Rejected { id }
            } else {
                debug!("Error response for unknown request {}", id);
                DispatchOutcome::Unmatched { id }
            }
        }
        None => {
            let result = response.result.unwrap_or(Value::Null);
            trace!("Received response for {}: {}", id, truncate(&result.to_string(), 500));
            if registry.resolve(&id, result) {
                DispatchOutcome::Resolved { id }
            } else {
                debug!("Received response for unknown request {}", id);
                DispatchOutcome::Unmatched { id }
            }
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> RequestRegistry {
        RequestRegistry::new(Duration::from_secs(5))
    }

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(
            "tools/call-1-abcdefg".to_string(),
            "tools/call",
            json!({"name": "search_gmail_messages"}),
        );
        let line = request.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "tools/call");
        assert_eq!(value["id"], "tools/call-1-abcdefg");
        assert_eq!(value["params"]["name"], "search_gmail_messages");
    }

    #[test]
    fn test_null_params_become_empty_object() {
        let request = JsonRpcRequest::new("x".to_string(), "shutdown", Value::Null);
        assert_eq!(request.params, json!({}));
    }

    #[test]
    fn test_generate_request_id_shape() {
        let id = generate_request_id("tools/list");
        let rest = id.strip_prefix("tools/list-").unwrap();
        let (millis, suffix) = rest.split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 7);

        let ids: std::collections::HashSet<String> =
            (0..1000).map(|_| generate_request_id("m")).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn test_dispatch_resolves_matching_request() {
        let registry = registry();
        let rx = registry
            .register("a-1".to_string(), "a", json!({}))
            .unwrap();

        let outcome = dispatch_line(r#"{"jsonrpc":"2.0","result":{"ok":true},"id":"a-1"}"#, &registry);
        assert_eq!(outcome, DispatchOutcome::Resolved { id: "a-1".to_string() });
        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_with_structured_error() {
        let registry = registry();
        let rx = registry.register("b-1".to_string(), "b", json!({})).unwrap();

        let outcome = dispatch_line(
            r#"{"jsonrpc":"2.0","error":{"code":-32602,"message":"bad params","data":{"field":"q"}},"id":"b-1"}"#,
            &registry,
        );
        assert_eq!(outcome, DispatchOutcome::Rejected { id: "b-1".to_string() });

        match rx.await.unwrap() {
            Err(RpcError::Server { code, message, data }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad params");
                assert_eq!(data, Some(json!({"field": "q"})));
            }
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_attached_to_later_request() {
        let registry = registry();

        let outcome = dispatch_line(r#"{"jsonrpc":"2.0","result":1,"id":"ghost"}"#, &registry);
        assert_eq!(outcome, DispatchOutcome::Unmatched { id: "ghost".to_string() });

        let rx = registry.register("real".to_string(), "m", json!({})).unwrap();
        dispatch_line(r#"{"jsonrpc":"2.0","result":2,"id":"real"}"#, &registry);
        assert_eq!(rx.await.unwrap().unwrap(), json!(2));
    }

    #[test]
    fn test_noise_and_notifications() {
        let registry = registry();
        assert_eq!(
            dispatch_line("INFO starting server on port 3000", &registry),
            DispatchOutcome::ParseError
        );
        assert_eq!(
            dispatch_line(
                r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#,
                &registry
            ),
            DispatchOutcome::Notification {
                method: "notifications/progress".to_string()
            }
        );
        assert_eq!(dispatch_line(r#"{"hello":"world"}"#, &registry), DispatchOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_numeric_ids_match_string_keys() {
        let registry = registry();
        let rx = registry.register("42".to_string(), "m", json!({})).unwrap();
        let outcome = dispatch_line(r#"{"jsonrpc":"2.0","result":"x","id":42}"#, &registry);
        assert_eq!(outcome, DispatchOutcome::Resolved { id: "42".to_string() });
        assert_eq!(rx.await.unwrap().unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_in_one_chunk() {
        use crate::rpc::framing::LineFramer;

        let registry = registry();
        let rx1 = registry.register("r1".to_string(), "m", json!({})).unwrap();
        let rx2 = registry.register("r2".to_string(), "m", json!({})).unwrap();
        let rx3 = registry.register("r3".to_string(), "m", json!({})).unwrap();

        let chunk = concat!(
            r#"{"jsonrpc":"2.0","result":"third","id":"r3"}"#, "\n",
            r#"{"jsonrpc":"2.0","result":"second","id":"r2"}"#, "\n",
            r#"{"jsonrpc":"2.0","result":"first","id":"r1"}"#, "\n",
        );

        let mut framer = LineFramer::new();
        for line in framer.push(chunk) {
            dispatch_line(&line, &registry);
        }

        assert_eq!(rx1.await.unwrap().unwrap(), json!("first"));
        assert_eq!(rx2.await.unwrap().unwrap(), json!("second"));
        assert_eq!(rx3.await.unwrap().unwrap(), json!("third"));
    }
}
