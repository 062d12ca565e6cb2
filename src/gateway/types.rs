//! Shared types for the gateway.
//!
//! JSON-RPC 2.0 message types, backend descriptors, and the result shapes
//! returned by the dispatcher.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::GatewayError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// Protocol version sent in the `initialize` handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request sent to a worker. Ids are allocated per supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response written by the front end.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A decoded inbound frame, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Has `id` and `method`.
    Request {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Has `method` but no `id`.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Has `id` and one of `result` / `error`.
    Response {
        id: serde_json::Value,
        outcome: Result<serde_json::Value, JsonRpcError>,
    },
}

impl JsonRpcMessage {
    /// Classify one parsed JSON value.
    ///
    /// Batches (arrays) and objects that are neither request, notification
    /// nor response are protocol errors.
    pub fn classify(value: serde_json::Value) -> Result<Self, GatewayError> {
        let serde_json::Value::Object(mut obj) = value else {
            return Err(GatewayError::ProtocolError {
                reason: "frame is not a JSON object".into(),
            });
        };

        if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
            return Err(GatewayError::ProtocolError {
                reason: "missing or unsupported jsonrpc version".into(),
            });
        }

        let id = obj.remove("id");
        let params = obj.remove("params");

        if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
            let method = method.to_string();
            return Ok(match id {
                Some(id) => JsonRpcMessage::Request { id, method, params },
                None => JsonRpcMessage::Notification { method, params },
            });
        }

        let Some(id) = id else {
            return Err(GatewayError::ProtocolError {
                reason: "message has neither id nor method".into(),
            });
        };

        // `"error": null` next to a result is treated as absent.
        if let Some(error) = obj.remove("error").filter(|e| !e.is_null()) {
            let error: JsonRpcError =
                serde_json::from_value(error).map_err(|e| GatewayError::ProtocolError {
                    reason: format!("malformed error object: {e}"),
                })?;
            return Ok(JsonRpcMessage::Response {
                id,
                outcome: Err(error),
            });
        }

        match obj.remove("result") {
            Some(result) => Ok(JsonRpcMessage::Response {
                id,
                outcome: Ok(result),
            }),
            None => Err(GatewayError::ProtocolError {
                reason: "response missing both result and error".into(),
            }),
        }
    }
}

// ─── Backend Descriptors ─────────────────────────────────────────────────────

/// Static description of one callable tool exposed by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form hint for clients choosing between tools.
    #[serde(default)]
    pub when_to_use: String,
    #[serde(default = "empty_schema", alias = "inputSchema")]
    pub parameters: serde_json::Value,
}

fn empty_schema() -> serde_json::Value {
    serde_json::json!({})
}

/// How a backend process is launched. Opaque to the supervisor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    /// Container image; when set, `command` is the argv after the image.
    pub image: Option<String>,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

/// One validated registry entry.
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    pub id: String,
    pub launch: LaunchSpec,
    pub idle_timeout: Duration,
    /// Backend accepts interleaved requests on its stdin.
    pub concurrent: bool,
    pub tools: Vec<ToolSpec>,
}

impl ServerDescriptor {
    /// Look up a declared tool by name.
    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// One row of the aggregated static catalog.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub server: String,
    pub name: String,
    pub description: String,
    pub when_to_use: String,
    pub parameters: serde_json::Value,
}

/// Result of a successful tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub backend: String,
    pub tool: String,
    /// The worker's `tools/call` result, untouched.
    pub content: serde_json::Value,
    pub execution_time_ms: u64,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_classify_response_success() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": 7, "result": {"content": []}});
        match JsonRpcMessage::classify(value).unwrap() {
            JsonRpcMessage::Response { id, outcome } => {
                assert_eq!(id, 7);
                assert!(outcome.is_ok());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response_error() {
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        });
        match JsonRpcMessage::classify(value).unwrap() {
            JsonRpcMessage::Response { outcome, .. } => {
                let err = outcome.unwrap_err();
                assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_null_result_is_a_response() {
        let value = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": null});
        assert!(matches!(
            JsonRpcMessage::classify(value).unwrap(),
            JsonRpcMessage::Response { outcome: Ok(serde_json::Value::Null), .. }
        ));
    }

    #[test]
    fn test_classify_null_error_next_to_result() {
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 4,
            "result": {"content": []},
            "error": null
        });
        match JsonRpcMessage::classify(value).unwrap() {
            JsonRpcMessage::Response { outcome, .. } => {
                assert_eq!(outcome.unwrap(), serde_json::json!({"content": []}));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_request_and_notification() {
        let req = serde_json::json!({"jsonrpc": "2.0", "id": "a", "method": "ping"});
        assert!(matches!(
            JsonRpcMessage::classify(req).unwrap(),
            JsonRpcMessage::Request { .. }
        ));
        let note = serde_json::json!({"jsonrpc": "2.0", "method": "notifications/message"});
        assert!(matches!(
            JsonRpcMessage::classify(note).unwrap(),
            JsonRpcMessage::Notification { .. }
        ));
    }

    #[test]
    fn test_classify_rejects_batches_and_bad_versions() {
        assert!(JsonRpcMessage::classify(serde_json::json!([1, 2])).is_err());
        assert!(JsonRpcMessage::classify(serde_json::json!({"id": 1, "result": 1})).is_err());
        assert!(
            JsonRpcMessage::classify(serde_json::json!({"jsonrpc": "2.0", "id": 1})).is_err()
        );
    }

    #[test]
    fn test_tool_spec_defaults() {
        let json = r#"{"name": "get_documentation"}"#;
        let tool: ToolSpec = serde_json::from_str(json).unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.parameters, serde_json::json!({}));
    }
}
