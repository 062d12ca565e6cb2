//! MCP server on the gateway's own stdio.
//!
//! Exposes four gateway tools (`list_available_tools`, `execute_tool`,
//! `list_active_servers`, `stop_server`) over the same newline-delimited
//! JSON-RPC framing the gateway speaks to its workers. Each request runs on
//! its own task; responses share one serialized writer.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::codec::{FrameReader, FrameWriter, ReadEvent};
use super::dispatcher::Dispatcher;
use super::errors::GatewayError;
use super::types::{error_codes, JsonRpcMessage, JsonRpcResponse, MCP_PROTOCOL_VERSION};

const SERVER_NAME: &str = "mcp-gateway";

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ExecuteToolArgs {
    server_id: String,
    tool_name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct StopServerArgs {
    server_id: String,
}

/// Handles front-end JSON-RPC requests against a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct FrontEnd {
    dispatcher: Dispatcher,
}

impl FrontEnd {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Answer one request.
    pub async fn handle_request(&self, id: Value, method: &str, params: Option<Value>) -> JsonRpcResponse {
        tracing::debug!(%method, "front-end request");

        match method {
            "ping" => JsonRpcResponse::success(id, json!({})),
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": { "listChanged": false } },
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            ),
            "tools/list" => JsonRpcResponse::success(id, json!({ "tools": gateway_tools() })),
            "tools/call" => self.handle_tools_call(id, params).await,
            _ => {
                tracing::warn!(%method, "unknown front-end method");
                JsonRpcResponse::failure(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                )
            }
        }
    }

    async fn handle_tools_call(&self, id: Value, params: Option<Value>) -> JsonRpcResponse {
        let call: CallParams = match params.map(serde_json::from_value) {
            Some(Ok(call)) => call,
            Some(Err(e)) => {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("invalid tool call params: {e}"),
                )
            }
            None => {
                return JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, "missing tool call params")
            }
        };

        let outcome = match call.name.as_str() {
            "list_available_tools" => serde_json::to_value(self.dispatcher.list_tools())
                .map(|tools| text_result(&tools, false))
                .map_err(|e| GatewayError::ProtocolError {
                    reason: e.to_string(),
                }),
            "execute_tool" => self.execute_tool(call.arguments).await,
            "list_active_servers" => serde_json::to_value(self.dispatcher.list_active())
                .map(|active| text_result(&active, false))
                .map_err(|e| GatewayError::ProtocolError {
                    reason: e.to_string(),
                }),
            "stop_server" => self.stop_server(call.arguments).await,
            other => {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("unknown tool: {other}"),
                )
            }
        };

        let result = outcome.unwrap_or_else(|e| text_result(&e.to_body(), true));
        JsonRpcResponse::success(id, result)
    }

    async fn execute_tool(&self, arguments: Value) -> Result<Value, GatewayError> {
        let args: ExecuteToolArgs = parse_args("execute_tool", arguments)?;
        let result = self
            .dispatcher
            .call_tool(&args.server_id, &args.tool_name, args.arguments)
            .await?;

        // Workers already answer in MCP content shape; pass that through.
        if result.content.get("content").is_some_and(Value::is_array) {
            Ok(result.content)
        } else {
            Ok(text_result(&result.content, false))
        }
    }

    async fn stop_server(&self, arguments: Value) -> Result<Value, GatewayError> {
        let args: StopServerArgs = parse_args("stop_server", arguments)?;
        let status = self.dispatcher.stop(&args.server_id).await?;
        Ok(text_result(
            &json!({ "status": status, "server_id": args.server_id }),
            false,
        ))
    }

    /// Serve until `reader` closes, then wait for in-flight requests and
    /// stop every backend.
    pub async fn serve<R, W>(&self, reader: R, writer: W, max_line_bytes: usize) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FrameReader::new(reader, max_line_bytes);
        let out = Arc::new(Mutex::new(FrameWriter::new(writer)));
        let mut in_flight = JoinSet::new();

        tracing::info!(backends = self.dispatcher.registry().len(), "front end listening on stdio");

        loop {
            let event = tokio::select! {
                event = frames.next_event() => event?,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "request task failed");
                    }
                    continue;
                }
            };

            let message = match event {
                ReadEvent::Frame(value) => JsonRpcMessage::classify(value),
                ReadEvent::Malformed(e) => {
                    tracing::warn!(error = %e, "malformed front-end line");
                    let reply = JsonRpcResponse::failure(Value::Null, error_codes::PARSE_ERROR, e.to_string());
                    send(&out, &reply).await;
                    continue;
                }
                ReadEvent::Eof => break,
            };

            match message {
                Ok(JsonRpcMessage::Request { id, method, params }) => {
                    let this = self.clone();
                    let out = out.clone();
                    in_flight.spawn(async move {
                        let reply = this.handle_request(id, &method, params).await;
                        send(&out, &reply).await;
                    });
                }
                Ok(JsonRpcMessage::Notification { method, .. }) => {
                    tracing::debug!(%method, "front-end notification");
                }
                Ok(JsonRpcMessage::Response { id, .. }) => {
                    tracing::debug!(%id, "ignoring response from client");
                }
                Err(e) => {
                    let reply = JsonRpcResponse::failure(Value::Null, error_codes::INVALID_REQUEST, e.to_string());
                    send(&out, &reply).await;
                }
            }
        }

        tracing::info!(pending = in_flight.len(), "stdin closed; finishing");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "request task failed");
            }
        }
        self.dispatcher.shutdown_all().await;
        Ok(())
    }
}

async fn send<W: AsyncWrite + Unpin>(out: &Mutex<FrameWriter<W>>, reply: &JsonRpcResponse) {
    if let Err(e) = out.lock().await.send(reply).await {
        tracing::warn!(error = %e, "failed to write front-end response");
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, GatewayError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|e| GatewayError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// Wrap a JSON value as MCP text content.
fn text_result(value: &Value, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": value.to_string() }],
        "isError": is_error,
    })
}

/// Descriptors for the gateway's own tools.
pub fn gateway_tools() -> Value {
    json!([
        {
            "name": "list_available_tools",
            "description": "List all available tools from all registered MCP servers",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "execute_tool",
            "description": "Execute a tool on a specific MCP server, starting it if needed",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "server_id": { "type": "string" },
                    "tool_name": { "type": "string" },
                    "arguments": {
                        "description": "Tool arguments as an object or a JSON string",
                        "type": ["object", "string", "null"]
                    }
                },
                "required": ["server_id", "tool_name"]
            }
        },
        {
            "name": "list_active_servers",
            "description": "List currently active (running) MCP servers",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "stop_server",
            "description": "Manually stop a running MCP server",
            "inputSchema": {
                "type": "object",
                "properties": { "server_id": { "type": "string" } },
                "required": ["server_id"]
            }
        }
    ])
}

// ─── Tests ───────────────────────────────────────────────────────────────────
