//! Gateway error types.
//!
//! Every failure a caller can observe is one `GatewayError` variant. Errors
//! are `Clone` so that a single failed activation can be handed to every
//! caller waiting on it.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while routing a tool call to a backend.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The backend id is not in the registry.
    #[error("unknown backend: '{backend}'")]
    UnknownBackend { backend: String },

    /// The tool is not declared for the backend.
    #[error("unknown tool '{tool}' for backend '{backend}'")]
    UnknownTool { backend: String, tool: String },

    /// Call arguments are not a JSON object (or a string encoding one).
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// The process or container could not be created.
    #[error("failed to spawn backend '{backend}': {reason}")]
    SpawnError { backend: String, reason: String },

    /// No `initialize` response arrived before the startup deadline.
    #[error("backend '{backend}' did not complete its handshake within {timeout_ms}ms")]
    HandshakeTimeout { backend: String, timeout_ms: u64 },

    /// The backend answered `initialize` with an error, or died during it.
    #[error("backend '{backend}' handshake failed: {reason}")]
    HandshakeError { backend: String, reason: String },

    /// A malformed or oversized frame was read from a byte stream.
    #[error("protocol error: {reason}")]
    ProtocolError { reason: String },

    /// The backend process exited while requests were pending or while Ready.
    #[error("backend '{backend}' crashed: {reason}")]
    BackendCrashed { backend: String, reason: String },

    /// The caller stopped waiting for a response.
    #[error("call to '{backend}.{tool}' timed out after {timeout_ms}ms")]
    CallTimeout {
        backend: String,
        tool: String,
        timeout_ms: u64,
    },

    /// The backend answered the call with a JSON-RPC error object.
    #[error("backend error [{code}]: {message}")]
    BackendError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Malformed registry entry or configuration file.
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

/// Machine-readable discriminant of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownBackend,
    UnknownTool,
    InvalidArguments,
    SpawnError,
    HandshakeTimeout,
    HandshakeError,
    ProtocolError,
    BackendCrashed,
    CallTimeout,
    BackendError,
    ConfigError,
}

impl GatewayError {
    /// The error's kind, without its payload.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::UnknownBackend { .. } => ErrorKind::UnknownBackend,
            GatewayError::UnknownTool { .. } => ErrorKind::UnknownTool,
            GatewayError::InvalidArguments { .. } => ErrorKind::InvalidArguments,
            GatewayError::SpawnError { .. } => ErrorKind::SpawnError,
            GatewayError::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            GatewayError::HandshakeError { .. } => ErrorKind::HandshakeError,
            GatewayError::ProtocolError { .. } => ErrorKind::ProtocolError,
            GatewayError::BackendCrashed { .. } => ErrorKind::BackendCrashed,
            GatewayError::CallTimeout { .. } => ErrorKind::CallTimeout,
            GatewayError::BackendError { .. } => ErrorKind::BackendError,
            GatewayError::ConfigError { .. } => ErrorKind::ConfigError,
        }
    }

    /// Structured `{kind, message}` body returned to front-end clients.
    pub fn to_body(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let GatewayError::BackendError {
            code,
            data: Some(data),
            ..
        } = self
        {
            body["code"] = serde_json::json!(code);
            body["data"] = data.clone();
        }
        body
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(e: serde_yaml::Error) -> Self {
        GatewayError::ConfigError {
            reason: e.to_string(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
