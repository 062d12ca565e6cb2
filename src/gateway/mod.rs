//! MCP gateway: on-demand stdio workers behind one static tool catalog.
//!
//! This module handles:
//! - Loading the backend registry and gateway configuration
//! - Newline-delimited JSON-RPC framing over worker stdio
//! - Spawning workers as plain processes or `docker run -i` containers
//! - One supervisor state machine per backend (start, serve, stop, crash)
//! - Single-flight cold starts and call routing
//! - Stopping idle backends
//! - The MCP front end the gateway itself serves on stdio

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod frontend;
pub mod provider;
pub mod reaper;
pub mod registry;
pub mod supervisor;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::{GatewayConfig, LogConfig, LogFormat};
pub use dispatcher::{Dispatcher, GatewayState, StopOutcome};
pub use errors::{ErrorKind, GatewayError};
pub use frontend::FrontEnd;
pub use provider::{CommandProvider, DockerProvider, ProcessProvider, RoutingProvider};
pub use reaper::{spawn_reaper, ReaperHandle};
pub use registry::Registry;
pub use supervisor::{State, Supervisor, SupervisorStatus};
pub use types::{CatalogEntry, ServerDescriptor, ToolCallResult, ToolSpec};
