//! Tool-call routing.
//!
//! `Dispatcher` is the one entry point for tool execution. It validates the
//! call against the static registry, obtains a Ready supervisor through a
//! single-flight get-or-create on `GatewayState`, and forwards the request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use super::config::GatewayConfig;
use super::errors::GatewayError;
use super::provider::ProcessProvider;
use super::registry::Registry;
use super::supervisor::{
    Borrow, Readiness, State, Supervisor, SupervisorSettings, SupervisorStatus,
};
use super::types::{CatalogEntry, ServerDescriptor, ToolCallResult};

/// How often a caller may find its supervisor retiring before giving up.
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

// ─── GatewayState ────────────────────────────────────────────────────────────

/// Live supervisors by backend id.
///
/// Only get-or-create and reaper/stop removal mutate the map, both under
/// the same lock.
#[derive(Debug, Default)]
pub struct GatewayState {
    supervisors: Mutex<HashMap<String, Arc<Supervisor>>>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Supervisor>>> {
        self.supervisors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the current supervisor for `descriptor`, creating and
    /// activating a fresh one if there is none or the last one is finished.
    ///
    /// A `Stopping` supervisor is returned as-is so the caller waits for
    /// it; a new process never starts before the old one is gone.
    pub fn get_or_create(
        &self,
        descriptor: &Arc<ServerDescriptor>,
        settings: &SupervisorSettings,
        provider: &Arc<dyn ProcessProvider>,
    ) -> Arc<Supervisor> {
        let mut map = self.lock();
        if let Some(existing) = map.get(&descriptor.id) {
            if !matches!(existing.state(), State::Stopped | State::Failed) {
                return existing.clone();
            }
        }

        let supervisor = Supervisor::new(descriptor.clone(), settings.clone());
        supervisor.activate(provider.clone());
        map.insert(descriptor.id.clone(), supervisor.clone());
        supervisor
    }

    pub fn get(&self, id: &str) -> Option<Arc<Supervisor>> {
        self.lock().get(id).cloned()
    }

    /// All supervisors, ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Supervisor>> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Remove `supervisor` unless it has already been replaced.
    pub fn remove_if_same(&self, supervisor: &Arc<Supervisor>) -> bool {
        let mut map = self.lock();
        match map.get(supervisor.id()) {
            Some(current) if Arc::ptr_eq(current, supervisor) => {
                map.remove(supervisor.id());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

/// Result of a manual stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    state: Arc<GatewayState>,
    provider: Arc<dyn ProcessProvider>,
    settings: SupervisorSettings,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        provider: Arc<dyn ProcessProvider>,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            registry,
            state: Arc::new(GatewayState::new()),
            provider,
            settings: SupervisorSettings::from_config(config),
            call_timeout: config.call_timeout(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// The static catalog. Never spawns anything.
    pub fn list_tools(&self) -> Vec<CatalogEntry> {
        self.registry.catalog()
    }

    /// Execute `tool` on `backend`, starting the backend if needed.
    ///
    /// Steps:
    /// 1. Resolve backend and tool against the registry
    /// 2. Normalize the arguments to a JSON object
    /// 3. Get a Ready supervisor (single-flight start)
    /// 4. Forward `tools/call` and wait up to the call timeout
    pub async fn call_tool(
        &self,
        backend: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, GatewayError> {
        let start = Instant::now();

        let descriptor = self.resolve(backend, tool)?;
        let arguments = normalize_arguments(tool, arguments)?;

        let outcome = match self.acquire(&descriptor).await {
            Ok(borrow) => borrow.call_tool(tool, arguments, self.call_timeout).await,
            Err(e) => Err(e),
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(content) => {
                tracing::info!(backend, tool, elapsed_ms, "tool call completed");
                Ok(ToolCallResult {
                    backend: backend.to_string(),
                    tool: tool.to_string(),
                    content,
                    execution_time_ms: elapsed_ms,
                })
            }
            Err(e) => {
                tracing::warn!(backend, tool, elapsed_ms, error = %e, "tool call failed");
                Err(e)
            }
        }
    }

    fn resolve(&self, backend: &str, tool: &str) -> Result<Arc<ServerDescriptor>, GatewayError> {
        if let Some(error) = self.registry.rejection(backend) {
            return Err(error.clone());
        }
        self.registry.resolve_tool(backend, tool).cloned()
    }

    /// Wait for a Ready supervisor and register as one of its callers.
    async fn acquire(&self, descriptor: &Arc<ServerDescriptor>) -> Result<Borrow, GatewayError> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let supervisor = self
                .state
                .get_or_create(descriptor, &self.settings, &self.provider);

            match supervisor.wait_ready().await {
                Readiness::Ready => {
                    if let Some(borrow) = supervisor.borrow() {
                        return Ok(borrow);
                    }
                }
                Readiness::Retiring => {}
                Readiness::Failed(e) => return Err(e),
            }

            tracing::debug!(backend = %descriptor.id, "supervisor retiring; waiting for a fresh one");
            supervisor.wait_stopped().await;
            self.state.remove_if_same(&supervisor);
        }

        Err(GatewayError::BackendCrashed {
            backend: descriptor.id.clone(),
            reason: "backend kept stopping before the call could be sent".into(),
        })
    }

    /// Supervisors currently Starting or Ready.
    pub fn list_active(&self) -> Vec<SupervisorStatus> {
        self.state
            .snapshot()
            .iter()
            .filter(|s| matches!(s.state(), State::Starting | State::Ready))
            .map(|s| s.status())
            .collect()
    }

    /// Manually stop a backend.
    pub async fn stop(&self, backend: &str) -> Result<StopOutcome, GatewayError> {
        if self.registry.get(backend).is_none() {
            return Err(GatewayError::UnknownBackend {
                backend: backend.to_string(),
            });
        }
        let Some(supervisor) = self.state.get(backend) else {
            return Ok(StopOutcome::NotRunning);
        };

        let began = supervisor.begin_stop();
        // Also finishes a stop that is already underway or was cancelled.
        supervisor.complete_stop().await;
        let outcome = if began {
            tracing::info!(backend, "backend stopped on request");
            StopOutcome::Stopped
        } else {
            StopOutcome::NotRunning
        };
        self.state.remove_if_same(&supervisor);
        Ok(outcome)
    }

    /// Stop every live backend. Used on exit.
    ///
    /// Supervisors already in `Stopping` are finished too, including ones
    /// whose stop was cut short by a cancelled reaper sweep.
    pub async fn shutdown_all(&self) {
        let supervisors = self.state.snapshot();
        let stopping: Vec<_> = supervisors
            .iter()
            .filter(|s| s.begin_stop() || s.state() == State::Stopping)
            .collect();
        tracing::info!(count = stopping.len(), "stopping all backends");

        futures::future::join_all(stopping.iter().map(|s| s.complete_stop())).await;
        for supervisor in &supervisors {
            self.state.remove_if_same(supervisor);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.registry.len())
            .field("live", &self.state.len())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// Accept an object, `null`, or a string holding a JSON object.
pub fn normalize_arguments(tool: &str, arguments: Value) -> Result<Value, GatewayError> {
    let invalid = |reason: String| GatewayError::InvalidArguments {
        tool: tool.to_string(),
        reason,
    };
    match arguments {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(_) => Ok(arguments),
        Value::String(text) if text.trim().is_empty() => Ok(Value::Object(Default::default())),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(parsed @ Value::Object(_)) => Ok(parsed),
            Ok(_) => Err(invalid("string arguments must encode a JSON object".into())),
            Err(e) => Err(invalid(format!("arguments are not valid JSON: {e}"))),
        },
        other => Err(invalid(format!("expected an object, got {other}"))),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{sample_registry, FakeBehavior, FakeProvider, InitBehavior};
    use serde_json::json;

    fn dispatcher(provider: &Arc<FakeProvider>) -> Dispatcher {
        Dispatcher::new(
            Arc::new(sample_registry()),
            provider.clone(),
            &GatewayConfig::default(),
        )
    }

    fn text(result: &ToolCallResult) -> &str {
        result.content["content"][0]["text"].as_str().unwrap()
    }

    #[test]
    fn test_normalize_arguments() {
        assert_eq!(normalize_arguments("t", Value::Null).unwrap(), json!({}));
        assert_eq!(normalize_arguments("t", json!({"a": 1})).unwrap(), json!({"a": 1}));
        assert_eq!(normalize_arguments("t", json!("{\"a\": 1}")).unwrap(), json!({"a": 1}));
        assert_eq!(normalize_arguments("t", json!("")).unwrap(), json!({}));
        assert!(matches!(
            normalize_arguments("t", json!("[1]")),
            Err(GatewayError::InvalidArguments { .. })
        ));
        assert!(matches!(
            normalize_arguments("t", json!("{oops")),
            Err(GatewayError::InvalidArguments { .. })
        ));
        assert!(matches!(
            normalize_arguments("t", json!(42)),
            Err(GatewayError::InvalidArguments { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_tools_is_static() {
        let provider = FakeProvider::healthy();
        let dispatcher = dispatcher(&provider);
        let before = serde_json::to_value(dispatcher.list_tools()).unwrap();
        assert_eq!(before.as_array().unwrap().len(), 3);
        assert_eq!(provider.spawns(), 0);

        dispatcher.call_tool("calc", "add", json!({"a": 1})).await.unwrap();
        let after = serde_json::to_value(dispatcher.list_tools()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_backend_and_tool_never_spawn() {
        let provider = FakeProvider::healthy();
        let dispatcher = dispatcher(&provider);

        let err = dispatcher.call_tool("nope", "add", Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownBackend { .. }));

        let err = dispatcher.call_tool("calc", "multiply", Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool { .. }));

        let err = dispatcher.call_tool("calc", "add", json!(7)).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidArguments { .. }));

        assert_eq!(provider.spawns(), 0);
        assert!(dispatcher.list_active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_entry_reports_config_error() {
        let registry = Registry::parse("broken:\n  tools: []\n", Duration::from_secs(300)).unwrap();
        let provider = FakeProvider::healthy();
        let dispatcher = Dispatcher::new(Arc::new(registry), provider.clone(), &GatewayConfig::default());

        let err = dispatcher.call_tool("broken", "x", Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::ConfigError { .. }));
        assert_eq!(provider.spawns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_spawn() {
        let provider = FakeProvider::new(FakeBehavior {
            startup_delay: Duration::from_secs(2),
            ..FakeBehavior::default()
        });
        let dispatcher = dispatcher(&provider);

        let calls = (0..8).map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call_tool("calc", "add", json!({"i": i})).await })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(provider.spawns(), 1);
        assert_eq!(provider.log.count("initialize"), 1);
        for result in results {
            assert!(result.unwrap().is_ok());
        }
        assert_eq!(provider.log.count("tools/call"), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_failure_is_shared() {
        let provider = FakeProvider::new(FakeBehavior {
            init: InitBehavior::Error,
            ..FakeBehavior::default()
        });
        let dispatcher = dispatcher(&provider);

        let calls = (0..5).map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call_tool("docs", "get_documentation", Value::Null).await })
        });
        for result in futures::future::join_all(calls).await {
            assert!(matches!(result.unwrap(), Err(GatewayError::HandshakeError { .. })));
        }
        assert_eq!(provider.spawns(), 1);
        assert_eq!(provider.log.count("tools/call"), 0);

        // One call, one attempt: the next call starts over.
        provider.set_behavior(FakeBehavior::default());
        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();
        assert_eq!(provider.spawns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_error_reaches_caller() {
        let provider = FakeProvider::new(FakeBehavior {
            spawn_error: true,
            ..FakeBehavior::default()
        });
        let dispatcher = dispatcher(&provider);
        let err = dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::SpawnError { .. }));
        assert!(dispatcher.list_active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_forwarded_before_ready() {
        let provider = FakeProvider::new(FakeBehavior {
            init: InitBehavior::Silent,
            ..FakeBehavior::default()
        });
        let dispatcher = dispatcher(&provider);
        let err = dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap_err();
        assert!(matches!(err, GatewayError::HandshakeTimeout { .. }));
        assert_eq!(provider.log.events(), vec!["spawn:docs", "initialize"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_propagates_then_fresh_start() {
        let provider = FakeProvider::healthy();
        let dispatcher = dispatcher(&provider);
        dispatcher.call_tool("calc", "add", Value::Null).await.unwrap();

        let stalled = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.call_tool("calc", "add", json!({"stall": true})).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let crashed = dispatcher.call_tool("calc", "divide", json!({"crash": true})).await;

        assert!(matches!(crashed, Err(GatewayError::BackendCrashed { .. })));
        assert!(matches!(stalled.await.unwrap(), Err(GatewayError::BackendCrashed { .. })));
        assert!(dispatcher.list_active().is_empty());

        let result = dispatcher.call_tool("calc", "add", json!({"a": 2})).await.unwrap();
        assert_eq!(text(&result), r#"add:{"a":2}"#);
        assert_eq!(provider.spawns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_after_closed_stdout_starts_fresh_worker() {
        let provider = FakeProvider::healthy();
        let dispatcher = dispatcher(&provider);
        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();

        let hung_up = dispatcher
            .call_tool("docs", "get_documentation", json!({"hangup": true}))
            .await;
        assert!(matches!(hung_up, Err(GatewayError::BackendCrashed { .. })));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = dispatcher
            .call_tool("docs", "get_documentation", json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(text(&result), r#"get_documentation:{"n":1}"#);
        assert_eq!(provider.spawns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_leaves_backend_ready() {
        let provider = FakeProvider::healthy();
        let config = GatewayConfig {
            call_timeout_secs: 1,
            ..GatewayConfig::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(sample_registry()), provider.clone(), &config);

        let err = dispatcher
            .call_tool("calc", "add", json!({"delay_ms": 5000}))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::CallTimeout { .. }));

        let active = dispatcher.list_active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].state, State::Ready);
        assert_eq!(active[0].in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_active_and_stop() {
        let provider = FakeProvider::healthy();
        let dispatcher = dispatcher(&provider);

        assert_eq!(dispatcher.stop("docs").await.unwrap(), StopOutcome::NotRunning);
        assert!(matches!(
            dispatcher.stop("nope").await,
            Err(GatewayError::UnknownBackend { .. })
        ));

        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();
        let active: Vec<String> = dispatcher.list_active().into_iter().map(|s| s.server_id).collect();
        assert_eq!(active, vec!["docs"]);

        assert_eq!(dispatcher.stop("docs").await.unwrap(), StopOutcome::Stopped);
        assert!(dispatcher.list_active().is_empty());
        assert!(dispatcher.state().is_empty());
        assert_eq!(dispatcher.stop("docs").await.unwrap(), StopOutcome::NotRunning);

        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();
        assert_eq!(provider.spawns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_during_stop_waits_for_old_process() {
        let provider = FakeProvider::new(FakeBehavior {
            ignore_terminate: true,
            ..FakeBehavior::default()
        });
        let dispatcher = dispatcher(&provider);
        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();

        let stopper = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.stop("docs").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();
        // The forced stop takes the full grace period before the respawn.
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert_eq!(stopper.await.unwrap().unwrap(), StopOutcome::Stopped);
        assert_eq!(provider.spawns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all() {
        let provider = FakeProvider::healthy();
        let dispatcher = dispatcher(&provider);
        dispatcher.call_tool("docs", "get_documentation", Value::Null).await.unwrap();
        dispatcher.call_tool("calc", "add", Value::Null).await.unwrap();
        assert_eq!(dispatcher.list_active().len(), 2);

        dispatcher.shutdown_all().await;
        assert!(dispatcher.list_active().is_empty());
        assert_eq!(provider.log.count("exit:docs"), 1);
        assert_eq!(provider.log.count("exit:calc"), 1);
    }
}
