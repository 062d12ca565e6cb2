//! Per-backend process supervisor.
//!
//! A `Supervisor` owns exactly one worker process for its whole life:
//!
//! ```text
//! Stopped ──activate──▶ Starting ──handshake ok──▶ Ready ──stop──▶ Stopping ──▶ Stopped
//!                          │                         │
//!                          └── spawn / handshake ────┴── crash ──▶ Failed
//! ```
//!
//! Failed and Stopped supervisors are never reused; the dispatcher replaces
//! them with a fresh instance. State and the pending-request table share one
//! mutex. Writes to the worker go through a separate async lock so a slow
//! write never blocks the reader loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::codec::{FrameReader, FrameWriter, ReadEvent};
use super::config::GatewayConfig;
use super::errors::GatewayError;
use super::provider::{BoxedReader, BoxedWriter, ProcessControl, ProcessProvider, SpawnedProcess};
use super::types::{
    error_codes, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ServerDescriptor, MCP_PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Lines of worker stderr kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on the stderr text attached to an error.
const STDERR_SUFFIX_CHARS: usize = 2000;

type PendingSlot = oneshot::Sender<Result<Value, GatewayError>>;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Lifecycle state of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Stopped => "stopped",
            State::Starting => "starting",
            State::Ready => "ready",
            State::Stopping => "stopping",
            State::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of waiting for an activation.
#[derive(Debug, Clone)]
pub enum Readiness {
    Ready,
    /// Was Ready, now being stopped. The caller should wait and retry.
    Retiring,
    Failed(GatewayError),
}

/// Timing knobs shared by every supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub max_line_bytes: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            stop_grace: config.stop_grace(),
            max_line_bytes: config.max_line_bytes,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Snapshot reported by `list_active_servers`.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub server_id: String,
    pub state: State,
    pub started_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub idle_timeout: u64,
    pub in_flight: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshake,
    Call,
}

struct Inner {
    state: State,
    pending: HashMap<u64, PendingSlot>,
    in_flight: usize,
    last_activity: Instant,
    failure: Option<GatewayError>,
    activated: bool,
    was_ready: bool,
    exited: bool,
    pid: Option<u32>,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

pub struct Supervisor {
    descriptor: Arc<ServerDescriptor>,
    settings: SupervisorSettings,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<State>,
    writer: tokio::sync::Mutex<Option<FrameWriter<BoxedWriter>>>,
    control: tokio::sync::Mutex<Option<Box<dyn ProcessControl>>>,
    call_gate: Arc<Semaphore>,
    next_id: AtomicU64,
    started_at: DateTime<Utc>,
    activation: Mutex<Option<JoinHandle<()>>>,
    stop_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Supervisor {
    /// Create a supervisor in `Stopped`. Nothing runs until [`activate`].
    ///
    /// [`activate`]: Supervisor::activate
    pub fn new(descriptor: Arc<ServerDescriptor>, settings: SupervisorSettings) -> Arc<Self> {
        let permits = if descriptor.concurrent {
            Semaphore::MAX_PERMITS
        } else {
            1
        };
        let (state_tx, _) = watch::channel(State::Stopped);
        Arc::new(Self {
            descriptor,
            settings,
            inner: Mutex::new(Inner {
                state: State::Stopped,
                pending: HashMap::new(),
                in_flight: 0,
                last_activity: Instant::now(),
                failure: None,
                activated: false,
                was_ready: false,
                exited: false,
                pid: None,
            }),
            state_tx,
            writer: tokio::sync::Mutex::new(None),
            control: tokio::sync::Mutex::new(None),
            call_gate: Arc::new(Semaphore::new(permits)),
            next_id: AtomicU64::new(1),
            started_at: Utc::now(),
            activation: Mutex::new(None),
            stop_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            stderr_tail: Arc::new(Mutex::new(VecDeque::new())),
        })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &Arc<ServerDescriptor> {
        &self.descriptor
    }

    pub fn state(&self) -> State {
        self.lock().state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn status(&self) -> SupervisorStatus {
        let inner = self.lock();
        let idle_for = inner.last_activity.elapsed();
        let last_used = chrono::Duration::from_std(idle_for)
            .map(|d| Utc::now() - d)
            .unwrap_or_else(|_| Utc::now());
        SupervisorStatus {
            server_id: self.descriptor.id.clone(),
            state: inner.state,
            started_at: self.started_at,
            last_used,
            idle_timeout: self.descriptor.idle_timeout.as_secs(),
            in_flight: inner.in_flight,
            pid: inner.pid,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, next: State) {
        tracing::debug!(
            backend = %self.descriptor.id,
            from = %inner.state,
            to = %next,
            "state transition"
        );
        inner.state = next;
        if next == State::Ready {
            inner.was_ready = true;
        }
        self.state_tx.send_replace(next);
    }

    // ─── Activation ──────────────────────────────────────────────────────

    /// Move `Stopped → Starting` and launch the worker in the background.
    ///
    /// Returns `false` if this supervisor was already activated. The
    /// transition happens before this returns, so callers holding the
    /// gateway map lock get single-flight for free.
    pub fn activate(self: &Arc<Self>, provider: Arc<dyn ProcessProvider>) -> bool {
        {
            let mut inner = self.lock();
            if inner.activated {
                return false;
            }
            inner.activated = true;
            self.transition(&mut inner, State::Starting);
        }

        let mut slot = self.activation.lock().unwrap_or_else(PoisonError::into_inner);
        let this = self.clone();
        *slot = Some(tokio::spawn(async move { this.run_activation(provider).await }));
        true
    }

    async fn run_activation(self: Arc<Self>, provider: Arc<dyn ProcessProvider>) {
        let backend = self.descriptor.id.clone();
        tracing::info!(backend = %backend, "starting backend");
        let deadline = Instant::now() + self.settings.startup_timeout;

        let spawned = match timeout_at(deadline, provider.spawn(&self.descriptor)).await {
            Ok(Ok(spawned)) => spawned,
            Ok(Err(e)) => {
                tracing::warn!(backend = %backend, error = %e, "spawn failed");
                self.fail(e);
                return;
            }
            Err(_) => {
                self.fail(self.handshake_timeout());
                return;
            }
        };
        self.install(spawned).await;

        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let handshake = match self.dispatch("initialize", Some(params), Phase::Handshake).await {
            Ok((_, rx)) => match timeout_at(deadline, rx).await {
                Ok(Ok(Ok(_))) => Ok(()),
                Ok(Ok(Err(e))) => Err(self.handshake_error(&e)),
                Ok(Err(_)) => Err(self.handshake_error(&"response channel closed")),
                Err(_) => Err(self.handshake_timeout()),
            },
            Err(e) => Err(self.handshake_error(&e)),
        };

        let handshake = match handshake {
            Ok(()) => self
                .notify("notifications/initialized", None)
                .await
                .map_err(|e| self.handshake_error(&e)),
            Err(e) => Err(e),
        };

        if let Err(e) = handshake {
            tracing::warn!(backend = %backend, error = %e, "activation failed");
            self.release_process().await;
            self.fail(e);
            return;
        }

        let died = {
            let mut inner = self.lock();
            if inner.state == State::Starting && !inner.exited {
                inner.last_activity = Instant::now();
                self.transition(&mut inner, State::Ready);
                tracing::info!(backend = %backend, pid = ?inner.pid, "backend ready");
            }
            inner.state == State::Starting
        };
        if died {
            self.release_process().await;
            self.fail(self.handshake_error(&"process exited during startup"));
        }
    }

    /// Take ownership of the spawned streams and start the background tasks.
    async fn install(self: &Arc<Self>, spawned: SpawnedProcess) {
        let SpawnedProcess {
            stdin,
            stdout,
            stderr,
            control,
            pid,
        } = spawned;

        *self.writer.lock().await = Some(FrameWriter::new(stdin));
        *self.control.lock().await = Some(control);
        self.lock().pid = pid;

        let mut tasks = Vec::with_capacity(2);
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(
                self.descriptor.id.clone(),
                stderr,
                self.stderr_tail.clone(),
            )));
        }
        tasks.push(tokio::spawn(self.clone().read_loop(stdout)));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
    }

    /// Mark the activation or session as failed and resolve every waiter.
    fn fail(&self, error: GatewayError) {
        let mut inner = self.lock();
        if !matches!(inner.state, State::Starting | State::Ready) {
            return;
        }
        for (_, slot) in inner.pending.drain() {
            let _ = slot.send(Err(error.clone()));
        }
        inner.failure = Some(error);
        self.transition(&mut inner, State::Failed);
    }

    fn handshake_timeout(&self) -> GatewayError {
        GatewayError::HandshakeTimeout {
            backend: self.descriptor.id.clone(),
            timeout_ms: self.settings.startup_timeout.as_millis() as u64,
        }
    }

    fn handshake_error(&self, cause: &dyn std::fmt::Display) -> GatewayError {
        GatewayError::HandshakeError {
            backend: self.descriptor.id.clone(),
            reason: format!("{cause}{}", self.stderr_suffix()),
        }
    }

    fn stderr_suffix(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        format_stderr_suffix(tail.iter().map(String::as_str))
    }

    /// Wait until activation resolves.
    pub async fn wait_ready(&self) -> Readiness {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                State::Ready => return Readiness::Ready,
                State::Failed => return Readiness::Failed(self.failure()),
                State::Stopping | State::Stopped => {
                    let inner = self.lock();
                    return if inner.was_ready {
                        Readiness::Retiring
                    } else {
                        Readiness::Failed(inner.failure.clone().unwrap_or_else(|| {
                            GatewayError::HandshakeError {
                                backend: self.descriptor.id.clone(),
                                reason: "stopped before becoming ready".into(),
                            }
                        }))
                    };
                }
                State::Starting => {}
            }
            if rx.changed().await.is_err() {
                return Readiness::Failed(self.failure());
            }
        }
    }

    /// Wait until the supervisor has reached a terminal state.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if matches!(*rx.borrow_and_update(), State::Stopped | State::Failed) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn failure(&self) -> GatewayError {
        self.lock()
            .failure
            .clone()
            .unwrap_or_else(|| GatewayError::BackendCrashed {
                backend: self.descriptor.id.clone(),
                reason: "supervisor failed".into(),
            })
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Register a caller. Only succeeds while `Ready`; the reaper cannot
    /// stop this supervisor until the returned guard is dropped.
    pub fn borrow(self: &Arc<Self>) -> Option<Borrow> {
        let mut inner = self.lock();
        if inner.state != State::Ready || inner.exited {
            return None;
        }
        inner.in_flight += 1;
        inner.last_activity = Instant::now();
        Some(Borrow {
            supervisor: self.clone(),
        })
    }

    /// Register a pending slot and write the request frame.
    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        phase: Phase,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, GatewayError>>), GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.lock();
            let allowed = match phase {
                Phase::Handshake => inner.state == State::Starting,
                Phase::Call => inner.state == State::Ready,
            };
            if !allowed || inner.exited {
                return Err(self.crashed(format!("backend is {}", inner.state)));
            }
            inner.pending.insert(id, tx);
        }

        let request = JsonRpcRequest::new(id, method, params);
        if let Err(e) = self.write(&request).await {
            self.lock().pending.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), GatewayError> {
        self.write(&JsonRpcNotification::new(method, params)).await
    }

    async fn write<T: Serialize>(&self, msg: &T) -> Result<(), GatewayError> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(self.crashed("stdin is closed".into()));
        };
        writer
            .send(msg)
            .await
            .map_err(|e| self.crashed(format!("failed to write to stdin: {e}")))
    }

    fn crashed(&self, reason: String) -> GatewayError {
        GatewayError::BackendCrashed {
            backend: self.descriptor.id.clone(),
            reason,
        }
    }

    // ─── Reader ──────────────────────────────────────────────────────────

    async fn read_loop(self: Arc<Self>, stdout: BoxedReader) {
        let mut reader = FrameReader::new(stdout, self.settings.max_line_bytes);
        loop {
            match reader.next_event().await {
                Ok(ReadEvent::Frame(value)) => self.handle_frame(value).await,
                Ok(ReadEvent::Malformed(e)) => {
                    tracing::warn!(backend = %self.descriptor.id, error = %e, "dropped malformed line");
                }
                Ok(ReadEvent::Eof) => break,
                Err(e) => {
                    tracing::warn!(backend = %self.descriptor.id, error = %e, "stdout read failed");
                    break;
                }
            }
        }
        self.handle_exit().await;
    }

    async fn handle_frame(&self, value: Value) {
        // Kept so a broken response can still fail the request it answers.
        let response_id = match value.get("method") {
            None => value.get("id").cloned(),
            Some(_) => None,
        };
        let message = match JsonRpcMessage::classify(value) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(backend = %self.descriptor.id, error = %e, "ignoring frame");
                if let Some(id) = response_id {
                    self.resolve(&id, Err(e));
                }
                return;
            }
        };

        match message {
            JsonRpcMessage::Response { id, outcome } => {
                let outcome = outcome.map_err(|e| GatewayError::BackendError {
                    code: e.code,
                    message: e.message,
                    data: e.data,
                });
                self.resolve(&id, outcome);
            }
            JsonRpcMessage::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    JsonRpcResponse::success(id, serde_json::json!({}))
                } else {
                    tracing::debug!(backend = %self.descriptor.id, %method, "unsupported worker request");
                    JsonRpcResponse::failure(
                        id,
                        error_codes::METHOD_NOT_FOUND,
                        format!("method not supported by gateway: {method}"),
                    )
                };
                if let Err(e) = self.write(&reply).await {
                    tracing::debug!(backend = %self.descriptor.id, error = %e, "could not answer worker request");
                }
            }
            JsonRpcMessage::Notification { method, .. } => {
                tracing::debug!(backend = %self.descriptor.id, %method, "worker notification");
            }
        }
    }

    fn resolve(&self, id: &Value, outcome: Result<Value, GatewayError>) {
        let key = id
            .as_u64()
            .or_else(|| id.as_str().and_then(|s| s.parse().ok()));
        let slot = {
            let mut inner = self.lock();
            let slot = key.and_then(|k| inner.pending.remove(&k));
            if slot.is_some() {
                inner.last_activity = Instant::now();
            }
            slot
        };

        let Some(slot) = slot else {
            tracing::debug!(backend = %self.descriptor.id, %id, "dropping unmatched response");
            return;
        };
        if slot.send(outcome).is_err() {
            tracing::debug!(backend = %self.descriptor.id, %id, "caller gone before response");
        }
    }

    /// Worker stdout closed. Unless a stop is in progress this is a crash.
    ///
    /// Pending callers are failed and the supervisor leaves `Ready` before
    /// the process is reaped, so the next call starts a fresh worker.
    async fn handle_exit(&self) {
        let state = {
            let mut inner = self.lock();
            inner.exited = true;
            inner.state
        };
        if !matches!(state, State::Starting | State::Ready) {
            return;
        }

        let error = self.crashed(format!("process closed stdout{}", self.stderr_suffix()));
        if state == State::Ready {
            tracing::warn!(backend = %self.descriptor.id, error = %error, "backend crashed");
            self.fail(error);
        } else {
            // The activation task turns this into a handshake error and
            // releases the process.
            let mut inner = self.lock();
            for (_, slot) in inner.pending.drain() {
                let _ = slot.send(Err(error.clone()));
            }
            return;
        }

        self.writer.lock().await.take();
        let mut slot = self.control.lock().await;
        if let Some(control) = slot.as_mut() {
            let code = reap(&self.descriptor.id, &mut **control, self.settings.stop_grace, false).await;
            tracing::info!(backend = %self.descriptor.id, exit_code = ?code, "crashed backend reaped");
        }
        slot.take();
    }

    // ─── Stopping ────────────────────────────────────────────────────────

    /// `Ready | Starting → Stopping`. Returns `false` if nothing to stop.
    pub fn begin_stop(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Starting | State::Ready => {
                self.transition(&mut inner, State::Stopping);
                true
            }
            _ => false,
        }
    }

    /// `Ready → Stopping`, but only when idle and unborrowed. Check and
    /// transition happen under the same lock that `borrow` takes.
    pub fn try_begin_idle_stop(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state != State::Ready || inner.in_flight > 0 {
            return false;
        }
        if now.saturating_duration_since(inner.last_activity) < self.descriptor.idle_timeout {
            return false;
        }
        self.transition(&mut inner, State::Stopping);
        true
    }

    /// Tear the worker down after [`begin_stop`]: close stdin, terminate,
    /// wait for the grace period, then kill.
    ///
    /// [`begin_stop`]: Supervisor::begin_stop
    pub async fn complete_stop(&self) {
        let _stopping = self.stop_lock.lock().await;
        if self.state() != State::Stopping {
            return;
        }

        let activation = self
            .activation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = activation {
            handle.abort();
            let _ = handle.await;
        }

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }

        // The control stays in its slot until reaped, so a stop cancelled
        // midway can be finished by the next caller.
        let code = {
            let mut slot = self.control.lock().await;
            let code = match slot.as_mut() {
                Some(control) => {
                    reap(&self.descriptor.id, &mut **control, self.settings.stop_grace, true).await
                }
                None => None,
            };
            slot.take();
            code
        };

        {
            let mut inner = self.lock();
            if inner.state == State::Stopping {
                for (_, slot) in inner.pending.drain() {
                    let _ = slot.send(Err(self.crashed("stopped while request pending".into())));
                }
                self.transition(&mut inner, State::Stopped);
            }
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        tracing::info!(backend = %self.descriptor.id, exit_code = ?code, "backend stopped");
    }

    /// `begin_stop` + `complete_stop`. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        if !self.begin_stop() {
            return false;
        }
        self.complete_stop().await;
        true
    }

    /// Kill whatever the activation spawned, after a failed handshake.
    async fn release_process(&self) {
        self.writer.lock().await.take();
        let control = self.control.lock().await.take();
        if let Some(mut control) = control {
            control.kill().await;
            let _ = control.wait().await;
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("id", &self.descriptor.id)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Borrow ──────────────────────────────────────────────────────────────────

/// A caller's claim on a Ready supervisor. Holds the refcount up while alive.
pub struct Borrow {
    supervisor: Arc<Supervisor>,
}

impl Borrow {
    /// Forward a `tools/call` and wait up to `timeout` for the answer.
    ///
    /// On timeout the request stays registered. A late answer is dropped,
    /// and for serialized backends the write slot stays taken until then.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let sup = &self.supervisor;
        let deadline = Instant::now() + timeout;
        let timed_out = || GatewayError::CallTimeout {
            backend: sup.descriptor.id.clone(),
            tool: tool.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let permit = match timeout_at(deadline, sup.call_gate.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(sup.crashed("call gate closed".into())),
            Err(_) => return Err(timed_out()),
        };

        let params = serde_json::json!({ "name": tool, "arguments": arguments });
        let (id, mut rx) = sup.dispatch("tools/call", Some(params), Phase::Call).await?;

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(sup.crashed("response channel closed".into())),
            Err(_) => {
                tracing::warn!(
                    backend = %sup.descriptor.id,
                    tool,
                    request_id = id,
                    "call timed out; abandoning wait"
                );
                abandon(sup.descriptor.id.clone(), id, rx, permit);
                Err(timed_out())
            }
        }
    }
}

impl Drop for Borrow {
    fn drop(&mut self) {
        let mut inner = self.supervisor.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.last_activity = Instant::now();
    }
}

/// Keep the slot (and permit) alive until the abandoned request resolves.
fn abandon(
    backend: String,
    id: u64,
    rx: oneshot::Receiver<Result<Value, GatewayError>>,
    permit: OwnedSemaphorePermit,
) {
    tokio::spawn(async move {
        let _permit = permit;
        match rx.await {
            Ok(Ok(_)) | Ok(Err(GatewayError::BackendError { .. })) => {
                tracing::debug!(backend = %backend, request_id = id, "discarding late response");
            }
            Ok(Err(_)) | Err(_) => {}
        }
    });
}

// ─── Process Helpers ─────────────────────────────────────────────────────────

/// Wait for the process to exit, terminating it first if `graceful`.
async fn reap(
    backend: &str,
    control: &mut dyn ProcessControl,
    grace: Duration,
    graceful: bool,
) -> Option<i32> {
    if graceful {
        control.terminate().await;
    }
    match tokio::time::timeout(grace, control.wait()).await {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            tracing::warn!(backend, error = %e, "wait failed; killing");
            control.kill().await;
            None
        }
        Err(_) => {
            tracing::warn!(backend, grace_ms = grace.as_millis() as u64, "did not exit in time; killing");
            control.kill().await;
            control.wait().await.ok().flatten()
        }
    }
}

async fn drain_stderr(backend: String, stderr: BoxedReader, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(backend = %backend, "stderr: {line}");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// ` | stderr: ...` for error messages, empty if there was no output.
fn format_stderr_suffix<'a>(lines: impl Iterator<Item = &'a str>) -> String {
    let mut text = lines.collect::<Vec<_>>().join("\n");
    if text.trim().is_empty() {
        return String::new();
    }
    if text.chars().count() > STDERR_SUFFIX_CHARS {
        text = text.chars().take(STDERR_SUFFIX_CHARS).collect();
        text.push_str("...(truncated)");
    }
    format!(" | stderr: {}", text.trim())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
