//! In-memory worker used by the supervisor, dispatcher, reaper and front-end
//! tests.
//!
//! `FakeProvider` hands out `tokio::io::duplex` pipes wired to a scripted
//! MCP worker task. Per-call behaviour is driven by the `tools/call`
//! arguments:
//!
//! - `delay_ms`: sleep before answering
//! - `stall`: never answer
//! - `crash`: exit immediately without answering
//! - `garbage`: write a non-JSON line before the response
//! - `fail`: answer with a JSON-RPC error
//! - `hangup`: close stdout without answering but keep running
//! - `null_error`: answer with a result and `"error": null`
//! - `bad_error`: answer with an `error` that is not an error object

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::codec::{encode_frame, FrameReader, ReadEvent, DEFAULT_MAX_LINE_BYTES};
use super::errors::GatewayError;
use super::provider::{ProcessControl, ProcessProvider, SpawnedProcess};
use super::registry::Registry;
use super::types::{LaunchSpec, ServerDescriptor, ToolSpec};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the fake answers `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitBehavior {
    Ok,
    Error,
    Silent,
    Crash,
}

/// Per-provider script.
#[derive(Debug, Clone)]
pub(crate) struct FakeBehavior {
    pub init: InitBehavior,
    pub spawn_error: bool,
    /// Delay between spawn and reading the first frame.
    pub startup_delay: Duration,
    /// Keep running after SIGTERM (forces the kill path).
    pub ignore_terminate: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            init: InitBehavior::Ok,
            spawn_error: false,
            startup_delay: Duration::ZERO,
            ignore_terminate: false,
        }
    }
}

/// Everything the fake workers observed, in order.
#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    /// `spawn:<id>`, `exit:<id>`, and one entry per method received.
    pub events: Mutex<Vec<String>>,
}

impl FakeLog {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| e.as_str() == event).count()
    }
}

pub(crate) struct FakeProvider {
    behavior: Mutex<FakeBehavior>,
    spawns: AtomicUsize,
    pub log: Arc<FakeLog>,
}

impl FakeProvider {
    pub fn new(behavior: FakeBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            spawns: AtomicUsize::new(0),
            log: Arc::new(FakeLog::default()),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(FakeBehavior::default())
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn set_behavior(&self, behavior: FakeBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait]
impl ProcessProvider for FakeProvider {
    async fn spawn(&self, descriptor: &ServerDescriptor) -> Result<SpawnedProcess, GatewayError> {
        let behavior = self.behavior.lock().unwrap().clone();
        if behavior.spawn_error {
            return Err(GatewayError::SpawnError {
                backend: descriptor.id.clone(),
                reason: "fake spawn failure".into(),
            });
        }

        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("spawn:{}", descriptor.id));

        let (gateway_stdin, worker_stdin) = tokio::io::duplex(PIPE_CAPACITY);
        let (worker_stdout, gateway_stdout) = tokio::io::duplex(PIPE_CAPACITY);
        let (mut stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);
        let (term_tx, term_rx) = oneshot::channel();

        let log = self.log.clone();
        let id = descriptor.id.clone();
        let handle = tokio::spawn(async move {
            let _ = stderr_tx.write_all(b"fake worker booting\n").await;
            let code = run_worker(worker_stdin, worker_stdout, term_rx, behavior, log.clone()).await;
            log.push(format!("exit:{id}"));
            code
        });

        Ok(SpawnedProcess {
            stdin: Box::new(gateway_stdin),
            stdout: Box::new(gateway_stdout),
            stderr: Some(Box::new(stderr_rx)),
            control: Box::new(FakeControl {
                term_tx: Some(term_tx),
                handle,
                exit: None,
            }),
            pid: None,
        })
    }
}

struct FakeControl {
    term_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<i32>,
    exit: Option<i32>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    async fn terminate(&mut self) {
        if let Some(tx) = self.term_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn kill(&mut self) {
        self.handle.abort();
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        if let Some(code) = self.exit {
            return Ok(Some(code));
        }
        let code = (&mut self.handle).await.unwrap_or(137);
        self.exit = Some(code);
        Ok(Some(code))
    }
}

async fn run_worker(
    stdin: DuplexStream,
    stdout: DuplexStream,
    mut term_rx: oneshot::Receiver<()>,
    behavior: FakeBehavior,
    log: Arc<FakeLog>,
) -> i32 {
    tokio::time::sleep(behavior.startup_delay).await;

    let mut reader = FrameReader::new(stdin, DEFAULT_MAX_LINE_BYTES);
    let writer = Arc::new(tokio::sync::Mutex::new(stdout));
    let mut terminated = false;

    loop {
        let event = tokio::select! {
            _ = &mut term_rx, if !terminated => {
                terminated = true;
                if behavior.ignore_terminate {
                    continue;
                }
                return 0;
            }
            event = reader.next_event() => event,
        };

        let frame = match event {
            Ok(ReadEvent::Frame(frame)) => frame,
            Ok(ReadEvent::Malformed(_)) => continue,
            Ok(ReadEvent::Eof) | Err(_) => {
                if behavior.ignore_terminate {
                    // Hang until killed.
                    std::future::pending::<()>().await;
                }
                return 0;
            }
        };

        let method = frame["method"].as_str().unwrap_or_default().to_string();
        log.push(method.clone());
        let id = frame["id"].clone();

        match method.as_str() {
            "initialize" => match behavior.init {
                InitBehavior::Ok => {
                    let reply = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {
                            "protocolVersion": "2024-11-05",
                            "capabilities": {"tools": {}},
                            "serverInfo": {"name": "fake", "version": "0.0.1"}
                        }
                    });
                    send(&mut *writer.lock().await, &reply).await;
                }
                InitBehavior::Error => {
                    let reply = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32603, "message": "boom"}
                    });
                    send(&mut *writer.lock().await, &reply).await;
                }
                InitBehavior::Silent => {}
                InitBehavior::Crash => return 3,
            },
            "tools/call" => {
                let args = frame["params"]["arguments"].clone();
                if args["crash"].as_bool().unwrap_or(false) {
                    return 1;
                }
                if args["stall"].as_bool().unwrap_or(false) {
                    continue;
                }
                if args["hangup"].as_bool().unwrap_or(false) {
                    let _ = writer.lock().await.shutdown().await;
                    continue;
                }
                let name = frame["params"]["name"].as_str().unwrap_or_default().to_string();
                let writer = writer.clone();
                tokio::spawn(async move {
                    if let Some(ms) = args["delay_ms"].as_u64() {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                    }
                    let mut w = writer.lock().await;
                    if args["garbage"].as_bool().unwrap_or(false) {
                        let _ = w.write_all(b"Traceback (most recent call last): oops\n").await;
                        send(&mut *w, &serde_json::json!([1, 2, 3])).await;
                    }
                    let text = format!("{name}:{args}");
                    let reply = if args["fail"].as_bool().unwrap_or(false) {
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": {"code": -32602, "message": "bad arguments"}
                        })
                    } else if args["bad_error"].as_bool().unwrap_or(false) {
                        serde_json::json!({"jsonrpc": "2.0", "id": id, "error": "kaput"})
                    } else if args["null_error"].as_bool().unwrap_or(false) {
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {"content": [{"type": "text", "text": text}]},
                            "error": null
                        })
                    } else {
                        serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {"content": [{"type": "text", "text": text}]}
                        })
                    };
                    send(&mut *w, &reply).await;
                });
            }
            _ => {}
        }
    }
}

async fn send(out: &mut DuplexStream, msg: &serde_json::Value) {
    if let Ok(bytes) = encode_frame(msg) {
        let _ = out.write_all(&bytes).await;
    }
}

// ─── Fixtures ────────────────────────────────────────────────────────────────

pub(crate) fn descriptor(id: &str, tools: &[&str], idle_timeout: Duration) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        launch: LaunchSpec {
            image: None,
            command: vec!["fake-worker".to_string()],
            environment: BTreeMap::new(),
        },
        idle_timeout,
        concurrent: false,
        tools: tools
            .iter()
            .map(|name| ToolSpec {
                name: name.to_string(),
                description: format!("{name} tool"),
                when_to_use: String::new(),
                parameters: serde_json::json!({"type": "object"}),
            })
            .collect(),
    }
}

/// Registry with `docs` (serialized, 300s idle) and `calc` (pipelined).
pub(crate) fn sample_registry() -> Registry {
    let docs = descriptor("docs", &["get_documentation"], Duration::from_secs(300));
    let mut calc = descriptor("calc", &["add", "divide"], Duration::from_secs(60));
    calc.concurrent = true;
    Registry::from_descriptors(vec![docs, calc]).unwrap()
}
