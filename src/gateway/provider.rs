//! Process providers: how a backend's worker process comes into existence.
//!
//! The supervisor only sees a [`SpawnedProcess`]: a pair of byte streams plus
//! a [`ProcessControl`] for exit notification and termination. Which
//! runtime sits behind it (plain subprocess, `docker run -i`, an in-memory
//! fake in tests) is the provider's business.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use super::errors::GatewayError;
use super::types::ServerDescriptor;

/// Timeout for the out-of-band `docker kill` issued on force-kill.
const DOCKER_KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed write half of a worker's stdin.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed read half of a worker's stdout or stderr.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Capability ──────────────────────────────────────────────────────────────

/// Exit notification and termination for one spawned worker.
#[async_trait]
pub trait ProcessControl: Send {
    /// Ask the worker to exit (SIGTERM or the runtime's equivalent).
    async fn terminate(&mut self);

    /// Force the worker down.
    async fn kill(&mut self);

    /// Wait for the worker to exit. Returns the exit code when known.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;
}

/// A freshly spawned worker.
pub struct SpawnedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub control: Box<dyn ProcessControl>,
    pub pid: Option<u32>,
}

/// Creates worker processes from descriptors.
#[async_trait]
pub trait ProcessProvider: Send + Sync {
    async fn spawn(&self, descriptor: &ServerDescriptor) -> Result<SpawnedProcess, GatewayError>;
}

// ─── Child process control ───────────────────────────────────────────────────

/// [`ProcessControl`] over a `tokio::process::Child`.
struct ChildControl {
    backend: String,
    child: Child,
    /// `(docker binary, container name)` when the child is a `docker run`.
    container: Option<(String, String)>,
}

#[async_trait]
impl ProcessControl for ChildControl {
    async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                tracing::debug!(backend = %self.backend, pid, "sending SIGTERM");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::warn!(backend = %self.backend, pid, error = %e, "SIGTERM failed");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(backend = %self.backend, error = %e, "kill failed");
        }

        // Killing the docker CLI does not stop the container it attached to.
        if let Some((docker, name)) = &self.container {
            let status = tokio::time::timeout(
                DOCKER_KILL_TIMEOUT,
                Command::new(docker)
                    .args(["kill", name.as_str()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status(),
            )
            .await;
            match status {
                Ok(Ok(status)) if status.success() => {
                    tracing::debug!(backend = %self.backend, container = %name, "container killed");
                }
                Ok(Ok(_)) => {
                    // Already gone (--rm removed it), nothing to do.
                }
                Ok(Err(e)) => {
                    tracing::warn!(backend = %self.backend, container = %name, error = %e, "docker kill failed");
                }
                Err(_) => {
                    tracing::warn!(backend = %self.backend, container = %name, "docker kill timed out");
                }
            }
        }
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

/// Spawn `program args...` with piped stdio.
fn spawn_child(
    backend: &str,
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    container: Option<(String, String)>,
) -> Result<SpawnedProcess, GatewayError> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in envs {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| GatewayError::SpawnError {
        backend: backend.to_string(),
        reason: format!("{program}: {e}"),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| GatewayError::SpawnError {
        backend: backend.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| GatewayError::SpawnError {
        backend: backend.to_string(),
        reason: "failed to capture stdout".into(),
    })?;
    let stderr = child.stderr.take();
    let pid = child.id();

    Ok(SpawnedProcess {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: stderr.map(|s| Box::new(s) as BoxedReader),
        control: Box::new(ChildControl {
            backend: backend.to_string(),
            child,
            container,
        }),
        pid,
    })
}

// ─── Providers ───────────────────────────────────────────────────────────────

/// Runs `command[0] command[1..]` directly on the host.
#[derive(Debug, Clone, Default)]
pub struct CommandProvider;

#[async_trait]
impl ProcessProvider for CommandProvider {
    async fn spawn(&self, descriptor: &ServerDescriptor) -> Result<SpawnedProcess, GatewayError> {
        let (program, args) =
            descriptor
                .launch
                .command
                .split_first()
                .ok_or_else(|| GatewayError::SpawnError {
                    backend: descriptor.id.clone(),
                    reason: "empty command".into(),
                })?;

        let envs: Vec<(String, String)> = descriptor
            .launch
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        tracing::info!(backend = %descriptor.id, program = %program, "starting process");
        spawn_child(&descriptor.id, program, args, &envs, None)
    }
}

/// Runs the descriptor's image with `docker run -i --rm`.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    docker_binary: String,
}

impl DockerProvider {
    pub fn new(docker_binary: impl Into<String>) -> Self {
        Self {
            docker_binary: docker_binary.into(),
        }
    }

    /// Build the `docker` argv for a descriptor.
    pub fn run_args(descriptor: &ServerDescriptor, container_name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];
        for (key, value) in &descriptor.launch.environment {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(image) = &descriptor.launch.image {
            args.push(image.clone());
        }
        args.extend(descriptor.launch.command.iter().cloned());
        args
    }

    /// Unique, docker-legal container name for one activation.
    pub fn container_name(backend_id: &str) -> String {
        let sanitized: String = backend_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("mcp-gw-{sanitized}-{}", &suffix[..12])
    }
}

#[async_trait]
impl ProcessProvider for DockerProvider {
    async fn spawn(&self, descriptor: &ServerDescriptor) -> Result<SpawnedProcess, GatewayError> {
        let Some(image) = &descriptor.launch.image else {
            return Err(GatewayError::SpawnError {
                backend: descriptor.id.clone(),
                reason: "descriptor has no image".into(),
            });
        };

        let name = Self::container_name(&descriptor.id);
        let args = Self::run_args(descriptor, &name);
        tracing::info!(
            backend = %descriptor.id,
            image = %image,
            container = %name,
            "starting container"
        );
        spawn_child(
            &descriptor.id,
            &self.docker_binary,
            &args,
            &[],
            Some((self.docker_binary.clone(), name)),
        )
    }
}

/// Image-based descriptors go to Docker, the rest run as plain commands.
#[derive(Debug, Clone)]
pub struct RoutingProvider {
    command: CommandProvider,
    docker: DockerProvider,
}

impl RoutingProvider {
    pub fn new(docker_binary: impl Into<String>) -> Self {
        Self {
            command: CommandProvider,
            docker: DockerProvider::new(docker_binary),
        }
    }
}

#[async_trait]
impl ProcessProvider for RoutingProvider {
    async fn spawn(&self, descriptor: &ServerDescriptor) -> Result<SpawnedProcess, GatewayError> {
        if descriptor.launch.image.is_some() {
            self.docker.spawn(descriptor).await
        } else {
            self.command.spawn(descriptor).await
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
