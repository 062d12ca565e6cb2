//! Backend registry: the static table of descriptors loaded at startup.
//!
//! Provides:
//! - Loading `servers.yaml` (a mapping of backend id → entry)
//! - Per-entry validation; a bad entry is rejected alone, the rest load
//! - Tool lookup by `(backend id, tool name)` without spawning anything
//! - The aggregated catalog exposed to clients

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use super::errors::GatewayError;
use super::types::{CatalogEntry, LaunchSpec, ServerDescriptor, ToolSpec};

// ─── Raw entry ───────────────────────────────────────────────────────────────

/// `command` may be written as one string or as an argv list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CommandField {
    Line(String),
    Argv(Vec<String>),
}

impl CommandField {
    fn into_argv(self) -> Vec<String> {
        match self {
            CommandField::Line(line) => line.split_whitespace().map(String::from).collect(),
            CommandField::Argv(argv) => argv,
        }
    }
}

/// A registry entry as written in the file.
///
/// Keys the gateway does not use (`description`, `resources`, `meta`, ...)
/// are accepted and ignored.
#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    command: Option<CommandField>,
    #[serde(default)]
    environment: BTreeMap<String, serde_yaml::Value>,
    /// Seconds.
    #[serde(default)]
    idle_timeout: Option<u64>,
    #[serde(default)]
    concurrent: bool,
    #[serde(default)]
    tools: Vec<ToolSpec>,
    #[serde(flatten)]
    ignored: BTreeMap<String, serde_yaml::Value>,
}

/// An entry that failed validation and will never be activatable.
#[derive(Debug, Clone)]
pub struct RejectedEntry {
    pub id: String,
    pub error: GatewayError,
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Immutable, process-wide table of backend descriptors.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    servers: BTreeMap<String, Arc<ServerDescriptor>>,
    rejected: Vec<RejectedEntry>,
}

impl Registry {
    /// Build a registry from already-validated descriptors.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ServerDescriptor>,
    ) -> Result<Self, GatewayError> {
        let mut servers = BTreeMap::new();
        for desc in descriptors {
            validate_tools(&desc.id, &desc.tools)?;
            let id = desc.id.clone();
            if servers.insert(id.clone(), Arc::new(desc)).is_some() {
                return Err(GatewayError::ConfigError {
                    reason: format!("duplicate backend id '{id}'"),
                });
            }
        }
        Ok(Self {
            servers,
            rejected: Vec::new(),
        })
    }

    /// Load the registry file. A missing file yields an empty registry.
    pub fn load(path: &Path, default_idle_timeout: Duration) -> Result<Self, GatewayError> {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "registry file not found, using empty registry"
            );
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        let registry = Self::parse(&raw, default_idle_timeout)?;

        tracing::info!(
            path = %path.display(),
            loaded = registry.len(),
            rejected = registry.rejected.len(),
            "registry loaded"
        );
        Ok(registry)
    }

    /// Parse registry YAML.
    ///
    /// Only a document that is not a mapping of entries fails as a whole;
    /// malformed entries are collected in [`Registry::rejected`].
    pub fn parse(raw: &str, default_idle_timeout: Duration) -> Result<Self, GatewayError> {
        let interpolated = super::config::interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }

        let document: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&interpolated)
            .map_err(|e| GatewayError::ConfigError {
                reason: format!("registry must be a mapping of backend id to entry: {e}"),
            })?;

        let mut registry = Self::default();
        for (id, value) in document {
            match build_descriptor(&id, value, default_idle_timeout) {
                Ok(desc) => {
                    registry.servers.insert(id, Arc::new(desc));
                }
                Err(error) => {
                    tracing::error!(backend = %id, error = %error, "rejected registry entry");
                    registry.rejected.push(RejectedEntry { id, error });
                }
            }
        }
        Ok(registry)
    }

    /// Look up a backend descriptor.
    pub fn get(&self, id: &str) -> Option<&Arc<ServerDescriptor>> {
        self.servers.get(id)
    }

    /// Check that `tool` is declared for `backend`. Never spawns anything.
    pub fn resolve_tool(
        &self,
        backend: &str,
        tool: &str,
    ) -> Result<&Arc<ServerDescriptor>, GatewayError> {
        let desc = self.get(backend).ok_or_else(|| GatewayError::UnknownBackend {
            backend: backend.to_string(),
        })?;
        if desc.tool(tool).is_none() {
            return Err(GatewayError::UnknownTool {
                backend: backend.to_string(),
                tool: tool.to_string(),
            });
        }
        Ok(desc)
    }

    /// The union of every descriptor's tools, ordered by backend id then
    /// declaration order.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.servers
            .values()
            .flat_map(|desc| {
                desc.tools.iter().map(move |tool| CatalogEntry {
                    server: desc.id.clone(),
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    when_to_use: tool.when_to_use.clone(),
                    parameters: tool.parameters.clone(),
                })
            })
            .collect()
    }

    /// All loaded backend ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Entries that failed validation.
    pub fn rejected(&self) -> &[RejectedEntry] {
        &self.rejected
    }

    /// The load error of a rejected entry.
    pub fn rejection(&self, id: &str) -> Option<&GatewayError> {
        self.rejected.iter().find(|r| r.id == id).map(|r| &r.error)
    }

    /// Number of loaded backends.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no backend loaded.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

// ─── Validation ──────────────────────────────────────────────────────────────

fn config_error(id: &str, reason: impl std::fmt::Display) -> GatewayError {
    GatewayError::ConfigError {
        reason: format!("backend '{id}': {reason}"),
    }
}

fn build_descriptor(
    id: &str,
    value: serde_yaml::Value,
    default_idle_timeout: Duration,
) -> Result<ServerDescriptor, GatewayError> {
    if id.trim().is_empty() {
        return Err(config_error(id, "id must not be empty"));
    }

    let raw: RawEntry = serde_yaml::from_value(value).map_err(|e| config_error(id, e))?;
    if !raw.ignored.is_empty() {
        let keys: Vec<&str> = raw.ignored.keys().map(String::as_str).collect();
        tracing::debug!(backend = %id, ?keys, "ignoring registry keys");
    }

    let image = raw.image.filter(|image| !image.trim().is_empty());
    let command = raw.command.map(CommandField::into_argv).unwrap_or_default();
    if image.is_none() && command.is_empty() {
        return Err(config_error(id, "either 'image' or 'command' is required"));
    }

    let idle_timeout = match raw.idle_timeout {
        Some(0) => return Err(config_error(id, "idle_timeout must be greater than zero")),
        Some(secs) => Duration::from_secs(secs),
        None => default_idle_timeout,
    };

    validate_tools(id, &raw.tools)?;

    let environment = raw
        .environment
        .into_iter()
        .map(|(key, value)| env_value(id, &key, value).map(|value| (key, value)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    Ok(ServerDescriptor {
        id: id.to_string(),
        launch: LaunchSpec {
            image,
            command,
            environment,
        },
        idle_timeout,
        concurrent: raw.concurrent,
        tools: raw.tools,
    })
}

/// Environment values may be any YAML scalar; they reach the worker as text.
fn env_value(id: &str, key: &str, value: serde_yaml::Value) -> Result<String, GatewayError> {
    match value {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        _ => Err(config_error(
            id,
            format!("environment variable '{key}' must be a scalar"),
        )),
    }
}

fn validate_tools(id: &str, tools: &[ToolSpec]) -> Result<(), GatewayError> {
    let mut seen = HashSet::new();
    for tool in tools {
        if tool.name.trim().is_empty() {
            return Err(config_error(id, "tool name must not be empty"));
        }
        if !seen.insert(tool.name.as_str()) {
            return Err(config_error(id, format!("duplicate tool '{}'", tool.name)));
        }
        if !tool.parameters.is_object() {
            return Err(config_error(
                id,
                format!("parameters of tool '{}' must be an object", tool.name),
            ));
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
