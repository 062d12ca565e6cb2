//! Gateway configuration loading.
//!
//! Reads an optional YAML file and resolves environment variables. Every
//! field has a default, so a missing file means "all defaults".

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::codec::DEFAULT_MAX_LINE_BYTES;
use super::errors::GatewayError;

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_GATEWAY_CONFIG";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Write to a rotated file in the data directory instead of stderr.
    pub file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            file: true,
        }
    }
}

/// Runtime knobs consumed by the supervisor, dispatcher and reaper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Idle timeout for registry entries that do not set one.
    pub default_idle_timeout_secs: u64,
    /// Deadline for the `initialize` handshake.
    pub startup_timeout_secs: u64,
    /// How long a caller waits for a `tools/call` response.
    pub call_timeout_secs: u64,
    /// Idle reaper tick.
    pub reap_interval_secs: u64,
    /// Wait after graceful termination before force-killing.
    pub stop_grace_secs: u64,
    /// Largest line the codec buffers before dropping it.
    pub max_line_bytes: usize,
    /// Container CLI used for image-based backends.
    pub docker_binary: String,
    pub log: LogConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout_secs: 300,
            startup_timeout_secs: 30,
            call_timeout_secs: 60,
            reap_interval_secs: 30,
            stop_grace_secs: 5,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            docker_binary: "docker".to_string(),
            log: LogConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn default_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.default_idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Reject values that would make the gateway unusable.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let zero = [
            ("default_idle_timeout_secs", self.default_idle_timeout_secs),
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("reap_interval_secs", self.reap_interval_secs),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, v)| *v == 0) {
            return Err(GatewayError::ConfigError {
                reason: format!("{field} must be greater than zero"),
            });
        }
        if self.max_line_bytes == 0 {
            return Err(GatewayError::ConfigError {
                reason: "max_line_bytes must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to read.
///
/// An explicit path wins, then `MCP_GATEWAY_CONFIG`, then
/// `<config_dir>/mcp-gateway/config.yaml` if it exists. `None` means
/// defaults only.
pub fn find_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(expand_tilde(&path)));
        }
    }
    dirs::config_dir()
        .map(|dir| dir.join("mcp-gateway").join("config.yaml"))
        .filter(|candidate| candidate.exists())
}

/// Load and validate a config file, interpolating `${VAR}` and
/// `${VAR:-default}`.
pub fn load_config(path: &Path) -> Result<GatewayConfig, GatewayError> {
    let raw = std::fs::read_to_string(path).map_err(|e| GatewayError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config YAML text. Empty text yields defaults.
pub fn parse_config(raw: &str) -> Result<GatewayConfig, GatewayError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(GatewayConfig::default());
    }

    let config: GatewayConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| GatewayError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.validate()?;
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
