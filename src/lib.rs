pub mod gateway;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use gateway::config::{LogConfig, LogFormat};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "mcp_gateway=info,warn";

const LOG_FILE_NAME: &str = "gateway.log";

/// Previous runs kept next to `gateway.log`.
const LOG_FILES_KEPT: u32 = 3;

/// `<platform data dir>/mcp-gateway`, or `~/.mcp-gateway` where the platform
/// has none.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-gateway");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-gateway")
}

/// Initialize the tracing subscriber.
///
/// stdout carries the front-end protocol, so logs go to a rotated
/// `gateway.log` in the data directory, or to stderr when file logging is
/// off, forced off, or the file cannot be opened. Returns the log file path
/// when one is in use.
pub fn init_tracing(config: &LogConfig, force_stderr: bool) -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let log_file = if config.file && !force_stderr {
        open_log_file(&data_dir())
    } else {
        None
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    // `File` is unbuffered, so every event reaches the OS as it is written.
    let (log_path, installed) = match log_file {
        Some((path, file)) => {
            let writer = Mutex::new(file);
            let installed = match config.format {
                LogFormat::Json => builder.json().with_writer(writer).try_init(),
                LogFormat::Text => builder.with_writer(writer).try_init(),
            };
            (Some(path), installed)
        }
        None => {
            let installed = match config.format {
                LogFormat::Json => builder.json().with_writer(std::io::stderr).try_init(),
                LogFormat::Text => builder.with_writer(std::io::stderr).try_init(),
            };
            (None, installed)
        }
    };
    if installed.is_err() {
        // A subscriber is already set (tests, embedding); keep it.
        return None;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "mcp-gateway starting"
    );
    log_path
}

/// Shift the previous logs aside and open a fresh `<dir>/gateway.log`.
fn open_log_file(dir: &Path) -> Option<(PathBuf, File)> {
    std::fs::create_dir_all(dir).ok()?;
    let current = dir.join(LOG_FILE_NAME);
    shift_logs(&current, LOG_FILES_KEPT);

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&current)
        .ok()?;
    Some((current, file))
}

/// `gateway.log` becomes `gateway.log.1`, `.1` becomes `.2`, and so on up
/// to `.{keep}`; whatever sat at `.{keep}` is overwritten.
fn shift_logs(current: &Path, keep: u32) {
    let numbered = |n: u32| {
        let mut name = current.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    for n in (1..=keep).rev() {
        let source = match n {
            1 => current.to_path_buf(),
            _ => numbered(n - 1),
        };
        if source.exists() {
            let _ = std::fs::rename(&source, numbered(n));
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
