//! Logging setup for Kasir Core.
//!
//! Console output plus a daily rolling file in the per-platform data
//! directory. Old files are pruned at startup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "kasir";
const DEFAULT_FILTER: &str = "info,kasir_core=debug";
const APP_DIR: &str = "id.kasir.pos";

/// Per-user data directory of the terminal: the local mirror lives here
/// and logs go to its `logs` subdirectory.
pub fn default_data_dir() -> PathBuf {
    let home = |var: &str| std::env::var_os(var).map(PathBuf::from);
    let base = home("LOCALAPPDATA")
        .or_else(|| home("XDG_DATA_HOME"))
        .or_else(|| home("HOME").map(|h| h.join(".local").join("share")))
        .or_else(|| home("USERPROFILE").map(|h| h.join("AppData").join("Local")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(APP_DIR)
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Delete all but the newest `MAX_LOG_FILES` log files in `log_dir`.
/// Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            Some((path, modified))
        })
        .collect();

    // newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install the global subscriber, writing files under `data_dir` (or
/// `default_data_dir()`). Keep the returned guard alive for the lifetime
/// of the process; dropping it flushes the file writer.
pub fn init_logging(data_dir: Option<&Path>) -> anyhow::Result<WorkerGuard> {
    let log_dir = match data_dir {
        Some(dir) => log_dir(dir),
        None => log_dir(&default_data_dir()),
    };
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let pruned = prune_old_logs(&log_dir);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing tracing subscriber")?;

    info!(
        log_dir = %log_dir.display(),
        pruned,
        "Kasir Core v{} logging initialised",
        env!("CARGO_PKG_VERSION")
    );
    Ok(guard)
}
