//! Structured logging setup and log housekeeping.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,the_small_kds=debug";
/// Rolling file prefix; daily files are named `kds.YYYY-MM-DD`.
pub const LOG_FILE_PREFIX: &str = "kds";
pub const MAX_LOG_FILES: usize = 7;

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub log_dir: PathBuf,
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub json_file: bool,
    pub console: bool,
    pub max_files: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            default_filter: DEFAULT_FILTER.to_string(),
            json_file: false,
            console: true,
            max_files: MAX_LOG_FILES,
        }
    }
}

/// Platform data directory for log files.
pub fn default_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.thesmall.kds").join("logs")
}

/// Install the global subscriber (console + daily rolling file).
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn init(options: LogOptions) -> Result<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));

    fs::create_dir_all(&options.log_dir)
        .with_context(|| format!("create log dir {}", options.log_dir.display()))?;
    let pruned = prune_old_logs(&options.log_dir, options.max_files);

    let file_appender = tracing_appender::rolling::daily(&options.log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = if options.json_file {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    };
    let console_layer = options
        .console
        .then(|| fmt::layer().with_target(true).boxed());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("install tracing subscriber")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_TIMESTAMP"),
        git = env!("BUILD_GIT_SHA"),
        pruned,
        "Starting The Small KDS engine"
    );
    Ok(guard)
}

/// Keep only the newest `max_files` log files in `dir`. Returns how many
/// were removed.
pub fn prune_old_logs(dir: &Path, max_files: usize) -> usize {
    if !dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&format!("{LOG_FILE_PREFIX}.")) {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first; name breaks ties so equal mtimes prune deterministically.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(max_files) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Version, build timestamp, git SHA and platform.
pub fn about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_newest_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        for day in 1..=5 {
            fs::write(dir.path().join(format!("kds.2026-03-0{day}")), b"x").unwrap();
        }
        fs::write(dir.path().join("other.log"), b"keep").unwrap();

        let removed = prune_old_logs(dir.path(), 3);
        assert_eq!(removed, 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left.len(), 4);
        assert!(left.contains(&"other.log".to_string()));
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(prune_old_logs(&dir.path().join("absent"), 1), 0);
    }

    #[test]
    fn test_about_info_fields() {
        let info = about_info();
        assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));
        assert!(info["buildTimestamp"].is_string());
        assert!(info["gitSha"].is_string());
        assert!(info["platform"].is_string());
    }
}
