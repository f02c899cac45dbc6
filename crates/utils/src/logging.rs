//! Tracing subscriber setup.
//!
//! Everything is driven by environment variables: `COSCHED_LOG_LEVEL`
//! selects the filter (default `info`), `COSCHED_LOG_PATH` redirects
//! output into a daily-rotated file, and `COSCHED_ENABLE_LOG=off`
//! silences logging entirely.

use std::env;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const ENABLE_ENV: &str = "COSCHED_ENABLE_LOG";
const LEVEL_ENV: &str = "COSCHED_LOG_LEVEL";
const PATH_ENV: &str = "COSCHED_LOG_PATH";
const FALLBACK_FILE_PREFIX: &str = "coscheduler.log";
const MAX_ROTATED_FILES: usize = 7;

// The non-blocking appender stops flushing once its guard drops, so the
// guard has to outlive every log call.
static WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    if matches!(env::var(ENABLE_ENV).as_deref(), Ok("off" | "0" | "false")) {
        return EnvFilter::new("off");
    }
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LEVEL_ENV)
        .from_env_lossy()
}

/// Splits a log destination into the directory to rotate under and the
/// file prefix. The destination may name a directory or a file path.
fn rotation_target(path: &Path) -> (PathBuf, String) {
    if path.is_dir() {
        return (path.to_path_buf(), FALLBACK_FILE_PREFIX.to_string());
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(FALLBACK_FILE_PREFIX)
        .to_string();
    (dir, prefix)
}

/// Installs the global subscriber. Output goes to stdout unless
/// `COSCHED_LOG_PATH` is set.
pub fn init() {
    let registry = tracing_subscriber::registry().with(env_filter());

    let Some(path) = env::var(PATH_ENV).ok().map(PathBuf::from) else {
        registry
            .with(fmt::layer().with_writer(io::stdout).with_target(true))
            .init();
        return;
    };

    let (dir, prefix) = rotation_target(&path);
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(MAX_ROTATED_FILES)
        .build(dir)
        .expect("failed to create rolling file appender");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = WORKER_GUARD.set(guard);

    registry
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_target_splits_file_paths() {
        let (dir, prefix) = rotation_target(Path::new("/var/log/cosched/daemon.log"));
        assert_eq!(dir, PathBuf::from("/var/log/cosched"));
        assert_eq!(prefix, "daemon.log");
    }

    #[test]
    fn rotation_target_handles_bare_file_names() {
        let (dir, prefix) = rotation_target(Path::new("daemon.log"));
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(prefix, "daemon.log");
    }

    #[test]
    fn rotation_target_uses_fallback_prefix_for_directories() {
        let tmp = std::env::temp_dir();
        let (dir, prefix) = rotation_target(&tmp);
        assert_eq!(dir, tmp);
        assert_eq!(prefix, FALLBACK_FILE_PREFIX);
    }
}
