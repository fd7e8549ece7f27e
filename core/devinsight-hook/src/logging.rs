//! File logging for the hook.
//!
//! Editors spawn the hook with stdout/stderr discarded, so diagnostics go to a
//! daily-rotated file under `~/.devinsight/logs`. `DEVINSIGHT_HOOK_LOG` takes
//! an `EnvFilter` directive (default `warn`).

use fs_err as fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DEVINSIGHT_HOOK_LOG";
const LOG_FILE_PREFIX: &str = "hook.log";

/// Installs the subscriber. The returned guard must live until exit so
/// buffered lines are flushed. Logging is best-effort: `None` means the hook
/// runs without it.
pub fn init() -> Option<WorkerGuard> {
    let log_dir = dirs::home_dir()?.join(".devinsight").join("logs");
    fs::create_dir_all(&log_dir).ok()?;

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
