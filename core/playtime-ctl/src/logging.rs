//! File logging for the CLI. Stdout carries command output, so logs go to
//! `~/.playtime/logs/ctl.log.<date>`.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PLAYTIME_CTL_LOG";

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".playtime").join("logs"))
}

/// Returns `None` when no log directory is available; the CLI still works.
pub fn init() -> Option<WorkerGuard> {
    let dir = log_dir()?;
    fs_err::create_dir_all(&dir).ok()?;

    let appender = tracing_appender::rolling::daily(dir, "ctl.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;
    Some(guard)
}
