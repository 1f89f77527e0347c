use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use tracing::Subscriber;
use tracing::subscriber;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt};

use crate::config::LoggingSection;

static LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
static ACTIVE_LOG_DIRECTORY: OnceCell<PathBuf> = OnceCell::new();
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

fn install_subscriber<S>(subscriber: S) -> Result<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    subscriber::set_global_default(subscriber)?;
    let _ = TRACING_INITIALIZED.set(());
    Ok(())
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "rabbitdns=debug"
    } else {
        "rabbitdns=info"
    }
}

/// Install the global subscriber: console output (text or JSON) plus an
/// optional daily-rolling JSON log file. Repeat calls are no-ops.
pub fn init_tracing(service: &str, verbose: bool, logging: &LoggingSection) -> Result<()> {
    if TRACING_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let console = if logging.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(false)
            .boxed()
    } else {
        fmt::layer().with_target(false).boxed()
    };

    let file = match logging.directory.as_deref() {
        Some(directory) => {
            let (writer, guard) = build_log_writer(service, directory)?;
            let _ = LOG_GUARD.set(guard);
            let _ = ACTIVE_LOG_DIRECTORY.set(directory.to_path_buf());
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_ansi(false)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file);
    install_subscriber(subscriber)
}

/// Directory receiving rolling log files for this process, if any.
pub fn current_log_directory() -> Option<&'static PathBuf> {
    ACTIVE_LOG_DIRECTORY.get()
}

fn build_log_writer(service: &str, directory: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;
    let appender = tracing_appender::rolling::daily(directory, log_file_prefix(service));
    Ok(tracing_appender::non_blocking(appender))
}

fn log_file_prefix(service: &str) -> String {
    format!("{service}.log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn verbosity_selects_directive() {
        assert_eq!(default_directive(false), "rabbitdns=info");
        assert_eq!(default_directive(true), "rabbitdns=debug");
    }

    #[test]
    fn log_writer_creates_directory() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("logs/nested");
        let (_writer, _guard) = build_log_writer("rabbitdns", &target).expect("writer");
        assert!(target.is_dir());
        assert_eq!(log_file_prefix("rabbitdns"), "rabbitdns.log");
    }
}
