use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "risk-guard.log";

/// Initialise the global tracing subscriber for the monitor service.
///
/// These are operational logs (`<log_dir>/risk-guard.log.<date>`, JSON,
/// rolled daily, plus a compact stderr copy). Cycle decisions, trips and
/// resets are audited separately in the evidence log, which is written
/// synchronously and never depends on this subscriber or its buffer.
///
/// Returns a [`WorkerGuard`] that **must** be held for the lifetime of the
/// process. Dropping it flushes and closes the file writer.
pub fn init_tracing(logging: &LoggingConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&logging.log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&logging.log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(env_filter(&logging.filter))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .json(),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .compact(),
        )
        .init();

    Ok(guard)
}

/// Stderr-only subscriber for one-shot CLI commands (`status`, `trip`,
/// `reset`, `verify`) so they never write into the service log directory.
pub fn init_cli_tracing() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("risk_guard=warn"))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// `RUST_LOG` wins; otherwise the configured directive.
fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Whether `directive` is a usable filter string.
pub fn is_valid_filter(directive: &str) -> bool {
    EnvFilter::try_new(directive).is_ok()
}
