//! Structured logging setup using `tracing-subscriber` and `tracing-appender`.
//!
//! Two modes:
//! - **Production** ([`init_production`]): JSON file layer (daily rotation) + console layer
//! - **CLI** ([`init_cli`]): console-only for one-shot subcommands
//!
//! Both tools share this module; the file prefix tells their logs apart, and
//! the `[logging]` table of each config file feeds [`LogConfig`].

use std::path::Path;

use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Holds the non-blocking writer guard for file logging.
///
/// The [`WorkerGuard`] must be kept alive for the duration of the process.
/// Dropping it flushes pending log entries and closes the file.
pub struct LoggingGuard {
    _guard: Option<WorkerGuard>,
}

/// The `[logging]` table shared by both config files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `sitter=debug,info`.
    pub level: String,
    /// Write JSON lines to the daily log file next to the console output.
    pub json_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            json_file: true,
        }
    }
}

impl LogConfig {
    fn filter(&self) -> anyhow::Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| anyhow::anyhow!("invalid logging.level '{}': {e}", self.level)),
        }
    }
}

/// Initialise logging for a long-running tool.
///
/// Writes JSON logs to `{logs_dir}/{prefix}.log.YYYY-MM-DD` with daily
/// rotation unless `config.json_file` is off, plus human-readable output to
/// stderr. Both are filtered by `RUST_LOG`, falling back to `config.level`.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created or the level is
/// not a valid filter.
pub fn init_production(
    logs_dir: &Path,
    prefix: &str,
    config: &LogConfig,
) -> anyhow::Result<LoggingGuard> {
    let env_filter = config.filter()?;

    let (json_layer, guard) = if config.json_file {
        std::fs::create_dir_all(logs_dir).map_err(|e| {
            anyhow::anyhow!(
                "failed to create logs directory {}: {e}",
                logs_dir.display()
            )
        })?;
        let file_appender = tracing_appender::rolling::daily(logs_dir, format!("{prefix}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise console-only logging for one-shot subcommands.
///
/// Controlled by `RUST_LOG` (default: `warn`, so JSON printed on stdout stays
/// the only output of a clean run). Returns whether this call installed the
/// subscriber; a later call keeps the first one.
pub fn init_cli() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "subscriber already installed");
            false
        }
    }
}
