//! `tracing`-based process logging, layered independently of the per-task
//! `TaskLog` rows that `TaskStore` persists: this is the operator-facing
//! log, not the maintainer-facing one.

use std::io;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig, RotationPolicy};

/// Owns the non-blocking file writer's flush guard, if file logging is
/// enabled. Dropping it flushes pending log lines.
pub struct LoggerHandle {
    _guard: Option<WorkerGuard>,
}

pub fn init(config: &LoggingConfig) -> anyhow::Result<LoggerHandle> {
    let default_level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let guard = if let Some(ref log_dir) = config.log_dir {
        let appender = match config.rotation {
            RotationPolicy::Daily => tracing_appender::rolling::daily(log_dir, "devpilot.log"),
            RotationPolicy::Hourly => tracing_appender::rolling::hourly(log_dir, "devpilot.log"),
            RotationPolicy::Never => tracing_appender::rolling::never(log_dir, "devpilot.log"),
        };
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_line_number(true)
            .with_filter(env_filter.clone());

        if config.enable_stdout {
            let stdout_layer = build_stdout_layer(config.format, env_filter);
            tracing_subscriber::registry()
                .with(file_layer)
                .with(stdout_layer)
                .init();
        } else {
            tracing_subscriber::registry().with(file_layer).init();
        }
        Some(guard)
    } else {
        let stdout_layer = build_stdout_layer(config.format, env_filter);
        tracing_subscriber::registry().with(stdout_layer).init();
        None
    };

    tracing::info!(
        level = %config.level,
        format = ?config.format,
        file_output = config.log_dir.is_some(),
        "logger initialized"
    );

    Ok(LoggerHandle { _guard: guard })
}

fn build_stdout_layer<S>(
    format: LogFormat,
    filter: EnvFilter,
) -> Box<dyn tracing_subscriber::Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    use tracing_subscriber::Layer;
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stdout)
            .with_target(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(io::stdout)
            .with_target(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => anyhow::bail!("invalid log level: {other}"),
    }
}
