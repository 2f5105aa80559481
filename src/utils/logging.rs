use anyhow::Result;
use clap::ValueEnum;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::settings::{AgentConfig, LogFormat, LoggingConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    TRACE,
    DEBUG,
    INFO,
    WARN,
    ERROR,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match *self {
            LogLevel::TRACE => "trace",
            LogLevel::DEBUG => "debug",
            LogLevel::INFO => "info",
            LogLevel::WARN => "warn",
            LogLevel::ERROR => "error",
        }
    }
}

/// Resolve the logging config (CLI flag wins over config file, both over
/// the "info" default) and initialize the subscriber.
pub fn run(config: &AgentConfig, arg_log_level: Option<LogLevel>) -> Result<()> {
    let base = config.logging.clone().unwrap_or_else(|| LoggingConfig {
        level: "info".to_owned(),
        format: LogFormat::from_env(),
    });

    let logging_config = match arg_log_level {
        Some(level) => LoggingConfig::new(level.as_str().to_owned(), base.format),
        None => base,
    };

    init_logging(&logging_config);
    Ok(())
}

/// Install the global tracing subscriber. An invalid level directive falls
/// back to "info" instead of failing startup.
pub fn init_logging(cfg: &LoggingConfig) {
    let level_filter =
        EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(level_filter);
    let timestamps = UtcTime::rfc_3339();

    // JSON goes to container log collectors, which want single-line events
    // with no escape sequences; compact is for a human at a terminal.
    match cfg.format {
        LogFormat::Json => {
            let _ = subscriber
                .with(
                    fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_ansi(false)
                        .with_timer(timestamps),
                )
                .try_init();
        }
        LogFormat::Compact => {
            let _ = subscriber
                .with(fmt::layer().compact().with_timer(timestamps))
                .try_init();
        }
    }
}
