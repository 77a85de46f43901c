use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_log::LogTracer;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub json_format: bool,
    pub log_dir: Option<String>,
    pub colorize: bool,
    pub log_file_name: String,
    /// Targets the level applies to; everything else stays at `warn`
    pub log_targets: Option<Vec<String>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            log_dir: None,
            colorize: true,
            log_file_name: "llm-dispatcher".to_string(),
            log_targets: Some(vec!["llm_dispatcher_rs".to_string()]),
        }
    }
}

/// Keeps the non-blocking file writer flushing until dropped.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Parse a level name the way operators write it (`info`, `WARN`, `warning`).
pub fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "warning" => Some(Level::WARN),
        other => other.parse().ok(),
    }
}

/// Directives used when `RUST_LOG` is not set.
fn default_directives(config: &LoggingConfig) -> String {
    let level = config.level.to_string().to_lowercase();
    match &config.log_targets {
        Some(targets) if !targets.is_empty() => {
            let mut directives = vec!["warn".to_string()];
            directives.extend(targets.iter().map(|t| format!("{t}={level}")));
            directives.join(",")
        }
        _ => level,
    }
}

pub fn init_logging(config: LoggingConfig) -> LogGuard {
    let _ = LogTracer::init();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config)));

    let stdout_layer = if config.json_format {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer()
            .with_ansi(config.colorize)
            .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::new(
                Rotation::DAILY,
                Path::new(dir),
                format!("{}.log", config.log_file_name),
            );
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_timer(ChronoUtc::new(TIME_FORMAT.to_string()))
                .with_file(true)
                .with_line_number(true)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();
    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}
