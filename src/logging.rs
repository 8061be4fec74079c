//! Logging initialization
//!
//! One rolling file sink - JSON when configured, for log shippers - and
//! a colored stdout mirror for human runs. `RUST_LOG` overrides the
//! configured level so operators can raise verbosity without touching
//! the config file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;

fn rotation_of(raw: &str) -> Rotation {
    match raw {
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop; hold it for the life of the process.
pub fn init_logging(config: &LogConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation_of(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false);
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // Machine-readable sink only; stdout stays quiet in JSON mode.
        registry.with(file_layer.json()).init();
    } else {
        registry
            .with(file_layer.compact().with_target(false))
            .with(fmt::layer().compact().with_target(false))
            .init();
    }

    guard
}
