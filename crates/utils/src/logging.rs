//! provides logging helpers

use std::env;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Directory for rolling log files. Unset means stderr only.
pub const LOG_PATH_ENV_VAR: &str = "PODFLEET_LOG_PATH";

/// initiate the global tracing subscriber
///
/// Events always go to stderr. When [`LOG_PATH_ENV_VAR`] points to a directory,
/// they are also written to a daily rotated `<file_prefix>.*.log` file there;
/// the returned guard must be kept alive to flush that writer.
pub fn init(file_prefix: &str) -> Option<WorkerGuard> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stderr).with_target(true);

    let (file_layer, guard) = match env::var(LOG_PATH_ENV_VAR) {
        Ok(dir) if !dir.is_empty() => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(file_prefix)
                .filename_suffix("log")
                .max_log_files(3)
                .build(&dir);
            match appender {
                Ok(appender) => {
                    let (writer, guard) = tracing_appender::non_blocking(appender);
                    let file_layer = layer().with_writer(writer).with_ansi(false);
                    (Some(file_layer), Some(guard))
                }
                Err(e) => {
                    eprintln!("failed to create log file appender in {dir}: {e}");
                    (None, None)
                }
            }
        }
        _ => (None, None),
    };

    registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    guard
}
