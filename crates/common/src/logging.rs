use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Initialize the tracing subscriber. Returns a guard that must be held for
/// the lifetime of the process when logging to file.
pub fn init_tracing_log(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config {
        LoggingConfig::Console => {
            tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
            None
        }
        LoggingConfig::File { dir_path, file_name } => {
            let appender = tracing_appender::rolling::daily(dir_path, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
    }
}
