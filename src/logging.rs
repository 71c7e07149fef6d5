use std::fs;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "acquisition-flux.log";

/// Keeps the file writer flushing until dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker: Option<WorkerGuard>,
}

/// Installs the global subscriber: a daily rotated file (UTC) when a log
/// directory is configured, the console when verbose or when there is no
/// file.
pub fn init_logging(
    cfg: &LoggingConfig,
) -> Result<LoggingGuard, Box<dyn std::error::Error + Send + Sync>> {
    let level = LevelFilter::from_level(cfg.effective_level());

    let (file_layer, worker) = match &cfg.dirpath {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(UtcTime::rfc_3339())
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let console_layer = (cfg.verbose || cfg.dirpath.is_none()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true)
    });

    tracing_subscriber::registry()
        .with(level)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::info!("Logger initialized, [{}] level.", level);
    if let Some(dir) = &cfg.dirpath {
        tracing::info!("Current log folder path: [{}]", dir.display());
    }
    Ok(LoggingGuard { _worker: worker })
}
