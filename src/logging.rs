use std::io;
use std::path::PathBuf;

use tracing_appender::non_blocking::{self, WorkerGuard};
use tracing_appender::rolling;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("subscriber init failed: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
    #[error("invalid log file path: {0:?}")]
    InvalidPath(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    /// Number of `-v` flags.
    pub verbose: u8,
    pub log_file: Option<PathBuf>,
}

impl LogOptions {
    fn console_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            _ => LevelFilter::DEBUG,
        }
    }
}

/// Installs the global subscriber. Keep the returned guard alive until
/// exit, dropping it flushes the file writer.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>, LogError> {
    let console_layer = fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .with_filter(options.console_level());

    let (file_layer, guard) = match &options.log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| LogError::InvalidPath(path.clone()))?;
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&dir)?;

            let appender = rolling::never(&dir, file_name);
            let (writer, guard) = non_blocking::NonBlockingBuilder::default()
                .lossy(false)
                .finish(appender);
            let layer = fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| {
            if e.to_string().contains("already") {
                LogError::AlreadyInitialized
            } else {
                LogError::SubscriberInit(e)
            }
        })?;
    Ok(guard)
}
