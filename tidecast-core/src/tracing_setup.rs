//! Tracing setup for Tidecast
//!
//! Console output at a caller-chosen level, plus an optional file capturing
//! everything at trace level for post-mortem analysis of a streaming run.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Name of the trace file written inside the logs directory.
pub const LOG_FILE_NAME: &str = "tidecast-last-run.log";

/// Errors from installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("Cannot prepare log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("A global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Initialize tracing with console output and an optional trace file.
///
/// The console honours `RUST_LOG` when set and falls back to
/// `console_level`. With `logs_dir`, the file `tidecast-last-run.log` there
/// is overwritten with every event at trace level.
///
/// Returns the path of the trace file when one was opened.
///
/// # Errors
/// - `TracingError::LogFile` - Directory or file cannot be created
/// - `TracingError::AlreadyInitialized` - Another subscriber is installed
pub fn init_tracing(
    console_level: Level,
    logs_dir: Option<&Path>,
) -> Result<Option<PathBuf>, TracingError> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let (file_layer, log_file_path) = match logs_dir {
        Some(dir) => {
            let (file, path) = open_log_file(dir)?;
            let layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(file)
                .with_filter(EnvFilter::new("trace"));
            (Some(layer), Some(path))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| TracingError::AlreadyInitialized)?;

    tracing::info!(
        console = %console_level,
        trace_file = ?log_file_path,
        "Tracing initialized"
    );
    Ok(log_file_path)
}

fn open_log_file(dir: &Path) -> Result<(File, PathBuf), TracingError> {
    let path = dir.join(LOG_FILE_NAME);
    create_dir_all(dir).map_err(|source| TracingError::LogFile {
        path: dir.to_path_buf(),
        source,
    })?;
    let file = File::create(&path).map_err(|source| TracingError::LogFile {
        path: path.clone(),
        source,
    })?;
    Ok((file, path))
}
