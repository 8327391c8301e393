use dxstream::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber: console plus an optional daily-rolling file.
///
/// `RUST_LOG` wins over the configured level. The returned guard flushes the
/// file writer and must live until exit.
pub fn init_logging(logging: &LoggingConfig, json: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,dxstream={}", logging.level)));

    let log_dir = std::env::var("DXSTREAM_LOG_DIR")
        .ok()
        .or_else(|| logging.directory.clone());

    // `rolling::daily` panics if it can't create the first file, so check writability first
    let (file_layer, guard) = match log_dir.as_deref().map(writable_dir) {
        Some(Ok(dir)) => {
            let file_appender = tracing_appender::rolling::daily(&dir, "dxstream.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            let layer = if json { layer.json().boxed() } else { layer.boxed() };
            (Some(layer), Some(guard))
        }
        Some(Err(e)) => {
            eprintln!("Warning: {}, file logging disabled", e);
            (None, None)
        }
        None => (None, None),
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let console_layer = if json {
        console_layer.json().boxed()
    } else {
        console_layer.boxed()
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, log_dir) {
        eprintln!("Logging to: {}/dxstream.log", dir);
    }
    guard
}

fn writable_dir(dir: &str) -> Result<String, String> {
    std::fs::create_dir_all(dir)
        .map_err(|e| format!("could not create log directory {} ({})", dir, e))?;
    let probe = std::path::Path::new(dir).join(".dxstream_write_test");
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
        .map_err(|e| format!("could not write to log directory {} ({})", dir, e))?;
    let _ = std::fs::remove_file(&probe);
    Ok(dir.to_string())
}
