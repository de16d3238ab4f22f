use ratewatch::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Console logging plus an optional daily-rotated file under `RATEWATCH_LOG_DIR`.
pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let default_directives = format!("{},ratewatch=debug,sqlx=warn", logging.level);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));

    let file_layer = std::env::var("RATEWATCH_LOG_DIR")
        .ok()
        .and_then(|log_dir| {
            // `rolling::daily` panics if it cannot create the first file
            if let Err(e) = std::fs::create_dir_all(&log_dir) {
                eprintln!(
                    "Warning: Could not create log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                return None;
            }
            let test_path = std::path::Path::new(&log_dir).join(".ratewatch_write_test");
            if let Err(e) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&test_path)
            {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                return None;
            }
            let _ = std::fs::remove_file(&test_path);

            let file_appender = tracing_appender::rolling::daily(&log_dir, "ratewatch.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Lives for the whole process
            Box::leak(Box::new(guard));

            eprintln!("Logging to: {}/ratewatch.log", log_dir);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true),
            )
        });

    let console_layer = if logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
