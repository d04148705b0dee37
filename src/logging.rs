//! Tracing setup: terminal output plus a rotating JSON log file.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber with a compact stdout layer and a
/// daily-rotated JSON file under `log_dir`. `RUST_LOG` controls filtering,
/// defaulting to "info".
pub fn init<P: AsRef<Path>>(log_dir: Option<P>) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(stdout_layer);

    match log_dir {
        Some(dir) => {
            let dir = dir.as_ref();
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "crawl.json.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            // The guard must outlive the process for the writer to flush
            Box::leak(Box::new(guard));

            let file_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let json_layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_current_span(true)
                .with_filter(file_filter);

            registry.with(json_layer).init();
            tracing::info!("logging to {}", dir.display());
        }
        None => registry.init(),
    }

    Ok(())
}
