/// Structured logging setup using tracing
///
/// Writes to stderr, auto-detecting format: human-readable with ANSI colors
/// when stderr is a terminal, structured JSON when piped/redirected. When
/// `log_file` is configured, a plain-format append layer mirrors every event
/// to that file as well.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::Config;

/// Initialize the tracing subscriber.
///
/// Log level comes from config.log_level (default: info); the RUST_LOG env
/// var overrides it at runtime. A bad log_file path logs to stderr only.
pub fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let stderr_layer = if std::io::stderr().is_terminal() {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .boxed()
    };

    let file_layer = config.log_file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false),
            ),
            Err(e) => {
                eprintln!("failed to open log file {}: {}", path, e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
