//! Tracing setup for the wud binary.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// Filter precedence: explicit `--log` flag, then the `WUD_LOG` env var,
/// then `info`. Uses the compact single-line format; agents typically run
/// wud as a subprocess and scrape stderr.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_env("WUD_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
