//! Logging initialization

/// Initialize logging for the daemon.
///
/// Logs go to stderr. The default filter is `info` (or `debug` with the
/// flag); RUST_LOG overrides both.
pub fn init_logging(debug: bool) {
    let default_filter = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(true)
        .init();
}
