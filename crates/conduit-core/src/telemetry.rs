use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for structured logging on stderr.
///
/// - Debug builds: human-readable output with targets
/// - Release builds: JSON lines for log aggregation
///
/// `RUST_LOG` wins when set; otherwise `default_directive` applies (the CLI
/// passes `warn` so command output on stdout stays clean).
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if cfg!(debug_assertions) {
        builder.with_target(true).init();
    } else {
        builder.json().init();
    }
}
