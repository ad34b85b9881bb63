//! Tracing setup shared by the library consumers and the CLI.

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. "info" or "blelink_core=debug").
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .try_init();
}
