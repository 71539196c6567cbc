//! Tracing subscriber setup for applications built on the framework.

use tracing_subscriber::EnvFilter;

/// Install a formatted `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` when set, falling back to
/// `default_filter` (for example `"info"` or `"srvkit=debug,info"`).
/// Calling this more than once is harmless; later calls are no-ops.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
