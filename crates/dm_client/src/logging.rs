//! Structured logging setup for the binary and for tests that want output.

use tracing_subscriber::EnvFilter;

/// Used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "dm_client=info,dm_store=info,dm_e2ee=info";

/// Install the global subscriber. Logs go to stderr so envelopes printed on
/// stdout stay machine-readable. Calling this twice is harmless.
pub fn init_tracing(default_directives: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
