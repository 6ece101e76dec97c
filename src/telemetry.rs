//! Tracing Setup
//!
//! Console tracing with `RUST_LOG`-controlled filtering.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Safe to call once per process; later calls are ignored.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}
