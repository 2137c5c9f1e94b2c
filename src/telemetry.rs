use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// Debug builds get human-readable output; release builds emit JSON lines
/// for log aggregation. Level comes from `RUST_LOG` (default `info`).
///
/// Call once at process start, before constructing an [`crate::Engine`].
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    }
}
