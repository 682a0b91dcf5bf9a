use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install the global subscriber. `RUST_LOG` wins; otherwise `default_filter`.
/// Safe to call more than once.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}
