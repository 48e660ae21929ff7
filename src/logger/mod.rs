//! Tracing subscriber setup: compact output for a terminal, structured JSON
//! when stdout isn't a tty or the caller asks for it explicitly.

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. Call once, from `main`.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}
