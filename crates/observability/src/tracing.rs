//! Tracing/logging initialization.
//!
//! JSON lines on stdout with timestamps. The bus logs with structured fields
//! (`event_name`, `handler`, `message_id`, `entity_path`), so filter on those.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

/// Initialize with an explicit filter directive, ignoring `RUST_LOG`.
///
/// An invalid directive falls back to [`DEFAULT_FILTER`].
pub fn init_with_filter(directives: &str) {
    let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    install(filter);
}

fn install(filter: EnvFilter) {
    // Err only means a global subscriber is already set.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_with_filter("eventbus_infra=debug,info");
        init_with_filter("not a [valid filter");
        init();
        ::tracing::info!(event_name = "OrderStarted", "logged after init");
    }
}
