//! Process-wide tracing setup shared by every bus host.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{DEFAULT_FILTER, init_with_filter};

/// Initialize tracing from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}
