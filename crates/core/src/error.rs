//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Keep this focused on malformed values (identifiers, routing keys). Broker and
/// dispatch failures belong to the layers that produce them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An event name was empty or reduced to nothing after suffix stripping.
    #[error("invalid event name: {0:?}")]
    InvalidEventName(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_event_name(name: impl Into<String>) -> Self {
        Self::InvalidEventName(name.into())
    }
}
