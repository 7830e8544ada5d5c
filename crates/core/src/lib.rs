//! Foundation building blocks shared by every layer of the bus.
//!
//! This crate contains **pure** primitives (no broker, no threads, no IO).

pub mod error;
pub mod id;
pub mod name;

pub use error::{CoreError, CoreResult};
pub use id::{EventId, MessageId};
pub use name::{EventName, INTEGRATION_EVENT_SUFFIX};
