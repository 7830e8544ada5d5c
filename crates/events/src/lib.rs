//! Integration events and the transport-agnostic half of the event bus.
//!
//! Everything here is broker-free: event contract, handler traits, handler
//! resolution, JSON codec, subscription bookkeeping and per-message dispatch.
//! Broker-backed buses live in `eventbus-infra` and compose these pieces.

pub mod bus;
pub mod codec;
pub mod container;
pub mod dispatch;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod registry;

pub use bus::EventBus;
pub use codec::CodecError;
pub use container::{HandlerContainer, HandlerScope, HandlerType};
pub use dispatch::{DispatchError, DispatchOutcome, EventDispatcher};
pub use event::{EventMetadata, EventType, IntegrationEvent};
pub use handler::{DynamicIntegrationEventHandler, HandlerResult, IntegrationEventHandler};
pub use in_memory_bus::{InProcessBusError, InProcessEventBus};
pub use registry::{RegistryError, Subscription, SubscriptionRegistry};

pub use eventbus_core::{EventId, EventName, INTEGRATION_EVENT_SUFFIX};
