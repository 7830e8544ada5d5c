use serde_json::Value as JsonValue;

use crate::IntegrationEvent;

/// Result returned by handlers.
///
/// Handlers are application code, so any error type is accepted. A failing
/// handler aborts the remaining handlers for the same message and leaves the
/// message unacknowledged.
pub type HandlerResult = anyhow::Result<()>;

/// Handles one statically known integration event type.
///
/// Handler instances are created per message through the
/// [`HandlerContainer`](crate::HandlerContainer); state that should outlive a
/// message belongs in whatever the factory captures, not in the handler.
pub trait IntegrationEventHandler<E>: Send + Sync + 'static
where
    E: IntegrationEvent,
{
    fn handle(&self, event: E) -> HandlerResult;
}

/// Handles events by name only, receiving the parsed JSON document.
pub trait DynamicIntegrationEventHandler: Send + Sync + 'static {
    fn handle(&self, event: &JsonValue) -> HandlerResult;
}
