//! Per-message dispatch.
//!
//! [`EventDispatcher::process_event`] is the transport-agnostic core of message
//! handling:
//!
//! 1. no subscriptions for the name → nothing to do, the message counts as processed
//! 2. otherwise open one [`HandlerScope`](crate::HandlerScope) for the message and
//!    walk the subscriptions in registration order
//!    - dynamic: resolve, parse the body as a JSON document, invoke
//!    - typed: resolve, look up the registered payload type, deserialize, invoke
//!    - an unresolvable handler is skipped
//! 3. the first error aborts the remaining handlers and is returned as-is
//!
//! Whether the caller acknowledges the message is its decision. Broker buses
//! complete on `Ok` (including [`DispatchOutcome::Unsubscribed`]) and leave the
//! message pending on `Err`.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use eventbus_core::EventName;

use crate::codec::CodecError;
use crate::container::HandlerContainer;
use crate::registry::SubscriptionRegistry;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no event type registered for {0}")]
    UnknownEventType(EventName),

    #[error("failed to decode {event_name} message: {source}")]
    Deserialize {
        event_name: EventName,
        #[source]
        source: CodecError,
    },

    #[error("handler {handler} failed for {event_name}: {source}")]
    Handler {
        event_name: EventName,
        handler: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nobody subscribed to the event name; the message is drained.
    Unsubscribed,
    /// Every subscription was visited without error.
    Dispatched { invoked: usize, skipped: usize },
}

/// Resolves and invokes the handlers registered for an event.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    registry: Arc<SubscriptionRegistry>,
    container: HandlerContainer,
}

impl EventDispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, container: HandlerContainer) -> Self {
        Self {
            registry,
            container,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn container(&self) -> &HandlerContainer {
        &self.container
    }

    pub fn process_event(
        &self,
        event_name: &EventName,
        body: &[u8],
    ) -> Result<DispatchOutcome, DispatchError> {
        if !self.registry.has_subscriptions_for(event_name) {
            trace!(event_name = %event_name, "no subscriptions, draining message");
            return Ok(DispatchOutcome::Unsubscribed);
        }

        let mut scope = self.container.begin_scope();
        let mut invoked = 0;
        let mut skipped = 0;

        for subscription in self.registry.handlers_for(event_name) {
            let Some(handler) = subscription.resolve(&mut scope) else {
                debug!(
                    event_name = %event_name,
                    handler = subscription.handler_type().name(),
                    "handler not resolvable, skipping"
                );
                skipped += 1;
                continue;
            };

            if !subscription.is_dynamic() {
                let event_type = self
                    .registry
                    .event_type_by_name(event_name)
                    .map_err(|_| DispatchError::UnknownEventType(event_name.clone()))?;
                trace!(event_name = %event_name, event_type = event_type.name(), "typed dispatch");
            }

            handler.invoke(event_name, body)?;
            invoked += 1;
        }

        Ok(DispatchOutcome::Dispatched { invoked, skipped })
    }
}
