//! In-process event bus for tests/dev.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use eventbus_core::{CoreError, EventName};

use crate::bus::EventBus;
use crate::codec::{self, CodecError};
use crate::container::{HandlerContainer, HandlerType};
use crate::dispatch::{DispatchError, EventDispatcher};
use crate::registry::{RegistryError, SubscriptionRegistry};
use crate::{DynamicIntegrationEventHandler, IntegrationEvent, IntegrationEventHandler};

#[derive(Debug, Error)]
pub enum InProcessBusError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    InvalidName(#[from] CoreError),
}

/// Loopback bus: `publish` encodes the event and dispatches it on the caller's
/// thread.
///
/// - No broker / no threads / no acknowledgement
/// - Same wire encoding and dispatch path as broker-backed buses
/// - Handler errors are returned to the publisher (there is nobody else to tell)
#[derive(Debug, Clone)]
pub struct InProcessEventBus {
    dispatcher: EventDispatcher,
}

impl InProcessEventBus {
    pub fn new(container: HandlerContainer) -> Self {
        Self {
            dispatcher: EventDispatcher::new(Arc::new(SubscriptionRegistry::new()), container),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.dispatcher.registry()
    }
}

impl EventBus for InProcessEventBus {
    type Error = InProcessBusError;

    fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), Self::Error> {
        let event_name = E::event_name()?;
        let body = codec::serialize(event)?;
        // Same label → name reconstruction a broker receiver performs.
        let received = EventName::from_label(event_name.label())?;
        self.dispatcher.process_event(&received, &body)?;
        Ok(())
    }

    fn subscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = self.registry().add_subscription::<E, H>()?;
        info!(event_name = %event_name, handler = %HandlerType::of::<H>(), "subscribed (in-process)");
        Ok(())
    }

    fn unsubscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.registry().remove_subscription::<E, H>()?;
        Ok(())
    }

    fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler,
    {
        let event_name = EventName::from_type_name(event_name)?;
        self.registry().add_dynamic_subscription::<H>(&event_name);
        Ok(())
    }

    fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler,
    {
        let event_name = EventName::from_type_name(event_name)?;
        self.registry().remove_dynamic_subscription::<H>(&event_name);
        Ok(())
    }
}
