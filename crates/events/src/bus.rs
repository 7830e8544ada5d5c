//! Event bus facade contract (mechanics only).
//!
//! This is the only surface application code consumes: publish integration
//! events, and register handlers for the events this service cares about.
//!
//! ## Delivery model
//!
//! - **At-least-once**: a message is acknowledged only after every handler for it
//!   ran without error; handlers must tolerate redelivery
//! - **No ordering guarantees** across messages, even of the same event name
//! - **Fan-out**: any number of handler types may subscribe to one event type;
//!   they run sequentially, in registration order, for each message
//! - **Drain unknown events**: a message nobody subscribed to is acknowledged
//!   without invoking anything
//!
//! ## Blocking
//!
//! `subscribe`/`unsubscribe` may provision broker routing rules and block the
//! calling thread until the broker answers. Call them at startup/shutdown, never
//! from inside a handler.

use std::sync::Arc;

use crate::{DynamicIntegrationEventHandler, IntegrationEvent, IntegrationEventHandler};

pub trait EventBus: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Serialize and send `event` under its event name. Not retried.
    fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), Self::Error>;

    /// Register `H` for `E`. Safe to call for several handler types of one event.
    fn subscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    /// Remove `H` for `E`. Unsubscribing something never subscribed is a no-op.
    fn unsubscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>;

    /// Register a schema-less handler for an event name.
    fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler;

    fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    type Error = B::Error;

    fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), Self::Error> {
        (**self).publish(event)
    }

    fn subscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        (**self).subscribe::<E, H>()
    }

    fn unsubscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        (**self).unsubscribe::<E, H>()
    }

    fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler,
    {
        (**self).subscribe_dynamic::<H>(event_name)
    }

    fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler,
    {
        (**self).unsubscribe_dynamic::<H>(event_name)
    }
}
