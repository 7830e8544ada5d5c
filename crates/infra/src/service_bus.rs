//! Topic/subscription event bus.
//!
//! Every process publishes to one shared topic and owns one subscription on it.
//! Routing is done by the broker: for each event name this process subscribes
//! to, a correlation rule named after the event admits messages whose subject
//! equals that name. The catch-all default rule is removed at construction so
//! only subscribed event names reach the subscription.
//!
//! Dynamic subscriptions never touch rules; the host provisions those itself.
//! A typed subscription therefore provisions its rule on the first *typed*
//! subscription for the name, even when dynamic handlers already share it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, instrument, warn};

use eventbus_core::EventName;
use eventbus_events::{
    DynamicIntegrationEventHandler, EventBus, EventDispatcher, HandlerContainer, HandlerType,
    IntegrationEvent, IntegrationEventHandler, SubscriptionRegistry, codec,
};

use crate::broker::{BrokerError, BrokerMessage, DEFAULT_RULE_NAME, MessageSender, RuleOptions};
use crate::config::EventBusConfig;
use crate::connection::BrokerConnection;
use crate::error::{EventBusError, PublishError};
use crate::processor::{
    MessageProcessor, ProcessError, ProcessErrorArgs, ProcessMessageArgs, ProcessorStats,
    error_callback, message_callback, receiver_factory,
};

pub struct ServiceBusEventBus {
    connection: Arc<BrokerConnection>,
    topic_name: String,
    subscription_name: String,
    dispatcher: EventDispatcher,
    sender: Mutex<Arc<dyn MessageSender>>,
    processor: MessageProcessor,
    disposed: AtomicBool,
}

impl ServiceBusEventBus {
    /// Connect to the configured subscription and start receiving.
    pub fn new(
        connection: Arc<BrokerConnection>,
        container: HandlerContainer,
        config: &EventBusConfig,
    ) -> Result<Self, EventBusError> {
        Self::with_registry(
            connection,
            Arc::new(SubscriptionRegistry::new()),
            container,
            config,
        )
    }

    /// Like [`ServiceBusEventBus::new`] with a caller-supplied registry.
    pub fn with_registry(
        connection: Arc<BrokerConnection>,
        registry: Arc<SubscriptionRegistry>,
        container: HandlerContainer,
        config: &EventBusConfig,
    ) -> Result<Self, EventBusError> {
        config.validate()?;

        let client = connection.topic_client()?;
        let sender = client.create_sender(&config.topic_name)?;

        remove_default_rule(&connection, &config.topic_name, &config.subscription_name)?;

        let receiver = client.create_receiver(&config.topic_name, &config.subscription_name)?;
        let dispatcher = EventDispatcher::new(registry, container);

        let on_message = {
            let dispatcher = dispatcher.clone();
            message_callback(move |args| process_message(&dispatcher, args))
        };
        // Receivers die with their client; reopen through the connection.
        let reopen = {
            let connection = connection.clone();
            let topic = config.topic_name.clone();
            let subscription = config.subscription_name.clone();
            receiver_factory(move || {
                connection
                    .topic_client()?
                    .create_receiver(&topic, &subscription)
            })
        };
        let processor = MessageProcessor::start_reopening(
            receiver,
            reopen,
            config.processor_options(),
            on_message,
            error_callback(log_process_error),
        )?;

        Ok(Self {
            connection,
            topic_name: config.topic_name.clone(),
            subscription_name: config.subscription_name.clone(),
            dispatcher,
            sender: Mutex::new(sender),
            processor,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.dispatcher.registry()
    }

    pub fn topic_name(&self) -> &str {
        &self.topic_name
    }

    pub fn subscription_name(&self) -> &str {
        &self.subscription_name
    }

    pub fn processor_stats(&self) -> ProcessorStats {
        self.processor.stats()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Clear all subscriptions and stop the processor. Safe to call more than once.
    ///
    /// The shared connection stays open; it is owned by whoever created it.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry().clear();
        self.processor.close();
        info!(subscription = %self.subscription_name, "event bus disposed");
    }

    fn ensure_open(&self) -> Result<(), EventBusError> {
        if self.is_disposed() {
            return Err(EventBusError::Disposed);
        }
        Ok(())
    }

    /// Current sender, recreated when its client was closed underneath it.
    fn sender(&self) -> Result<Arc<dyn MessageSender>, PublishError> {
        let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.is_closed() {
            debug!(topic = %self.topic_name, "sender closed, recreating");
            let client = self
                .connection
                .topic_client()
                .map_err(PublishError::Connection)?;
            *sender = client
                .create_sender(&self.topic_name)
                .map_err(PublishError::Connection)?;
        }
        Ok(sender.clone())
    }

    #[instrument(skip(self, body), fields(topic = %self.topic_name, message_id = tracing::field::Empty), err)]
    fn send(&self, label: &str, body: Vec<u8>) -> Result<(), PublishError> {
        let message = BrokerMessage::json(label, body);
        tracing::Span::current().record("message_id", message.message_id.as_str());
        self.sender()?.send(message).map_err(PublishError::Send)
    }

    fn create_rule(&self, event_name: &EventName) {
        let rule = RuleOptions::correlation(event_name.label(), event_name.label());
        match self.connection.administration().create_rule(
            &self.topic_name,
            &self.subscription_name,
            rule,
        ) {
            Ok(()) => debug!(event_name = %event_name, "subscription rule created"),
            Err(e) if e.is_already_exists() => {
                warn!(event_name = %event_name, "The messaging entity {} already exists.", event_name)
            }
            Err(e) => error!(event_name = %event_name, error = %e, "failed to create subscription rule"),
        }
    }

    fn delete_rule(&self, event_name: &EventName) {
        match self.connection.administration().delete_rule(
            &self.topic_name,
            &self.subscription_name,
            event_name.label(),
        ) {
            Ok(()) => debug!(event_name = %event_name, "subscription rule deleted"),
            Err(e) if e.is_not_found() => {
                warn!(event_name = %event_name, "The messaging entity {} could not be found.", event_name)
            }
            Err(e) => error!(event_name = %event_name, error = %e, "failed to delete subscription rule"),
        }
    }
}

impl EventBus for ServiceBusEventBus {
    type Error = EventBusError;

    fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), Self::Error> {
        self.ensure_open()?;
        let event_name = E::event_name()?;
        let body = codec::serialize(event).map_err(PublishError::from)?;
        self.send(event_name.label(), body)?;
        Ok(())
    }

    fn subscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_open()?;
        let event_name = E::event_name()?;
        // Dynamic subscriptions share the key but never provision a rule.
        let first = self.registry().event_type_by_name(&event_name).is_err();

        self.registry().add_subscription::<E, H>()?;
        if first {
            self.create_rule(&event_name);
        }

        info!(event_name = %event_name, handler = %HandlerType::of::<H>(), "subscribing to event");
        Ok(())
    }

    fn unsubscribe<E, H>(&self) -> Result<(), Self::Error>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_open()?;
        let event_name = E::event_name()?;

        // Removed even when other handlers for the event remain.
        self.delete_rule(&event_name);
        self.registry().remove_subscription::<E, H>()?;

        info!(event_name = %event_name, handler = %HandlerType::of::<H>(), "unsubscribing from event");
        Ok(())
    }

    fn subscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.ensure_open()?;
        let event_name = EventName::from_type_name(event_name)?;
        self.registry().add_dynamic_subscription::<H>(&event_name);

        info!(event_name = %event_name, handler = %HandlerType::of::<H>(), "subscribing to dynamic event");
        Ok(())
    }

    fn unsubscribe_dynamic<H>(&self, event_name: &str) -> Result<(), Self::Error>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.ensure_open()?;
        let event_name = EventName::from_type_name(event_name)?;
        self.registry().remove_dynamic_subscription::<H>(&event_name);

        info!(event_name = %event_name, handler = %HandlerType::of::<H>(), "unsubscribing from dynamic event");
        Ok(())
    }
}

impl Drop for ServiceBusEventBus {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ServiceBusEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusEventBus")
            .field("topic_name", &self.topic_name)
            .field("subscription_name", &self.subscription_name)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn remove_default_rule(
    connection: &BrokerConnection,
    topic: &str,
    subscription: &str,
) -> Result<(), BrokerError> {
    match connection
        .administration()
        .delete_rule(topic, subscription, DEFAULT_RULE_NAME)
    {
        Ok(()) => {
            debug!(topic, subscription, "default rule removed");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            warn!("The messaging entity {} could not be found.", DEFAULT_RULE_NAME);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Dispatch one message, then complete it.
///
/// A dispatch error returns early so the message stays locked and is
/// redelivered once the lock expires.
fn process_message(
    dispatcher: &EventDispatcher,
    args: &ProcessMessageArgs<'_>,
) -> Result<(), ProcessError> {
    let message = args.message();

    let event_name = match EventName::from_label(message.subject()) {
        Ok(name) => name,
        Err(e) => {
            warn!(
                message_id = %message.message_id(),
                label = %message.subject(),
                error = %e,
                "message label is not an event name, draining"
            );
            args.complete()?;
            return Ok(());
        }
    };

    let outcome = dispatcher.process_event(&event_name, message.body())?;
    debug!(
        message_id = %message.message_id(),
        event_name = %event_name,
        delivery_count = message.delivery_count(),
        outcome = ?outcome,
        "message processed"
    );

    args.complete()?;
    Ok(())
}

fn log_process_error(args: &ProcessErrorArgs) {
    error!(
        error = %args.error,
        error_source = %args.source,
        entity_path = %args.entity_path,
        message_id = ?args.message_id,
        "ERROR handling message: {} - Context: source={}, entity_path={}",
        args.error,
        args.source,
        args.entity_path
    );
}
