//! End-to-end scenarios against the in-memory broker.
//!
//! Publish → topic → subscription rules → processor → dispatcher → handlers → complete

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventbus_core::EventName;
use eventbus_events::{
    DynamicIntegrationEventHandler, EventBus, EventMetadata, HandlerContainer, HandlerResult,
    IntegrationEvent, IntegrationEventHandler, RegistryError,
};

use crate::broker::{BrokerMessage, DEFAULT_RULE_NAME, InMemoryBroker, InMemoryConnector, RuleOptions};
use crate::config::EventBusConfig;
use crate::connection::BrokerConnection;
use crate::error::EventBusError;
use crate::service_bus::ServiceBusEventBus;

const TOPIC: &str = "eshop_event_bus";
const SUB: &str = "Basket";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderStartedIntegrationEvent {
    #[serde(flatten)]
    meta: EventMetadata,
    user_id: String,
}

impl IntegrationEvent for OrderStartedIntegrationEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

fn order_started(user: &str) -> OrderStartedIntegrationEvent {
    OrderStartedIntegrationEvent {
        meta: EventMetadata::new(),
        user_id: user.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProductPriceChangedIntegrationEvent {
    #[serde(flatten)]
    meta: EventMetadata,
    product_id: u32,
    new_price: f64,
}

impl IntegrationEvent for ProductPriceChangedIntegrationEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

fn price_changed(product_id: u32) -> ProductPriceChangedIntegrationEvent {
    ProductPriceChangedIntegrationEvent {
        meta: EventMetadata::new(),
        product_id,
        new_price: 9.5,
    }
}

mod catalog {
    use super::*;

    /// Same short name as the ordering event, different type.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OrderStartedIntegrationEvent {
        #[serde(flatten)]
        pub meta: EventMetadata,
    }

    impl IntegrationEvent for OrderStartedIntegrationEvent {
        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }
    }
}

type Journal = Arc<Mutex<Vec<String>>>;

struct FirstHandler(Journal);

impl IntegrationEventHandler<OrderStartedIntegrationEvent> for FirstHandler {
    fn handle(&self, event: OrderStartedIntegrationEvent) -> HandlerResult {
        self.0.lock().unwrap().push(format!("first:{}", event.user_id));
        Ok(())
    }
}

impl IntegrationEventHandler<catalog::OrderStartedIntegrationEvent> for FirstHandler {
    fn handle(&self, _event: catalog::OrderStartedIntegrationEvent) -> HandlerResult {
        Ok(())
    }
}

struct SecondHandler(Journal);

impl IntegrationEventHandler<OrderStartedIntegrationEvent> for SecondHandler {
    fn handle(&self, event: OrderStartedIntegrationEvent) -> HandlerResult {
        self.0.lock().unwrap().push(format!("second:{}", event.user_id));
        Ok(())
    }
}

struct IdRecorder(Journal);

impl IntegrationEventHandler<OrderStartedIntegrationEvent> for IdRecorder {
    fn handle(&self, event: OrderStartedIntegrationEvent) -> HandlerResult {
        self.0.lock().unwrap().push(event.id().to_string());
        Ok(())
    }
}

struct FailingPriceHandler;

impl IntegrationEventHandler<ProductPriceChangedIntegrationEvent> for FailingPriceHandler {
    fn handle(&self, _event: ProductPriceChangedIntegrationEvent) -> HandlerResult {
        anyhow::bail!("catalog price store unavailable")
    }
}

/// Fails the first attempt, succeeds afterwards.
struct FlakyPriceHandler {
    attempts: AtomicUsize,
    journal: Journal,
}

impl IntegrationEventHandler<ProductPriceChangedIntegrationEvent> for FlakyPriceHandler {
    fn handle(&self, event: ProductPriceChangedIntegrationEvent) -> HandlerResult {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == 1 {
            anyhow::bail!("transient failure");
        }
        self.journal
            .lock()
            .unwrap()
            .push(format!("price:{}:attempt{}", event.product_id, attempt));
        Ok(())
    }
}

struct SlowPriceHandler {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl IntegrationEventHandler<ProductPriceChangedIntegrationEvent> for SlowPriceHandler {
    fn handle(&self, _event: ProductPriceChangedIntegrationEvent) -> HandlerResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RawAudit(Journal);

impl DynamicIntegrationEventHandler for RawAudit {
    fn handle(&self, event: &JsonValue) -> HandlerResult {
        self.0.lock().unwrap().push(format!("raw:{}", event["value"]));
        Ok(())
    }
}

struct Harness {
    broker: InMemoryBroker,
    connector: InMemoryConnector,
    connection: Arc<BrokerConnection>,
    container: HandlerContainer,
    journal: Journal,
}

impl Harness {
    fn new() -> Self {
        Self::with_lock_duration(Duration::from_secs(30))
    }

    fn with_lock_duration(lock: Duration) -> Self {
        let broker = InMemoryBroker::with_lock_duration(lock);
        broker.create_topic(TOPIC).unwrap();
        broker.create_subscription(TOPIC, SUB).unwrap();

        let connector = InMemoryConnector::new(broker.clone());
        let connection =
            Arc::new(BrokerConnection::open("memory://tests", Arc::new(connector.clone())).unwrap());

        let journal: Journal = Arc::default();
        let container = HandlerContainer::new();
        container.register_instance(Arc::new(FirstHandler(journal.clone())));
        container.register_instance(Arc::new(SecondHandler(journal.clone())));
        container.register_instance(Arc::new(IdRecorder(journal.clone())));
        container.register_instance(Arc::new(RawAudit(journal.clone())));
        container.register_instance(Arc::new(FailingPriceHandler));

        Self {
            broker,
            connector,
            connection,
            container,
            journal,
        }
    }

    fn config(&self) -> EventBusConfig {
        EventBusConfig::new("memory://tests", SUB)
            .with_max_concurrent_calls(4)
            .with_receive_timeout(Duration::from_millis(10))
    }

    fn bus(&self) -> ServiceBusEventBus {
        self.bus_with(self.config())
    }

    fn bus_with(&self, config: EventBusConfig) -> ServiceBusEventBus {
        ServiceBusEventBus::new(self.connection.clone(), self.container.clone(), &config).unwrap()
    }

    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn rules(&self) -> Vec<String> {
        self.broker.rule_names(TOPIC, SUB).unwrap()
    }

    fn completed(&self) -> usize {
        self.broker.completed_count(TOPIC, SUB).unwrap()
    }

    fn pending(&self) -> usize {
        self.broker.pending_count(TOPIC, SUB).unwrap()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn settle() {
    thread::sleep(Duration::from_millis(100));
}

#[test]
fn construction_removes_default_rule() {
    let h = Harness::new();
    assert_eq!(h.rules(), vec![DEFAULT_RULE_NAME]);

    let _bus = h.bus();
    assert!(h.rules().is_empty());
}

#[test]
fn second_instance_tolerates_missing_default_rule() {
    let h = Harness::new();
    let _first = h.bus();
    let _second = h.bus();
    assert!(h.rules().is_empty());
}

#[test]
fn typed_event_is_delivered_and_completed() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    assert_eq!(h.rules(), vec!["OrderStarted"]);

    bus.publish(&order_started("alice")).unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec!["first:alice"]);
    assert_eq!(h.pending(), 0);

    let sent = h.broker.completed_messages(TOPIC, SUB).unwrap();
    assert_eq!(sent[0].subject, "OrderStarted");
}

#[test]
fn handlers_run_in_registration_order_and_share_one_rule() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();
    bus.subscribe::<OrderStartedIntegrationEvent, SecondHandler>()
        .unwrap();

    assert_eq!(h.rules(), vec!["OrderStarted"]);

    bus.publish(&order_started("bob")).unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec!["first:bob", "second:bob"]);
}

#[test]
fn event_identity_survives_the_wire() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, IdRecorder>()
        .unwrap();

    let event = order_started("carol");
    bus.publish(&event).unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec![event.id().to_string()]);

    let body: JsonValue =
        serde_json::from_slice(&h.broker.completed_messages(TOPIC, SUB).unwrap()[0].body).unwrap();
    assert!(body.get("Id").is_some());
    assert!(body.get("CreateDateTime").is_some());
}

#[test]
fn unsubscribe_removes_rule_and_stops_delivery() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();
    bus.unsubscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    let name = EventName::from_type_name("OrderStartedIntegrationEvent").unwrap();
    assert!(!bus.registry().has_subscriptions_for(&name));
    assert!(h.rules().is_empty());

    bus.publish(&order_started("dave")).unwrap();
    settle();
    assert_eq!(h.pending(), 0);
    assert_eq!(h.completed(), 0);
    assert!(h.journal().is_empty());
}

#[test]
fn unsubscribe_of_unknown_pair_is_noop() {
    let h = Harness::new();
    let bus = h.bus();
    bus.unsubscribe::<OrderStartedIntegrationEvent, SecondHandler>()
        .unwrap();
    assert!(bus.registry().is_empty());
}

#[test]
fn unsubscribe_drops_rule_even_when_handlers_remain() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();
    bus.subscribe::<OrderStartedIntegrationEvent, SecondHandler>()
        .unwrap();
    bus.unsubscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    let name = EventName::from_type_name("OrderStartedIntegrationEvent").unwrap();
    assert!(bus.registry().has_subscriptions_for(&name));
    assert!(h.rules().is_empty());

    // Still registered locally, but the broker no longer routes the event here.
    bus.publish(&order_started("erin")).unwrap();
    settle();
    assert!(h.journal().is_empty());
    assert_eq!(h.completed(), 0);
}

#[test]
fn unsubscribed_label_is_drained() {
    let h = Harness::new();
    let _bus = h.bus();
    h.broker
        .create_rule(TOPIC, SUB, RuleOptions::correlation("Unknown", "Unknown"))
        .unwrap();

    h.broker
        .send(TOPIC, BrokerMessage::json("Unknown", br#"{"anything":true}"#.to_vec()))
        .unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert!(h.journal().is_empty());
    assert_eq!(h.pending(), 0);
}

#[test]
fn empty_label_is_drained() {
    let h = Harness::new();
    let _bus = h.bus();
    h.broker
        .create_rule(TOPIC, SUB, RuleOptions::correlation("empty", ""))
        .unwrap();

    h.broker.send(TOPIC, BrokerMessage::json("", b"{}".to_vec())).unwrap();

    assert!(wait_until(|| h.completed() == 1));
}

#[test]
fn failing_handler_leaves_message_pending_without_blocking_others() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<ProductPriceChangedIntegrationEvent, FailingPriceHandler>()
        .unwrap();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    bus.publish(&price_changed(1)).unwrap();
    bus.publish(&order_started("frank")).unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert!(wait_until(|| bus.processor_stats().messages_failed == 1));

    assert_eq!(h.journal(), vec!["first:frank"]);
    assert_eq!(h.pending(), 1);
    assert_eq!(h.broker.locked_count(TOPIC, SUB).unwrap(), 1);
}

#[test]
fn failed_message_is_redelivered_after_lock_expiry() {
    let h = Harness::with_lock_duration(Duration::from_millis(50));
    h.container.register_instance(Arc::new(FlakyPriceHandler {
        attempts: AtomicUsize::new(0),
        journal: h.journal.clone(),
    }));

    let bus = h.bus();
    bus.subscribe::<ProductPriceChangedIntegrationEvent, FlakyPriceHandler>()
        .unwrap();
    bus.publish(&price_changed(7)).unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec!["price:7:attempt2"]);

    let stats = bus.processor_stats();
    assert_eq!(stats.messages_received, 2);
    assert_eq!(stats.messages_failed, 1);
    assert_eq!(stats.messages_completed, 1);
}

#[test]
fn dynamic_subscription_receives_raw_document() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe_dynamic::<RawAudit>("Foo").unwrap();

    // Dynamic subscriptions leave rule provisioning to the host.
    assert!(h.rules().is_empty());
    h.broker
        .create_rule(TOPIC, SUB, RuleOptions::correlation("Foo", "Foo"))
        .unwrap();

    h.broker
        .send(TOPIC, BrokerMessage::json("Foo", br#"{"value":42}"#.to_vec()))
        .unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec!["raw:42"]);

    bus.unsubscribe_dynamic::<RawAudit>("FooIntegrationEvent").unwrap();
    assert!(bus.registry().is_empty());
}

#[test]
fn typed_subscribe_after_dynamic_provisions_rule() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe_dynamic::<RawAudit>("OrderStarted").unwrap();
    assert!(h.rules().is_empty());

    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();
    assert_eq!(h.rules(), vec!["OrderStarted"]);

    bus.publish(&order_started("bob")).unwrap();
    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec!["raw:null", "first:bob"]);
}

#[test]
fn in_flight_messages_are_bounded_by_concurrency_cap() {
    let h = Harness::new();
    let slow = Arc::new(SlowPriceHandler {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    h.container.register_instance(slow.clone());

    let bus = h.bus_with(h.config().with_max_concurrent_calls(2));
    bus.subscribe::<ProductPriceChangedIntegrationEvent, SlowPriceHandler>()
        .unwrap();

    for id in 0..8 {
        bus.publish(&price_changed(id)).unwrap();
    }

    assert!(wait_until(|| h.completed() == 8));
    assert!(slow.peak.load(Ordering::SeqCst) <= 2);
    assert!(bus.processor_stats().peak_in_flight <= 2);
}

#[test]
fn colliding_event_names_are_rejected() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    let err = bus
        .subscribe::<catalog::OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap_err();
    assert!(matches!(
        err,
        EventBusError::Registry(RegistryError::EventNameCollision { .. })
    ));
}

#[test]
fn closed_client_is_reopened_for_publish_and_receive() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    h.connection.topic_client().unwrap().close();
    bus.publish(&order_started("gina")).unwrap();

    assert!(wait_until(|| h.completed() == 1));
    assert_eq!(h.journal(), vec!["first:gina"]);
    assert_eq!(h.connector.clients_opened(), 2);
    assert_eq!(h.pending(), 0);
}

#[test]
fn dispose_is_idempotent_and_clears_subscriptions() {
    let h = Harness::new();
    let bus = h.bus();
    bus.subscribe::<OrderStartedIntegrationEvent, FirstHandler>()
        .unwrap();

    bus.dispose();
    bus.dispose();

    assert!(bus.is_disposed());
    assert!(bus.registry().is_empty());
    assert!(matches!(
        bus.publish(&order_started("hank")),
        Err(EventBusError::Disposed)
    ));
    assert!(!h.connection.is_disposed());
}
