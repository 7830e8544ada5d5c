//! In-memory topic/subscription broker for tests/dev.
//!
//! - Topics fan messages out to every subscription whose rules admit them
//! - Subscriptions start with the catch-all [`DEFAULT_RULE_NAME`] rule
//! - Peek-lock delivery: a received message stays locked until completed,
//!   abandoned, or its lock expires (then it is redelivered with a higher
//!   delivery count)
//! - No persistence / no network

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    BrokerClient, BrokerConnector, BrokerError, BrokerMessage, DEFAULT_RULE_NAME, LockToken,
    MessageReceiver, MessageSender, ReceivedMessage, RuleAdministration, RuleFilter, RuleOptions,
    entity_path,
};

/// Default peek-lock duration.
const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);

/// Upper bound on one condvar wait, so expired locks are noticed by waiters.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(25);

/// Completed messages kept per subscription for inspection; older ones are only counted.
pub const COMPLETED_HISTORY: usize = 256;

#[derive(Debug, Clone)]
struct Delivery {
    message: BrokerMessage,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Locked {
    delivery: Delivery,
    locked_until: Instant,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    rules: BTreeMap<String, RuleFilter>,
    active: VecDeque<Delivery>,
    locked: HashMap<LockToken, Locked>,
    completed: VecDeque<BrokerMessage>,
    completed_total: usize,
}

impl SubscriptionState {
    fn with_default_rule() -> Self {
        let mut state = Self::default();
        state
            .rules
            .insert(DEFAULT_RULE_NAME.to_string(), RuleFilter::True);
        state
    }

    fn admits(&self, message: &BrokerMessage) -> bool {
        self.rules.values().any(|rule| rule.matches(message))
    }

    /// Move expired locks back to the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, l)| l.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                debug!(message_id = %locked.delivery.message.message_id, "lock expired, redelivering");
                self.active.push_front(locked.delivery);
            }
        }
    }
}

#[derive(Debug, Default)]
struct TopicState {
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
}

impl BrokerState {
    fn subscription(&self, topic: &str, subscription: &str) -> Result<&SubscriptionState, BrokerError> {
        self.topics
            .get(topic)
            .ok_or_else(|| BrokerError::NotFound(topic.to_string()))?
            .subscriptions
            .get(subscription)
            .ok_or_else(|| BrokerError::NotFound(entity_path(topic, subscription)))
    }

    fn subscription_mut(
        &mut self,
        topic: &str,
        subscription: &str,
    ) -> Result<&mut SubscriptionState, BrokerError> {
        self.topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::NotFound(topic.to_string()))?
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| BrokerError::NotFound(entity_path(topic, subscription)))
    }
}

#[derive(Debug)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    arrived: Condvar,
    lock_duration: Duration,
}

/// Shared in-memory broker. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_lock_duration(DEFAULT_LOCK_DURATION)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_duration(lock_duration: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                arrived: Condvar::new(),
                lock_duration,
            }),
        }
    }

    pub fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if state.topics.contains_key(topic) {
            return Err(BrokerError::AlreadyExists(topic.to_string()));
        }
        state.topics.insert(topic.to_string(), TopicState::default());
        Ok(())
    }

    /// Create a subscription carrying the catch-all default rule.
    pub fn create_subscription(&self, topic: &str, subscription: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::NotFound(topic.to_string()))?;
        if topic_state.subscriptions.contains_key(subscription) {
            return Err(BrokerError::AlreadyExists(entity_path(topic, subscription)));
        }
        topic_state
            .subscriptions
            .insert(subscription.to_string(), SubscriptionState::with_default_rule());
        Ok(())
    }

    /// Create the topic and subscription if missing.
    pub fn ensure_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry(subscription.to_string())
            .or_insert_with(SubscriptionState::with_default_rule);
    }

    pub fn send(&self, topic: &str, message: BrokerMessage) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let topic_state = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BrokerError::NotFound(topic.to_string()))?;

        let enqueued_at = Utc::now();
        for (name, sub) in topic_state.subscriptions.iter_mut() {
            if sub.admits(&message) {
                debug!(topic, subscription = %name, subject = %message.subject, "message routed");
                sub.active.push_back(Delivery {
                    message: message.clone(),
                    delivery_count: 0,
                    enqueued_at,
                });
            }
        }
        drop(state);

        self.inner.arrived.notify_all();
        Ok(())
    }

    pub fn receive(
        &self,
        topic: &str,
        subscription: &str,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            let now = Instant::now();
            let lock_duration = self.inner.lock_duration;
            let sub = state.subscription_mut(topic, subscription)?;
            sub.reclaim_expired(now);

            if let Some(mut delivery) = sub.active.pop_front() {
                delivery.delivery_count += 1;
                let token = LockToken::new();
                let received = ReceivedMessage::new(
                    delivery.message.clone(),
                    token,
                    delivery.delivery_count,
                    delivery.enqueued_at,
                );
                sub.locked.insert(
                    token,
                    Locked {
                        delivery,
                        locked_until: now + lock_duration,
                    },
                );
                return Ok(Some(received));
            }

            if now >= deadline {
                return Ok(None);
            }

            let wait = (deadline - now).min(MAX_WAIT_SLICE);
            state = self
                .inner
                .arrived
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub fn complete(
        &self,
        topic: &str,
        subscription: &str,
        message: &ReceivedMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let sub = state.subscription_mut(topic, subscription)?;
        let locked = sub
            .locked
            .remove(&message.lock_token())
            .ok_or_else(|| BrokerError::LockLost(message.message_id().to_string()))?;
        if sub.completed.len() == COMPLETED_HISTORY {
            sub.completed.pop_front();
        }
        sub.completed.push_back(locked.delivery.message);
        sub.completed_total += 1;
        Ok(())
    }

    pub fn abandon(
        &self,
        topic: &str,
        subscription: &str,
        message: &ReceivedMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let sub = state.subscription_mut(topic, subscription)?;
        let locked = sub
            .locked
            .remove(&message.lock_token())
            .ok_or_else(|| BrokerError::LockLost(message.message_id().to_string()))?;
        sub.active.push_front(locked.delivery);
        drop(state);

        self.inner.arrived.notify_all();
        Ok(())
    }

    pub fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleOptions,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let sub = state.subscription_mut(topic, subscription)?;
        if sub.rules.contains_key(&rule.name) {
            return Err(BrokerError::AlreadyExists(rule.name));
        }
        sub.rules.insert(rule.name, rule.filter);
        Ok(())
    }

    pub fn delete_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule_name: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let sub = state.subscription_mut(topic, subscription)?;
        sub.rules
            .remove(rule_name)
            .map(|_| ())
            .ok_or_else(|| BrokerError::NotFound(rule_name.to_string()))
    }

    pub fn rule_names(&self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError> {
        let state = self.lock();
        Ok(state
            .subscription(topic, subscription)?
            .rules
            .keys()
            .cloned()
            .collect())
    }

    /// Messages waiting for delivery (not locked).
    pub fn active_count(&self, topic: &str, subscription: &str) -> Result<usize, BrokerError> {
        Ok(self.lock().subscription(topic, subscription)?.active.len())
    }

    /// Messages currently locked by a receiver.
    pub fn locked_count(&self, topic: &str, subscription: &str) -> Result<usize, BrokerError> {
        Ok(self.lock().subscription(topic, subscription)?.locked.len())
    }

    /// Messages not yet completed (active + locked).
    pub fn pending_count(&self, topic: &str, subscription: &str) -> Result<usize, BrokerError> {
        let state = self.lock();
        let sub = state.subscription(topic, subscription)?;
        Ok(sub.active.len() + sub.locked.len())
    }

    /// The most recent completed messages, oldest first, at most [`COMPLETED_HISTORY`].
    pub fn completed_messages(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        Ok(self
            .lock()
            .subscription(topic, subscription)?
            .completed
            .iter()
            .cloned()
            .collect())
    }

    /// Every message completed on the subscription so far.
    pub fn completed_count(&self, topic: &str, subscription: &str) -> Result<usize, BrokerError> {
        Ok(self.lock().subscription(topic, subscription)?.completed_total)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connector handing out clients bound to one [`InMemoryBroker`].
///
/// The connection string is only checked for being non-empty.
#[derive(Debug, Clone)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
    clients_opened: Arc<AtomicUsize>,
}

impl InMemoryConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            clients_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    /// Number of data-plane clients opened so far (reconnects included).
    pub fn clients_opened(&self) -> usize {
        self.clients_opened.load(Ordering::SeqCst)
    }

    fn check(connection_string: &str) -> Result<(), BrokerError> {
        if connection_string.trim().is_empty() {
            return Err(BrokerError::Transport("empty connection string".to_string()));
        }
        Ok(())
    }
}

impl BrokerConnector for InMemoryConnector {
    fn open_client(&self, connection_string: &str) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        Self::check(connection_string)?;
        self.clients_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryClient {
            broker: self.broker.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }

    fn open_administration(
        &self,
        connection_string: &str,
    ) -> Result<Arc<dyn RuleAdministration>, BrokerError> {
        Self::check(connection_string)?;
        Ok(Arc::new(InMemoryAdministration {
            broker: self.broker.clone(),
        }))
    }
}

#[derive(Debug)]
struct InMemoryClient {
    broker: InMemoryBroker,
    closed: Arc<AtomicBool>,
}

impl BrokerClient for InMemoryClient {
    fn create_sender(&self, topic: &str) -> Result<Arc<dyn MessageSender>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        Ok(Arc::new(InMemorySender {
            broker: self.broker.clone(),
            topic: topic.to_string(),
            closed: self.closed.clone(),
        }))
    }

    fn create_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        // Fail fast on a missing subscription.
        self.broker.active_count(topic, subscription)?;
        Ok(Arc::new(InMemoryReceiver {
            broker: self.broker.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
            closed: self.closed.clone(),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct InMemorySender {
    broker: InMemoryBroker,
    topic: String,
    closed: Arc<AtomicBool>,
}

impl MessageSender for InMemorySender {
    fn send(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.broker.send(&self.topic, message)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct InMemoryReceiver {
    broker: InMemoryBroker,
    topic: String,
    subscription: String,
    closed: Arc<AtomicBool>,
}

impl InMemoryReceiver {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }
}

impl MessageReceiver for InMemoryReceiver {
    fn entity_path(&self) -> String {
        entity_path(&self.topic, &self.subscription)
    }

    fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, BrokerError> {
        self.ensure_open()?;
        self.broker.receive(&self.topic, &self.subscription, timeout)
    }

    fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.complete(&self.topic, &self.subscription, message)
    }

    fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.broker.abandon(&self.topic, &self.subscription, message)
    }
}

#[derive(Debug)]
struct InMemoryAdministration {
    broker: InMemoryBroker,
}

impl RuleAdministration for InMemoryAdministration {
    fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleOptions,
    ) -> Result<(), BrokerError> {
        self.broker.create_rule(topic, subscription, rule)
    }

    fn delete_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule_name: &str,
    ) -> Result<(), BrokerError> {
        self.broker.delete_rule(topic, subscription, rule_name)
    }

    fn rule_names(&self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError> {
        self.broker.rule_names(topic, subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "eshop_event_bus";
    const SUB: &str = "Basket";

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_topic(TOPIC).unwrap();
        broker.create_subscription(TOPIC, SUB).unwrap();
        broker
    }

    #[test]
    fn new_subscription_has_default_rule() {
        let broker = broker();
        assert_eq!(broker.rule_names(TOPIC, SUB).unwrap(), vec![DEFAULT_RULE_NAME]);
    }

    #[test]
    fn rules_filter_by_subject() {
        let broker = broker();
        broker.delete_rule(TOPIC, SUB, DEFAULT_RULE_NAME).unwrap();
        broker
            .create_rule(TOPIC, SUB, RuleOptions::correlation("OrderStarted", "OrderStarted"))
            .unwrap();

        broker.send(TOPIC, BrokerMessage::json("OrderStarted", b"{}".to_vec())).unwrap();
        broker.send(TOPIC, BrokerMessage::json("ProductPriceChanged", b"{}".to_vec())).unwrap();

        assert_eq!(broker.active_count(TOPIC, SUB).unwrap(), 1);
    }

    #[test]
    fn duplicate_rule_and_missing_rule_are_reported() {
        let broker = broker();
        let rule = RuleOptions::correlation("A", "A");
        broker.create_rule(TOPIC, SUB, rule.clone()).unwrap();

        assert!(broker.create_rule(TOPIC, SUB, rule).unwrap_err().is_already_exists());
        assert!(broker.delete_rule(TOPIC, SUB, "B").unwrap_err().is_not_found());
    }

    #[test]
    fn received_message_stays_pending_until_completed() {
        let broker = broker();
        broker.send(TOPIC, BrokerMessage::json("A", b"{}".to_vec())).unwrap();

        let msg = broker
            .receive(TOPIC, SUB, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(msg.delivery_count(), 1);
        assert_eq!(broker.locked_count(TOPIC, SUB).unwrap(), 1);
        assert_eq!(broker.pending_count(TOPIC, SUB).unwrap(), 1);

        broker.complete(TOPIC, SUB, &msg).unwrap();
        assert_eq!(broker.pending_count(TOPIC, SUB).unwrap(), 0);
        assert_eq!(broker.completed_count(TOPIC, SUB).unwrap(), 1);

        let err = broker.complete(TOPIC, SUB, &msg).unwrap_err();
        assert!(matches!(err, BrokerError::LockLost(_)));
    }

    #[test]
    fn completed_history_is_bounded_but_counted() {
        let broker = broker();
        let total = COMPLETED_HISTORY + 10;
        for i in 0..total {
            broker
                .send(TOPIC, BrokerMessage::json(format!("E{i}"), b"{}".to_vec()))
                .unwrap();
            let msg = broker
                .receive(TOPIC, SUB, Duration::from_millis(10))
                .unwrap()
                .unwrap();
            broker.complete(TOPIC, SUB, &msg).unwrap();
        }

        assert_eq!(broker.completed_count(TOPIC, SUB).unwrap(), total);
        let kept = broker.completed_messages(TOPIC, SUB).unwrap();
        assert_eq!(kept.len(), COMPLETED_HISTORY);
        assert_eq!(kept[0].subject, "E10");
        assert_eq!(kept[COMPLETED_HISTORY - 1].subject, format!("E{}", total - 1));
    }

    #[test]
    fn expired_lock_is_redelivered() {
        let broker = InMemoryBroker::with_lock_duration(Duration::from_millis(20));
        broker.ensure_subscription(TOPIC, SUB);
        broker.send(TOPIC, BrokerMessage::json("A", b"{}".to_vec())).unwrap();

        let first = broker
            .receive(TOPIC, SUB, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        let again = broker
            .receive(TOPIC, SUB, Duration::from_millis(500))
            .unwrap()
            .unwrap();

        assert_eq!(again.message_id(), first.message_id());
        assert_eq!(again.delivery_count(), 2);
        assert!(matches!(
            broker.complete(TOPIC, SUB, &first),
            Err(BrokerError::LockLost(_))
        ));
        broker.complete(TOPIC, SUB, &again).unwrap();
    }

    #[test]
    fn abandon_makes_message_available_again() {
        let broker = broker();
        broker.send(TOPIC, BrokerMessage::json("A", b"{}".to_vec())).unwrap();

        let msg = broker
            .receive(TOPIC, SUB, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        broker.abandon(TOPIC, SUB, &msg).unwrap();

        let again = broker
            .receive(TOPIC, SUB, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(again.delivery_count(), 2);
    }

    #[test]
    fn receive_times_out_when_empty() {
        let broker = broker();
        let start = Instant::now();
        let got = broker.receive(TOPIC, SUB, Duration::from_millis(30)).unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn closed_client_rejects_use() {
        let connector = InMemoryConnector::new(broker());
        let client = connector.open_client("memory://local").unwrap();
        let sender = client.create_sender(TOPIC).unwrap();
        let receiver = client.create_receiver(TOPIC, SUB).unwrap();

        client.close();

        assert!(sender.is_closed());
        assert_eq!(
            sender.send(BrokerMessage::json("A", vec![])),
            Err(BrokerError::Closed)
        );
        assert!(matches!(
            receiver.receive(Duration::from_millis(1)),
            Err(BrokerError::Closed)
        ));
        assert!(client.create_sender(TOPIC).is_err());
    }

    #[test]
    fn missing_entities_are_not_found() {
        let connector = InMemoryConnector::new(InMemoryBroker::new());
        let client = connector.open_client("memory://local").unwrap();
        assert!(matches!(
            client.create_receiver("nope", "nope"),
            Err(BrokerError::NotFound(_))
        ));
        assert!(connector.open_client("  ").is_err());
    }
}
