//! Broker capability set consumed by the bus.
//!
//! The bus never talks to a concrete broker. It needs four capabilities, each
//! a trait here, and any topic/subscription broker that can provide them works:
//!
//! - [`MessageSender`]: send one message to a topic
//! - [`MessageReceiver`]: peek-lock receive from a subscription, then complete or abandon
//! - [`RuleAdministration`]: create/delete named routing rules on a subscription
//! - [`BrokerClient`] / [`BrokerConnector`]: open and close the clients above
//!
//! ## Wire contract
//!
//! A message carries a unique message id, a JSON body and a *subject* (label)
//! equal to the event name. Subscriptions admit messages through rules; a
//! correlation rule on the subject is how a process asks for one event name.
//!
//! ## Benign administration errors
//!
//! `AlreadyExists` on create and `NotFound` on delete are expected during normal
//! operation (restarts, several instances sharing a subscription) and are treated
//! as success by callers, with a warning.

pub mod in_memory;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use eventbus_core::MessageId;

pub use in_memory::{InMemoryBroker, InMemoryConnector};

/// Name of the catch-all rule every new subscription starts with.
pub const DEFAULT_RULE_NAME: &str = "$Default";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("messaging entity {0} could not be found")]
    NotFound(String),

    #[error("messaging entity {0} already exists")]
    AlreadyExists(String),

    #[error("client has been closed")]
    Closed,

    #[error("lock for message {0} was lost or has expired")]
    LockLost(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BrokerError::AlreadyExists(_))
    }
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub message_id: String,
    pub subject: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl BrokerMessage {
    /// JSON message with a fresh message id.
    pub fn json(subject: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            message_id: MessageId::new().to_string(),
            subject: subject.into(),
            content_type: Some("application/json".to_string()),
            body,
        }
    }
}

/// Opaque token identifying one locked delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A message delivered under a peek-lock.
///
/// The broker keeps it invisible to other receivers until it is completed,
/// abandoned, or the lock expires (then it is redelivered).
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    message: BrokerMessage,
    lock_token: LockToken,
    delivery_count: u32,
    enqueued_at: DateTime<Utc>,
}

impl ReceivedMessage {
    pub fn new(
        message: BrokerMessage,
        lock_token: LockToken,
        delivery_count: u32,
        enqueued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message,
            lock_token,
            delivery_count,
            enqueued_at,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn subject(&self) -> &str {
        &self.message.subject
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    pub fn lock_token(&self) -> LockToken {
        self.lock_token
    }

    /// 1 on first delivery, incremented on every redelivery.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn into_message(self) -> BrokerMessage {
        self.message
    }
}

/// Routing rule filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleFilter {
    /// Admits every message (the default rule).
    True,
    /// Admits messages whose subject equals `subject`.
    Correlation { subject: String },
}

impl RuleFilter {
    pub fn matches(&self, message: &BrokerMessage) -> bool {
        match self {
            RuleFilter::True => true,
            RuleFilter::Correlation { subject } => message.subject == *subject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOptions {
    pub name: String,
    pub filter: RuleFilter,
}

impl RuleOptions {
    /// Rule named `name` admitting messages labelled `subject`.
    pub fn correlation(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filter: RuleFilter::Correlation {
                subject: subject.into(),
            },
        }
    }
}

pub trait MessageSender: Send + Sync {
    fn send(&self, message: BrokerMessage) -> Result<(), BrokerError>;

    fn is_closed(&self) -> bool;
}

pub trait MessageReceiver: Send + Sync {
    /// `<topic>/Subscriptions/<subscription>`.
    fn entity_path(&self) -> String;

    /// Wait up to `timeout` for the next message; `Ok(None)` on timeout.
    fn receive(&self, timeout: Duration) -> Result<Option<ReceivedMessage>, BrokerError>;

    /// Settle the message: it will not be redelivered.
    fn complete(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;

    /// Release the lock so the message is redelivered.
    fn abandon(&self, message: &ReceivedMessage) -> Result<(), BrokerError>;
}

/// Administration of routing rules on a topic subscription.
pub trait RuleAdministration: Send + Sync {
    fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: RuleOptions,
    ) -> Result<(), BrokerError>;

    fn delete_rule(&self, topic: &str, subscription: &str, rule_name: &str)
    -> Result<(), BrokerError>;

    fn rule_names(&self, topic: &str, subscription: &str) -> Result<Vec<String>, BrokerError>;
}

/// Data-plane client: creates senders and receivers, closes them all at once.
pub trait BrokerClient: Send + Sync {
    fn create_sender(&self, topic: &str) -> Result<Arc<dyn MessageSender>, BrokerError>;

    fn create_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageReceiver>, BrokerError>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// Opens clients from a connection string.
pub trait BrokerConnector: Send + Sync {
    fn open_client(&self, connection_string: &str) -> Result<Arc<dyn BrokerClient>, BrokerError>;

    fn open_administration(
        &self,
        connection_string: &str,
    ) -> Result<Arc<dyn RuleAdministration>, BrokerError>;
}

pub(crate) fn entity_path(topic: &str, subscription: &str) -> String {
    format!("{topic}/Subscriptions/{subscription}")
}
