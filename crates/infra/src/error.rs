use thiserror::Error;

use eventbus_core::CoreError;
use eventbus_events::{CodecError, RegistryError};

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::processor::ProcessorError;

/// Publishing failed; the event was not sent and is not retried.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] CodecError),

    #[error("failed to send message: {0}")]
    Send(#[source] BrokerError),

    #[error("broker connection unavailable: {0}")]
    Connection(#[source] BrokerError),
}

#[derive(Debug, Error)]
pub enum EventBusError {
    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    InvalidName(#[from] CoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event bus has been disposed")]
    Disposed,
}
