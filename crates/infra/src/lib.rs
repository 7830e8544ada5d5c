//! Broker-backed event bus.
//!
//! - [`broker`]: capability traits any topic/subscription broker provides, plus
//!   an in-memory implementation
//! - [`connection`]: the shared, reconnecting broker connection
//! - [`processor`]: bounded receive workers with manual completion
//! - [`service_bus`]: the [`ServiceBusEventBus`] facade
//! - [`config`]: settings and environment loading

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod processor;
pub mod service_bus;

pub use broker::{BrokerError, InMemoryBroker, InMemoryConnector};
pub use config::{ConfigError, EventBusConfig};
pub use connection::BrokerConnection;
pub use error::{EventBusError, PublishError};
pub use processor::{MessageProcessor, ProcessError, ProcessorOptions, ProcessorStats};
pub use service_bus::ServiceBusEventBus;

#[cfg(test)]
mod integration_tests;
