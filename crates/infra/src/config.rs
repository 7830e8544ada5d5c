//! Bus configuration.

use std::time::Duration;

use thiserror::Error;

use crate::processor::{DEFAULT_MAX_CONCURRENT_CALLS, DEFAULT_RECEIVE_TIMEOUT, ProcessorOptions};

pub const DEFAULT_TOPIC_NAME: &str = "eshop_event_bus";

pub const ENV_CONNECTION: &str = "EVENT_BUS_CONNECTION";
pub const ENV_TOPIC: &str = "EVENT_BUS_TOPIC";
pub const ENV_SUBSCRIPTION: &str = "EVENT_BUS_SUBSCRIPTION_CLIENT_NAME";
pub const ENV_MAX_CONCURRENT_CALLS: &str = "EVENT_BUS_MAX_CONCURRENT_CALLS";
pub const ENV_RECEIVE_TIMEOUT_MS: &str = "EVENT_BUS_RECEIVE_TIMEOUT_MS";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusConfig {
    pub connection_string: String,
    pub topic_name: String,
    /// This process's subscription on the topic.
    pub subscription_name: String,
    pub max_concurrent_calls: usize,
    pub receive_timeout: Duration,
}

impl EventBusConfig {
    pub fn new(connection_string: impl Into<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            topic_name: DEFAULT_TOPIC_NAME.to_string(),
            subscription_name: subscription_name.into(),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    pub fn with_topic_name(mut self, topic: impl Into<String>) -> Self {
        self.topic_name = topic.into();
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };

        let mut config = Self::new(required(ENV_CONNECTION)?, required(ENV_SUBSCRIPTION)?);

        if let Some(topic) = lookup(ENV_TOPIC).filter(|v| !v.trim().is_empty()) {
            config.topic_name = topic;
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_CALLS) {
            config.max_concurrent_calls = parse_number(ENV_MAX_CONCURRENT_CALLS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RECEIVE_TIMEOUT_MS) {
            config.receive_timeout =
                Duration::from_millis(parse_number(ENV_RECEIVE_TIMEOUT_MS, &raw)? as u64);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_CONNECTION));
        }
        if self.subscription_name.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_SUBSCRIPTION));
        }
        if self.topic_name.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_TOPIC));
        }
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::Invalid {
                key: ENV_MAX_CONCURRENT_CALLS,
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions::default()
            .with_max_concurrent_calls(self.max_concurrent_calls)
            .with_receive_timeout(self.receive_timeout)
            .with_name(format!("{}-processor", self.subscription_name))
    }
}

fn parse_number(key: &'static str, raw: &str) -> Result<usize, ConfigError> {
    raw.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}
