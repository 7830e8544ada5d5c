//! Event routing keys.
//!
//! An [`EventName`] is the short key an event type is published under: the
//! type's own name with the conventional [`INTEGRATION_EVENT_SUFFIX`] removed
//! (`ProductPriceChangedIntegrationEvent` routes as `ProductPriceChanged`).
//!
//! The same key is used as the broker message label, as the name of the routing
//! rule that admits the label into a subscription, and as the registry key that
//! handlers are looked up by.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Conventional suffix of integration event type names.
pub const INTEGRATION_EVENT_SUFFIX: &str = "IntegrationEvent";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventName(String);

impl EventName {
    /// Derive the routing key from a type name.
    ///
    /// Accepts bare names (`OrderStartedIntegrationEvent`), module paths
    /// (`basket::events::OrderStartedIntegrationEvent`) and already-stripped
    /// names (`OrderStarted`). Only a *trailing* suffix is removed, once.
    pub fn from_type_name(type_name: &str) -> CoreResult<Self> {
        let short = short_type_name(type_name);
        let stripped = short
            .strip_suffix(INTEGRATION_EVENT_SUFFIX)
            .unwrap_or(short);

        if stripped.is_empty() {
            return Err(CoreError::invalid_event_name(type_name));
        }

        Ok(Self(stripped.to_string()))
    }

    /// Rebuild the event name from a received message label.
    ///
    /// Receivers re-append the suffix to recover the full type name and then
    /// normalise it, so `from_label(name.label()) == name` for every name.
    pub fn from_label(label: &str) -> CoreResult<Self> {
        if label.is_empty() {
            return Err(CoreError::invalid_event_name(label));
        }
        Self::from_type_name(&format!("{label}{INTEGRATION_EVENT_SUFFIX}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label carried by broker messages for this event.
    pub fn label(&self) -> &str {
        &self.0
    }

    /// Full conventional type name (`<name>IntegrationEvent`).
    pub fn type_name(&self) -> String {
        format!("{}{}", self.0, INTEGRATION_EVENT_SUFFIX)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for EventName {
    type Error = CoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_type_name(value)
    }
}

/// Last path segment of a (possibly generic) Rust type path.
///
/// `a::b::Foo<c::Bar>` → `Foo`.
pub fn short_type_name(path: &str) -> &str {
    let head = path.split('<').next().unwrap_or(path);
    head.rsplit("::").next().unwrap_or(head).trim()
}
