use std::any::TypeId;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use eventbus_core::name::short_type_name;
use eventbus_core::{CoreResult, EventId, EventName};

/// Identity and creation time every integration event carries.
///
/// Both values are fixed at construction. `new()` generates them; `from_parts()`
/// and deserialization accept values supplied from the wire without regenerating
/// them, so an event keeps its identity across process boundaries.
///
/// Wire names are `Id` / `CreateDateTime`; embed with `#[serde(flatten)]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventMetadata {
    id: EventId,
    create_date_time: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new() -> Self {
        Self {
            id: EventId::new(),
            create_date_time: Utc::now(),
        }
    }

    pub fn from_parts(id: EventId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            create_date_time: created_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.create_date_time
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// An event published to other services through the bus.
///
/// Integration events are:
/// - **immutable facts** (treat them as values once published)
/// - **self-describing**: the routing key is derived from the type name
/// - **serde-serializable** (JSON on the wire)
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn metadata(&self) -> &EventMetadata;

    fn id(&self) -> EventId {
        self.metadata().id()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.metadata().created_at()
    }

    /// Type name used to derive the routing key. Defaults to the Rust type name.
    fn type_name() -> &'static str
    where
        Self: Sized,
    {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Routing key: [`Self::type_name`] with the `IntegrationEvent` suffix stripped.
    fn event_name() -> CoreResult<EventName>
    where
        Self: Sized,
    {
        EventName::from_type_name(Self::type_name())
    }
}

/// Runtime identity of a concrete event payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventType {
    id: TypeId,
    name: &'static str,
}

impl EventType {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            id: TypeId::of::<E>(),
            name: E::type_name(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
