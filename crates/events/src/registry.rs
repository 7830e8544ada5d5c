//! Subscription bookkeeping.
//!
//! The registry maps an [`EventName`] to the ordered list of handlers subscribed
//! to it, plus the concrete payload type for typed subscriptions. It is passive
//! state: no IO, no notifications.
//!
//! ## Concurrency
//!
//! Subscribe/unsubscribe (writers) run rarely, typically at startup and
//! shutdown; every in-flight dispatch reads. State sits behind one `RwLock` and
//! readers receive owned snapshots, so a dispatch never observes a half-applied
//! update and never holds the lock while handlers run.
//!
//! ## Ordering and duplicates
//!
//! Subscriptions keep insertion order, which is the handler invocation order.
//! Adding the same handler twice is allowed and yields two invocations.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use eventbus_core::{CoreError, EventName};

use crate::codec;
use crate::container::{HandlerScope, HandlerType};
use crate::dispatch::DispatchError;
use crate::event::EventType;
use crate::handler::{DynamicIntegrationEventHandler, IntegrationEventHandler};
use crate::IntegrationEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no event type registered for {0}")]
    UnknownEventType(EventName),

    /// Two distinct payload types derive the same routing key.
    #[error("event name {name} is already bound to {registered}, cannot bind {requested}")]
    EventNameCollision {
        name: EventName,
        registered: &'static str,
        requested: &'static str,
    },

    #[error(transparent)]
    InvalidName(#[from] CoreError),
}

/// One handler registered under one event name.
#[derive(Clone)]
pub struct Subscription {
    handler: HandlerType,
    event_type: Option<EventType>,
    invoker: Arc<dyn Invoker>,
}

impl Subscription {
    pub fn typed<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            handler: HandlerType::of::<H>(),
            event_type: Some(EventType::of::<E>()),
            invoker: Arc::new(TypedInvoker::<E, H>(PhantomData)),
        }
    }

    pub fn dynamic<H>() -> Self
    where
        H: DynamicIntegrationEventHandler,
    {
        Self {
            handler: HandlerType::of::<H>(),
            event_type: None,
            invoker: Arc::new(DynamicInvoker::<H>(PhantomData)),
        }
    }

    pub fn handler_type(&self) -> HandlerType {
        self.handler
    }

    pub fn is_dynamic(&self) -> bool {
        self.event_type.is_none()
    }

    /// Payload type; `None` for dynamic subscriptions.
    pub fn event_type(&self) -> Option<EventType> {
        self.event_type
    }

    /// Resolve this subscription's handler from `scope`.
    pub(crate) fn resolve(&self, scope: &mut HandlerScope) -> Option<Box<dyn ResolvedHandler>> {
        self.invoker.resolve(scope)
    }

    fn matches(&self, handler: HandlerType, dynamic: bool) -> bool {
        self.handler == handler && self.is_dynamic() == dynamic
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handler", &self.handler.name())
            .field("event_type", &self.event_type.map(|t| t.name()))
            .finish()
    }
}

/// Erased "resolve my handler type from a scope" step.
trait Invoker: Send + Sync {
    fn resolve(&self, scope: &mut HandlerScope) -> Option<Box<dyn ResolvedHandler>>;
}

/// A resolved handler ready to consume one message body.
pub(crate) trait ResolvedHandler {
    fn invoke(&self, event_name: &EventName, body: &[u8]) -> Result<(), DispatchError>;
}

struct TypedInvoker<E, H>(PhantomData<fn() -> (E, H)>);

impl<E, H> Invoker for TypedInvoker<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    fn resolve(&self, scope: &mut HandlerScope) -> Option<Box<dyn ResolvedHandler>> {
        let handler = scope.resolve::<H>()?;
        Some(Box::new(TypedHandler::<E, H> {
            handler,
            _event: PhantomData,
        }))
    }
}

struct TypedHandler<E, H> {
    handler: Arc<H>,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> ResolvedHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    fn invoke(&self, event_name: &EventName, body: &[u8]) -> Result<(), DispatchError> {
        let event: E = codec::deserialize(body).map_err(|source| DispatchError::Deserialize {
            event_name: event_name.clone(),
            source,
        })?;

        self.handler
            .handle(event)
            .map_err(|source| DispatchError::Handler {
                event_name: event_name.clone(),
                handler: HandlerType::of::<H>().name(),
                source,
            })
    }
}

struct DynamicInvoker<H>(PhantomData<fn() -> H>);

impl<H> Invoker for DynamicInvoker<H>
where
    H: DynamicIntegrationEventHandler,
{
    fn resolve(&self, scope: &mut HandlerScope) -> Option<Box<dyn ResolvedHandler>> {
        let handler = scope.resolve::<H>()?;
        Some(Box::new(DynamicHandler { handler }))
    }
}

struct DynamicHandler<H> {
    handler: Arc<H>,
}

impl<H> ResolvedHandler for DynamicHandler<H>
where
    H: DynamicIntegrationEventHandler,
{
    fn invoke(&self, event_name: &EventName, body: &[u8]) -> Result<(), DispatchError> {
        let document = codec::parse_document(body).map_err(|source| DispatchError::Deserialize {
            event_name: event_name.clone(),
            source,
        })?;

        self.handler
            .handle(&document)
            .map_err(|source| DispatchError::Handler {
                event_name: event_name.clone(),
                handler: HandlerType::of::<H>().name(),
                source,
            })
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    handlers: HashMap<EventName, Vec<Subscription>>,
    event_types: HashMap<EventName, EventType>,
}

/// In-memory `EventName → [Subscription]` registry.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.read(|s| s.handlers.is_empty())
    }

    /// True iff at least one typed or dynamic subscription exists for `event_name`.
    pub fn has_subscriptions_for(&self, event_name: &EventName) -> bool {
        self.read(|s| s.handlers.contains_key(event_name))
    }

    /// Append a typed subscription for `E` handled by `H`.
    ///
    /// Returns the event name the subscription was registered under.
    pub fn add_subscription<E, H>(&self) -> Result<EventName, RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = E::event_name()?;
        let event_type = EventType::of::<E>();

        let mut state = self.write();
        if let Some(existing) = state.event_types.get(&event_name) {
            if existing.type_id() != event_type.type_id() {
                return Err(RegistryError::EventNameCollision {
                    name: event_name,
                    registered: existing.name(),
                    requested: event_type.name(),
                });
            }
        }

        state.event_types.insert(event_name.clone(), event_type);
        state
            .handlers
            .entry(event_name.clone())
            .or_default()
            .push(Subscription::typed::<E, H>());

        Ok(event_name)
    }

    /// Append a dynamic subscription for `H` under `event_name`.
    pub fn add_dynamic_subscription<H>(&self, event_name: &EventName)
    where
        H: DynamicIntegrationEventHandler,
    {
        self.write()
            .handlers
            .entry(event_name.clone())
            .or_default()
            .push(Subscription::dynamic::<H>());
    }

    /// Remove the first typed subscription of `H` for `E`. Unknown pairs are a no-op.
    pub fn remove_subscription<E, H>(&self) -> Result<Option<Subscription>, RegistryError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = E::event_name()?;
        Ok(self.remove(&event_name, HandlerType::of::<H>(), false))
    }

    /// Remove the first dynamic subscription of `H` under `event_name`. Unknown pairs are a no-op.
    pub fn remove_dynamic_subscription<H>(&self, event_name: &EventName) -> Option<Subscription>
    where
        H: DynamicIntegrationEventHandler,
    {
        self.remove(event_name, HandlerType::of::<H>(), true)
    }

    /// Subscriptions for `event_name` in registration order (empty if none).
    pub fn handlers_for(&self, event_name: &EventName) -> Vec<Subscription> {
        self.read(|s| s.handlers.get(event_name).cloned().unwrap_or_default())
    }

    pub fn event_type_by_name(&self, event_name: &EventName) -> Result<EventType, RegistryError> {
        self.read(|s| s.event_types.get(event_name).copied())
            .ok_or_else(|| RegistryError::UnknownEventType(event_name.clone()))
    }

    pub fn event_names(&self) -> Vec<EventName> {
        let mut names = self.read(|s| s.handlers.keys().cloned().collect::<Vec<_>>());
        names.sort();
        names
    }

    /// Drop every subscription (bus shutdown).
    pub fn clear(&self) {
        let mut state = self.write();
        state.handlers.clear();
        state.event_types.clear();
    }

    fn remove(
        &self,
        event_name: &EventName,
        handler: HandlerType,
        dynamic: bool,
    ) -> Option<Subscription> {
        let mut state = self.write();
        let subs = state.handlers.get_mut(event_name)?;
        let position = subs.iter().position(|s| s.matches(handler, dynamic))?;
        let removed = subs.remove(position);

        let no_typed_left = subs.iter().all(Subscription::is_dynamic);
        if subs.is_empty() {
            state.handlers.remove(event_name);
        }
        if no_typed_left {
            state.event_types.remove(event_name);
        }

        Some(removed)
    }

    fn read<T>(&self, f: impl FnOnce(&RegistryState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
