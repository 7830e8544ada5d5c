//! Handler resolution.
//!
//! The bus never constructs handlers itself. Hosts register a factory per
//! handler type in a [`HandlerContainer`]; every inbound message opens a fresh
//! [`HandlerScope`] and resolves the handlers it needs from it. Within one scope a
//! handler type resolves to the same instance; across scopes (messages) nothing
//! is shared unless the factory itself shares it.
//!
//! Resolution yields zero or one instance. An unregistered handler type is not an
//! error: the subscription is skipped for that message.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use eventbus_core::name::short_type_name;

type Instance = Box<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn() -> Instance + Send + Sync>;

/// Runtime identity of a handler implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    pub fn of<H: 'static>() -> Self {
        Self {
            id: TypeId::of::<H>(),
            name: short_type_name(std::any::type_name::<H>()),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Factories for handler types, shared by every scope opened from it.
///
/// Cloning is cheap and clones share registrations.
#[derive(Clone, Default)]
pub struct HandlerContainer {
    factories: Arc<RwLock<HashMap<TypeId, Factory>>>,
}

impl HandlerContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory producing a fresh handler for every scope.
    pub fn register<H, F>(&self, factory: F)
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Box::new(Arc::new(factory())) as Instance);
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<H>(), factory);
    }

    /// Register one shared instance that every scope resolves to.
    pub fn register_instance<H>(&self, handler: Arc<H>)
    where
        H: Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move || Box::new(Arc::clone(&handler)) as Instance);
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<H>(), factory);
    }

    pub fn deregister<H: 'static>(&self) -> bool {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&TypeId::of::<H>())
            .is_some()
    }

    pub fn is_registered<H: 'static>(&self) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&TypeId::of::<H>())
    }

    /// Open a resolution scope (one per inbound message).
    pub fn begin_scope(&self) -> HandlerScope {
        HandlerScope {
            container: self.clone(),
            resolved: HashMap::new(),
        }
    }

    fn create(&self, id: TypeId) -> Option<Instance> {
        // Factories run outside the lock so they may touch the container.
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()?;
        Some(factory())
    }
}

impl fmt::Debug for HandlerContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .factories
            .read()
            .map(|m| m.len())
            .unwrap_or_default();
        f.debug_struct("HandlerContainer")
            .field("registrations", &count)
            .finish()
    }
}

/// Per-message resolution scope.
pub struct HandlerScope {
    container: HandlerContainer,
    resolved: HashMap<TypeId, Instance>,
}

impl HandlerScope {
    pub fn resolve<H>(&mut self) -> Option<Arc<H>>
    where
        H: Send + Sync + 'static,
    {
        let id = TypeId::of::<H>();
        if let Some(existing) = self.resolved.get(&id) {
            return existing.downcast_ref::<Arc<H>>().cloned();
        }

        let instance = self.container.create(id)?;
        let handler = instance.downcast_ref::<Arc<H>>()?.clone();
        self.resolved.insert(id, instance);
        Some(handler)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Counter {
        serial: usize,
    }

    #[test]
    fn unregistered_handler_resolves_to_nothing() {
        let container = HandlerContainer::new();
        let mut scope = container.begin_scope();
        assert!(scope.resolve::<Counter>().is_none());
    }

    #[test]
    fn same_scope_reuses_instance_new_scope_creates_one() {
        let created = Arc::new(AtomicUsize::new(0));
        let container = HandlerContainer::new();
        let c = created.clone();
        container.register(move || Counter {
            serial: c.fetch_add(1, Ordering::SeqCst),
        });

        let mut first = container.begin_scope();
        let a = first.resolve::<Counter>().unwrap();
        let b = first.resolve::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let mut second = container.begin_scope();
        let c2 = second.resolve::<Counter>().unwrap();
        assert_ne!(a.serial, c2.serial);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registered_instance_is_shared_across_scopes() {
        let container = HandlerContainer::new();
        let shared = Arc::new(Counter { serial: 42 });
        container.register_instance(shared.clone());

        let a = container.begin_scope().resolve::<Counter>().unwrap();
        let b = container.begin_scope().resolve::<Counter>().unwrap();
        assert!(Arc::ptr_eq(&a, &shared));
        assert!(Arc::ptr_eq(&b, &shared));
    }

    #[test]
    fn deregister_removes_factory() {
        let container = HandlerContainer::new();
        container.register(|| Counter { serial: 0 });
        assert!(container.is_registered::<Counter>());
        assert!(container.deregister::<Counter>());
        assert!(!container.is_registered::<Counter>());
        assert!(!container.deregister::<Counter>());
    }

    #[test]
    fn handler_type_uses_short_name() {
        assert_eq!(HandlerType::of::<Counter>().name(), "Counter");
    }
}
