//! Wiring of the basket service onto a broker-backed bus.

use std::sync::Arc;

use tracing::info;

use eventbus_events::{EventBus, HandlerContainer};
use eventbus_infra::{BrokerConnection, EventBusConfig, EventBusError, ServiceBusEventBus};

use crate::events::{OrderStartedIntegrationEvent, ProductPriceChangedIntegrationEvent};
use crate::handlers::{
    OrderStartedIntegrationEventHandler, PriceChangeAuditHandler,
    ProductPriceChangedIntegrationEventHandler,
};
use crate::repository::{BasketRepository, InMemoryBasketRepository};
use crate::service::BasketService;

/// Event name the audit handler listens to without a typed contract.
pub const AUDITED_EVENT: &str = "ProductPriceChangedIntegrationEvent";

pub struct BasketHost {
    pub repository: Arc<InMemoryBasketRepository>,
    pub audit: Arc<PriceChangeAuditHandler>,
    pub service: BasketService<Arc<ServiceBusEventBus>>,
}

impl BasketHost {
    /// Build the container, start the bus and subscribe every basket handler.
    pub fn start(
        connection: Arc<BrokerConnection>,
        config: &EventBusConfig,
    ) -> Result<Self, EventBusError> {
        let repository = Arc::new(InMemoryBasketRepository::new());
        let audit = Arc::new(PriceChangeAuditHandler::new());
        let container = handler_container(repository.clone(), audit.clone());

        let bus = Arc::new(ServiceBusEventBus::new(connection, container, config)?);
        subscribe_all(&bus)?;
        info!(subscription = %config.subscription_name, "basket host started");

        Ok(Self {
            service: BasketService::new(repository.clone(), bus),
            repository,
            audit,
        })
    }

    pub fn bus(&self) -> &Arc<ServiceBusEventBus> {
        self.service.bus()
    }

    pub fn shutdown(&self) {
        self.bus().dispose();
        info!("basket host stopped");
    }
}

/// Handlers resolve per message; the audit handler is one shared instance.
pub fn handler_container(
    repository: Arc<dyn BasketRepository>,
    audit: Arc<PriceChangeAuditHandler>,
) -> HandlerContainer {
    let container = HandlerContainer::new();

    let repo = repository.clone();
    container.register(move || ProductPriceChangedIntegrationEventHandler::new(repo.clone()));
    container.register(move || OrderStartedIntegrationEventHandler::new(repository.clone()));
    container.register_instance(audit);

    container
}

pub fn subscribe_all<B: EventBus>(bus: &B) -> Result<(), B::Error> {
    bus.subscribe::<ProductPriceChangedIntegrationEvent, ProductPriceChangedIntegrationEventHandler>()?;
    bus.subscribe::<OrderStartedIntegrationEvent, OrderStartedIntegrationEventHandler>()?;
    bus.subscribe_dynamic::<PriceChangeAuditHandler>(AUDITED_EVENT)?;
    Ok(())
}
