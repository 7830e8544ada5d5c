use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use eventbus_events::EventBus;

use crate::events::UserCheckoutAcceptedIntegrationEvent;
use crate::repository::{BasketRepository, CustomerBasket};

#[derive(Debug, Error)]
pub enum BasketError {
    #[error("no basket for buyer {0}")]
    NotFound(String),

    #[error("basket for buyer {0} is empty")]
    Empty(String),

    #[error("failed to publish checkout")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Application service over the basket repository and the bus.
pub struct BasketService<B: EventBus> {
    repository: Arc<dyn BasketRepository>,
    bus: B,
}

impl<B: EventBus> BasketService<B> {
    pub fn new(repository: Arc<dyn BasketRepository>, bus: B) -> Self {
        Self { repository, bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn basket(&self, buyer_id: &str) -> Option<CustomerBasket> {
        self.repository.get_basket(buyer_id)
    }

    pub fn update_basket(&self, basket: CustomerBasket) -> CustomerBasket {
        self.repository.update_basket(basket)
    }

    /// Publish the checkout. The basket itself is removed later, on `OrderStarted`.
    pub fn checkout(&self, buyer_id: &str) -> Result<UserCheckoutAcceptedIntegrationEvent, BasketError> {
        let basket = self
            .repository
            .get_basket(buyer_id)
            .ok_or_else(|| BasketError::NotFound(buyer_id.to_string()))?;
        if basket.items.is_empty() {
            return Err(BasketError::Empty(buyer_id.to_string()));
        }

        let event = UserCheckoutAcceptedIntegrationEvent::new(buyer_id, basket);
        self.bus
            .publish(&event)
            .map_err(|e| BasketError::Publish(Box::new(e)))?;

        info!(event_id = %event.meta.id(), buyer_id, "checkout accepted");
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{BasketItem, InMemoryBasketRepository};
    use eventbus_events::{HandlerContainer, InProcessEventBus};

    fn service() -> BasketService<InProcessEventBus> {
        let repo = Arc::new(InMemoryBasketRepository::new());
        BasketService::new(repo, InProcessEventBus::new(HandlerContainer::new()))
    }

    #[test]
    fn checkout_requires_non_empty_basket() {
        let service = service();
        assert!(matches!(service.checkout("alice"), Err(BasketError::NotFound(_))));

        service.update_basket(CustomerBasket::new("alice"));
        assert!(matches!(service.checkout("alice"), Err(BasketError::Empty(_))));

        service.update_basket(CustomerBasket::new("alice").with_item(BasketItem::new(1, "Mug", 100, 2)));
        let event = service.checkout("alice").unwrap();
        assert_eq!(event.basket.total(), 200);
        assert!(service.basket("alice").is_some());
    }
}
