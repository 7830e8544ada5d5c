use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value as JsonValue;
use tracing::info;

use eventbus_events::{DynamicIntegrationEventHandler, HandlerResult, IntegrationEventHandler};

use crate::events::{OrderStartedIntegrationEvent, ProductPriceChangedIntegrationEvent};
use crate::repository::BasketRepository;

/// Reprices matching basket lines when the catalog price changes.
///
/// Only lines still at the old price are touched, so a redelivered event is a no-op.
pub struct ProductPriceChangedIntegrationEventHandler {
    repository: Arc<dyn BasketRepository>,
}

impl ProductPriceChangedIntegrationEventHandler {
    pub fn new(repository: Arc<dyn BasketRepository>) -> Self {
        Self { repository }
    }
}

impl IntegrationEventHandler<ProductPriceChangedIntegrationEvent>
    for ProductPriceChangedIntegrationEventHandler
{
    fn handle(&self, event: ProductPriceChangedIntegrationEvent) -> HandlerResult {
        info!(
            event_id = %event.meta.id(),
            product_id = event.product_id,
            "handling product price change"
        );

        for buyer_id in self.repository.users() {
            let Some(mut basket) = self.repository.get_basket(&buyer_id) else {
                continue;
            };

            let mut changed = false;
            for item in basket
                .items
                .iter_mut()
                .filter(|i| i.product_id == event.product_id && i.unit_price == event.old_price)
            {
                item.old_unit_price = Some(item.unit_price);
                item.unit_price = event.new_price;
                changed = true;
            }

            if changed {
                self.repository.update_basket(basket);
            }
        }
        Ok(())
    }
}

/// Drops the buyer's basket once ordering has started.
pub struct OrderStartedIntegrationEventHandler {
    repository: Arc<dyn BasketRepository>,
}

impl OrderStartedIntegrationEventHandler {
    pub fn new(repository: Arc<dyn BasketRepository>) -> Self {
        Self { repository }
    }
}

impl IntegrationEventHandler<OrderStartedIntegrationEvent> for OrderStartedIntegrationEventHandler {
    fn handle(&self, event: OrderStartedIntegrationEvent) -> HandlerResult {
        let removed = self.repository.delete_basket(&event.user_id);
        info!(event_id = %event.meta.id(), user_id = %event.user_id, removed, "basket cleared");
        Ok(())
    }
}

/// Schema-less observer of price changes.
#[derive(Debug, Default)]
pub struct PriceChangeAuditHandler {
    seen: Mutex<Vec<JsonValue>>,
}

impl PriceChangeAuditHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<JsonValue> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl DynamicIntegrationEventHandler for PriceChangeAuditHandler {
    fn handle(&self, event: &JsonValue) -> HandlerResult {
        let Some(product_id) = event.get("ProductId").and_then(JsonValue::as_u64) else {
            anyhow::bail!("price change without ProductId");
        };
        info!(product_id, "price change observed");
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}
