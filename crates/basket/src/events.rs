//! Integration events the basket service consumes and publishes.
//!
//! Prices are in minor units (cents).

use serde::{Deserialize, Serialize};

use eventbus_events::{EventMetadata, IntegrationEvent};

use crate::repository::CustomerBasket;

/// Catalog changed the price of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProductPriceChangedIntegrationEvent {
    #[serde(flatten)]
    pub meta: EventMetadata,
    pub product_id: u64,
    pub new_price: u64,
    pub old_price: u64,
}

impl ProductPriceChangedIntegrationEvent {
    pub fn new(product_id: u64, new_price: u64, old_price: u64) -> Self {
        Self {
            meta: EventMetadata::new(),
            product_id,
            new_price,
            old_price,
        }
    }
}

impl IntegrationEvent for ProductPriceChangedIntegrationEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

/// Ordering accepted a checkout; the buyer's basket can go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderStartedIntegrationEvent {
    #[serde(flatten)]
    pub meta: EventMetadata,
    pub user_id: String,
}

impl OrderStartedIntegrationEvent {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            meta: EventMetadata::new(),
            user_id: user_id.into(),
        }
    }
}

impl IntegrationEvent for OrderStartedIntegrationEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

/// Published by the basket service when a buyer checks out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserCheckoutAcceptedIntegrationEvent {
    #[serde(flatten)]
    pub meta: EventMetadata,
    pub user_id: String,
    pub basket: CustomerBasket,
}

impl UserCheckoutAcceptedIntegrationEvent {
    pub fn new(user_id: impl Into<String>, basket: CustomerBasket) -> Self {
        Self {
            meta: EventMetadata::new(),
            user_id: user_id.into(),
            basket,
        }
    }
}

impl IntegrationEvent for UserCheckoutAcceptedIntegrationEvent {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}
