use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BasketItem {
    pub product_id: u64,
    pub product_name: String,
    pub unit_price: u64,
    /// Price before the most recent catalog change, if any.
    pub old_unit_price: Option<u64>,
    pub quantity: u32,
}

impl BasketItem {
    pub fn new(product_id: u64, product_name: impl Into<String>, unit_price: u64, quantity: u32) -> Self {
        Self {
            product_id,
            product_name: product_name.into(),
            unit_price,
            old_unit_price: None,
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomerBasket {
    pub buyer_id: String,
    pub items: Vec<BasketItem>,
}

impl CustomerBasket {
    pub fn new(buyer_id: impl Into<String>) -> Self {
        Self {
            buyer_id: buyer_id.into(),
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: BasketItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn total(&self) -> u64 {
        self.items
            .iter()
            .map(|i| i.unit_price * u64::from(i.quantity))
            .sum()
    }
}

/// Basket storage keyed by buyer id.
pub trait BasketRepository: Send + Sync {
    fn get_basket(&self, buyer_id: &str) -> Option<CustomerBasket>;
    fn update_basket(&self, basket: CustomerBasket) -> CustomerBasket;
    /// Returns whether a basket was removed.
    fn delete_basket(&self, buyer_id: &str) -> bool;
    fn users(&self) -> Vec<String>;
}

impl<R> BasketRepository for Arc<R>
where
    R: BasketRepository + ?Sized,
{
    fn get_basket(&self, buyer_id: &str) -> Option<CustomerBasket> {
        (**self).get_basket(buyer_id)
    }

    fn update_basket(&self, basket: CustomerBasket) -> CustomerBasket {
        (**self).update_basket(basket)
    }

    fn delete_basket(&self, buyer_id: &str) -> bool {
        (**self).delete_basket(buyer_id)
    }

    fn users(&self) -> Vec<String> {
        (**self).users()
    }
}

/// In-memory basket store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBasketRepository {
    inner: RwLock<HashMap<String, CustomerBasket>>,
}

impl InMemoryBasketRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BasketRepository for InMemoryBasketRepository {
    fn get_basket(&self, buyer_id: &str) -> Option<CustomerBasket> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(buyer_id)
            .cloned()
    }

    fn update_basket(&self, basket: CustomerBasket) -> CustomerBasket {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(basket.buyer_id.clone(), basket.clone());
        basket
    }

    fn delete_basket(&self, buyer_id: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(buyer_id)
            .is_some()
    }

    fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        users.sort();
        users
    }
}
