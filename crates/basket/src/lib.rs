//! Basket service: the reference consumer of the event bus.
//!
//! Subscribes to catalog price changes and order starts, keeps customer
//! baskets in a repository, and publishes checkout events.

pub mod events;
pub mod handlers;
pub mod host;
pub mod repository;
pub mod service;

pub use events::{
    OrderStartedIntegrationEvent, ProductPriceChangedIntegrationEvent,
    UserCheckoutAcceptedIntegrationEvent,
};
pub use handlers::{
    OrderStartedIntegrationEventHandler, PriceChangeAuditHandler,
    ProductPriceChangedIntegrationEventHandler,
};
pub use repository::{BasketItem, BasketRepository, CustomerBasket, InMemoryBasketRepository};
pub use service::{BasketError, BasketService};
