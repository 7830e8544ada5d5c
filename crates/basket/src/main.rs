use std::sync::Arc;
use std::time::Duration;

use eventbus_basket::host::BasketHost;
use eventbus_basket::{
    BasketItem, CustomerBasket, OrderStartedIntegrationEvent, ProductPriceChangedIntegrationEvent,
};
use eventbus_events::EventBus;
use eventbus_infra::{BrokerConnection, ConfigError, EventBusConfig, InMemoryBroker, InMemoryConnector};

fn main() -> anyhow::Result<()> {
    eventbus_observability::init();

    let config = match EventBusConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(key)) => {
            tracing::warn!(missing = key, "event bus not configured; using in-memory dev defaults");
            EventBusConfig::new("memory://local", "Basket")
        }
        Err(e) => return Err(e.into()),
    };

    let broker = InMemoryBroker::new();
    broker.ensure_subscription(&config.topic_name, &config.subscription_name);

    let connector = Arc::new(InMemoryConnector::new(broker.clone()));
    let connection = Arc::new(BrokerConnection::open(&config.connection_string, connector)?);
    let host = BasketHost::start(connection.clone(), &config)?;

    host.service.update_basket(
        CustomerBasket::new("alice").with_item(BasketItem::new(1, "Mug", 100, 2)),
    );

    host.bus().publish(&ProductPriceChangedIntegrationEvent::new(1, 120, 100))?;
    host.service.checkout("alice")?;
    host.bus().publish(&OrderStartedIntegrationEvent::new("alice"))?;

    std::thread::sleep(Duration::from_millis(500));

    let stats = host.bus().processor_stats();
    tracing::info!(stats = %serde_json::to_string(&stats)?, "processor stats");

    host.shutdown();
    connection.dispose();
    Ok(())
}
