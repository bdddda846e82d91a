//! The `products` service: a static catalog behind a cached action.

use std::time::Duration;

use async_trait::async_trait;
use conduit_core::CallContext;
use serde_json::{json, Value};

use crate::service::action::{Action, ActionHandler, CachePolicy};
use crate::service::error::ActionError;
use crate::service::registry::{ManagedService, ServiceDefinition};

pub const SERVICE_NAME: &str = "products";

const CATALOG_TTL: Duration = Duration::from_secs(30);

/// Serves the product catalog.
#[derive(Debug, Default)]
pub struct ProductsService;

struct ListProducts;

#[async_trait]
impl ActionHandler for ListProducts {
    async fn handle(&self, _ctx: &CallContext) -> Result<Value, ActionError> {
        Ok(json!([
            { "name": "Apples", "price": 5 },
            { "name": "Oranges", "price": 3 },
            { "name": "Bananas", "price": 2 },
        ]))
    }
}

impl ManagedService for ProductsService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn definition(&self) -> ServiceDefinition {
        ServiceDefinition::new(SERVICE_NAME).action(
            Action::new("listProducts", ListProducts)
                .cache(CachePolicy::new(Vec::<String>::new(), CATALOG_TTL)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conduit_core::ManualClock;

    use super::*;
    use crate::service::broker::ServiceBroker;
    use crate::service::config::ServerConfig;
    use crate::service::registry::ServiceContext;

    #[tokio::test]
    async fn list_products_returns_catalog() {
        let ctx = ServiceContext::with_clock(ServerConfig::default(), Arc::new(ManualClock::new(0)));
        let mut broker = ServiceBroker::new(ctx);
        broker.register(ProductsService).unwrap();
        broker.start().await.unwrap();

        let products = broker
            .call(SERVICE_NAME, "listProducts", json!({}), None)
            .await
            .unwrap();
        let names: Vec<&str> = products
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|p| p["name"].as_str())
            .collect();
        assert_eq!(names, vec!["Apples", "Oranges", "Bananas"]);
        assert_eq!(products[0]["price"], 5);

        broker.stop().await.unwrap();
    }
}
