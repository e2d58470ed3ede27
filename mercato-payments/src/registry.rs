//! Adapter lookup by provider identifier

use crate::{
    error::{PaymentError, PaymentResult},
    provider::PaymentGatewayAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Registered gateway adapters, keyed by `PaymentGatewayAdapter::identifier`
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PaymentGatewayAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any adapter with the same identifier
    pub fn register<A: PaymentGatewayAdapter + 'static>(mut self, adapter: A) -> Self {
        self.insert(Arc::new(adapter));
        self
    }

    pub fn insert(&mut self, adapter: Arc<dyn PaymentGatewayAdapter>) {
        self.providers
            .insert(adapter.identifier().to_string(), adapter);
    }

    pub fn get(&self, provider_id: &str) -> PaymentResult<Arc<dyn PaymentGatewayAdapter>> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| PaymentError::UnknownProvider(provider_id.to_string()))
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers.contains_key(provider_id)
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(all(test, feature = "manual"))]
mod tests {
    use super::*;
    use crate::config::ManualConfig;
    use crate::providers::ManualProvider;

    #[test]
    fn test_lookup() {
        let registry =
            ProviderRegistry::new().register(ManualProvider::new(ManualConfig::new("s")).unwrap());

        assert!(registry.contains("manual"));
        assert_eq!(registry.identifiers(), vec!["manual"]);
        assert_eq!(registry.get("manual").unwrap().identifier(), "manual");
        assert!(matches!(
            registry.get("stripe"),
            Err(PaymentError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_dispatch_through_registry() {
        let registry =
            ProviderRegistry::new().register(ManualProvider::new(ManualConfig::new("s")).unwrap());
        let adapter = registry.get("manual").unwrap();

        let order = tokio_test::block_on(adapter.create_order(
            crate::money::Money::usd(1200),
            "cart_9",
            "ps_9-create",
        ))
        .unwrap();
        assert_eq!(order.gateway_status, "APPROVED");
    }
}
