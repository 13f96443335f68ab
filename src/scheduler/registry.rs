//! Lookup drivers, registered per provider at startup

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::LookupError;
use crate::models::{LookupOutcome, PhoneNumber, Provider};
use crate::pool::Endpoint;

/// Performs one provider-specific check on a leased endpoint.
///
/// Must be safe to call again after a transient failure.
#[async_trait]
pub trait LookupProvider: Send + Sync {
    /// Provider this driver serves
    fn provider(&self) -> Provider;

    async fn lookup(
        &self,
        endpoint: &Endpoint,
        number: &PhoneNumber,
    ) -> Result<LookupOutcome, LookupError>;
}

/// Provider tag to driver mapping
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    drivers: HashMap<Provider, Arc<dyn LookupProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, replacing any previous one for the same provider
    pub fn register(&mut self, driver: Arc<dyn LookupProvider>) -> &mut Self {
        self.drivers.insert(driver.provider(), driver);
        self
    }

    pub fn with(mut self, driver: Arc<dyn LookupProvider>) -> Self {
        self.register(driver);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn LookupProvider>> {
        self.drivers.get(&provider).cloned()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.drivers.contains_key(&provider)
    }

    /// Registered providers, sorted
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.drivers.keys().copied().collect();
        providers.sort();
        providers
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
