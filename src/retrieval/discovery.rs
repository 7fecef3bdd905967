//! Provider lookup over the registry

use super::types::CapabilityFilter;
use crate::error::Result;
use crate::types::{ProviderId, ProviderRecord};
use async_trait::async_trait;
use log::debug;
use std::cmp::Reverse;
use std::sync::Arc;

/// Source of provider records
#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// Providers matching `filter`. Implementations may ignore the filter.
    async fn list_providers(&self, filter: &CapabilityFilter) -> Result<Vec<ProviderRecord>>;

    /// Look up one provider; `None` when the registry does not know it
    async fn get_provider(&self, provider_id: ProviderId) -> Result<Option<ProviderRecord>>;
}

/// Order by health, then most recently registered, then lowest id
pub fn rank_providers(mut providers: Vec<ProviderRecord>) -> Vec<ProviderRecord> {
    providers.sort_by_key(|p| (p.health.rank(), Reverse(p.registered_at), p.provider_id));
    providers
}

/// Filters and ranks registry results
#[derive(Clone)]
pub struct ProviderDiscovery {
    registry: Arc<dyn ProviderRegistry>,
}

impl ProviderDiscovery {
    pub fn new(registry: Arc<dyn ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Ranked providers satisfying `filter`
    pub async fn find(&self, filter: &CapabilityFilter) -> Result<Vec<ProviderRecord>> {
        let listed = self.registry.list_providers(filter).await?;
        let total = listed.len();
        let matching: Vec<ProviderRecord> =
            listed.into_iter().filter(|p| filter.matches(p)).collect();
        debug!("{} of {} registered providers match", matching.len(), total);
        Ok(rank_providers(matching))
    }

    /// Registry record for a provider id, usable or not
    pub async fn resolve(&self, provider_id: ProviderId) -> Result<Option<ProviderRecord>> {
        self.registry.get_provider(provider_id).await
    }
}
