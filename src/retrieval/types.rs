//! Retrieval records and provider filters

use crate::types::{Capability, DatasetId, ProviderId, ProviderRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A provider recorded on chain as holding a piece in a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub dataset_id: DatasetId,
    pub provider_id: ProviderId,
}

/// One failed or skipped retrieval attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalFailure {
    pub provider_id: Option<ProviderId>,
    pub dataset_id: Option<DatasetId>,
    pub endpoint: Option<String>,
    pub cause: String,
}

impl RetrievalFailure {
    pub fn for_candidate(candidate: &RetrievalCandidate, cause: impl Into<String>) -> Self {
        Self {
            provider_id: Some(candidate.provider_id),
            dataset_id: Some(candidate.dataset_id),
            endpoint: None,
            cause: cause.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// A failure of the fallback retriever, which has no provider attribution
    pub fn fallback(cause: impl Into<String>) -> Self {
        Self {
            provider_id: None,
            dataset_id: None,
            endpoint: None,
            cause: cause.into(),
        }
    }
}

impl fmt::Display for RetrievalFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.provider_id {
            Some(id) => write!(f, "provider {}: {}", id, self.cause),
            None => write!(f, "fallback: {}", self.cause),
        }
    }
}

/// Constraints applied when listing providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityFilter {
    pub required: BTreeSet<Capability>,
    pub piece_size: Option<u64>,
    /// Drop inactive and unhealthy providers (default: true)
    pub only_usable: bool,
    pub exclude: BTreeSet<ProviderId>,
}

impl Default for CapabilityFilter {
    fn default() -> Self {
        let mut required = BTreeSet::new();
        required.insert(Capability::Pdp);
        Self {
            required,
            piece_size: None,
            only_usable: true,
            exclude: BTreeSet::new(),
        }
    }
}

impl CapabilityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, capability: Capability) -> Self {
        self.required.insert(capability);
        self
    }

    pub fn piece_size(mut self, size: u64) -> Self {
        self.piece_size = Some(size);
        self
    }

    pub fn include_unusable(mut self) -> Self {
        self.only_usable = false;
        self
    }

    pub fn exclude(mut self, provider_id: ProviderId) -> Self {
        self.exclude.insert(provider_id);
        self
    }

    pub fn matches(&self, record: &ProviderRecord) -> bool {
        if self.exclude.contains(&record.provider_id) {
            return false;
        }
        if self.only_usable && !record.is_usable() {
            return false;
        }
        if let Some(size) = self.piece_size {
            if !record.supports_piece_size(size) {
                return false;
            }
        }
        self.required.iter().all(|c| record.has_capability(*c))
    }
}
