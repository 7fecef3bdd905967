//! Shared identifiers and records used across the upload and retrieval paths

use crate::error::{Result, StorageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Ordered key/value metadata attached to datasets and pieces.
///
/// A `BTreeMap` keeps keys sorted, so two maps built from the same pairs in a
/// different order compare and hash identically.
pub type Metadata = BTreeMap<String, String>;

/// Server-assigned dataset id
pub type DatasetId = u64;

/// Registry-assigned provider id
pub type ProviderId = u64;

/// Metadata key that requests CDN-backed retrieval for a dataset
pub const WITH_CDN_KEY: &str = "withCDN";

/// A piece content identifier (PieceCID)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PieceCid(String);

impl PieceCid {
    /// Parse and validate a CID string
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value = value.as_ref().trim();
        if value.is_empty() {
            return Err(StorageError::validation(
                "piece_cid",
                "Piece CID cannot be empty",
            ));
        }

        cid::Cid::try_from(value).map_err(|e| {
            StorageError::validation("piece_cid", format!("Invalid piece CID {}: {}", value, e))
        })?;

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PieceCid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PieceCid {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The protocol step an error or trace belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    CreateDataset,
    DatasetStatus,
    AddPieces,
    CreateSession,
    PutBytes,
    Finalize,
    PollIndexed,
    Download,
    Ping,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::CreateDataset => write!(f, "create-dataset"),
            Phase::DatasetStatus => write!(f, "dataset-status"),
            Phase::AddPieces => write!(f, "add-pieces"),
            Phase::CreateSession => write!(f, "create-session"),
            Phase::PutBytes => write!(f, "put-bytes"),
            Phase::Finalize => write!(f, "finalize"),
            Phase::PollIndexed => write!(f, "poll-indexed"),
            Phase::Download => write!(f, "download"),
            Phase::Ping => write!(f, "ping"),
        }
    }
}

/// A dataset held by one provider for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: DatasetId,
    pub client_dataset_id: u64,
    pub provider_id: ProviderId,
    pub client_address: String,
    pub metadata: Metadata,
    /// True when this call created the dataset, false when an existing one was reused
    pub is_new: bool,
}

/// Exact-match metadata comparison used for dataset reuse decisions
pub fn metadata_matches(stored: &Metadata, requested: &Metadata) -> bool {
    stored == requested
}

/// Add the CDN marker key to `metadata` when requested and not already present
pub fn combine_metadata(metadata: Metadata, with_cdn: bool) -> Metadata {
    if !with_cdn || metadata.contains_key(WITH_CDN_KEY) {
        return metadata;
    }
    let mut combined = metadata;
    combined.insert(WITH_CDN_KEY.to_string(), String::new());
    combined
}

/// Capabilities a provider advertises in the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Serves the PDP upload/finalize protocol
    Pdp,
    /// Accepts multiple pieces in a single add-pieces request
    BatchAdd,
    IpniPiece,
    IpniIpfs,
    Cdn,
}

/// Health/reputation signal reported by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ProviderHealth {
    /// Lower is better
    pub fn rank(&self) -> u8 {
        match self {
            ProviderHealth::Healthy => 0,
            ProviderHealth::Degraded => 1,
            ProviderHealth::Unhealthy => 2,
        }
    }
}

impl Default for ProviderHealth {
    fn default() -> Self {
        ProviderHealth::Healthy
    }
}

/// A storage provider as listed by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub provider_id: ProviderId,
    pub name: String,
    /// Base URL of the provider's PDP service
    pub endpoint: String,
    pub payee: String,
    pub capabilities: BTreeSet<Capability>,
    pub min_piece_size: u64,
    pub max_piece_size: u64,
    pub health: ProviderHealth,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn new(provider_id: ProviderId, endpoint: impl Into<String>) -> Self {
        let mut capabilities = BTreeSet::new();
        capabilities.insert(Capability::Pdp);
        Self {
            provider_id,
            name: format!("provider-{}", provider_id),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            payee: String::new(),
            capabilities,
            min_piece_size: 0,
            max_piece_size: u64::MAX,
            health: ProviderHealth::Healthy,
            active: true,
            registered_at: Utc::now(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn payee(mut self, payee: impl Into<String>) -> Self {
        self.payee = payee.into();
        self
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn piece_size_range(mut self, min: u64, max: u64) -> Self {
        self.min_piece_size = min;
        self.max_piece_size = max;
        self
    }

    pub fn health(mut self, health: ProviderHealth) -> Self {
        self.health = health;
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn registered_at(mut self, registered_at: DateTime<Utc>) -> Self {
        self.registered_at = registered_at;
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn supports_piece_size(&self, size: u64) -> bool {
        size >= self.min_piece_size && size <= self.max_piece_size
    }

    /// Active and not reported unhealthy
    pub fn is_usable(&self) -> bool {
        self.active && self.health != ProviderHealth::Unhealthy
    }
}
