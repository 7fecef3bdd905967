//! Results and options for the storage workflows

use crate::chain::TxReceipt;
use crate::commp::PieceCidInfo;
use crate::types::{Dataset, DatasetId, Metadata, PieceCid, ProviderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Outcome of adding pieces to a dataset
///
/// `added` and `already_existing` are disjoint and together cover the input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResult {
    pub added: BTreeSet<PieceCid>,
    pub already_existing: BTreeSet<PieceCid>,
    /// Transaction of the request that added `added`, when one was needed
    pub tx_hash: Option<String>,
}

impl AddResult {
    pub fn contains(&self, piece_cid: &PieceCid) -> bool {
        self.added.contains(piece_cid) || self.already_existing.contains(piece_cid)
    }
}

/// A completed upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub piece_cid: PieceCid,
    pub size: u64,
    pub dataset_id: DatasetId,
    pub provider_id: ProviderId,
    pub server_piece_id: String,
    /// True when the piece was already registered in the dataset
    pub already_existed: bool,
    pub tx_hash: Option<String>,
    pub receipt: TxReceipt,
    pub completed_at: DateTime<Utc>,
}

/// An upload whose bytes are finalized but not yet indexed
///
/// Hand it back to `StorageContext::resume` to finish registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpload {
    pub dataset: Dataset,
    pub info: PieceCidInfo,
    pub server_piece_id: String,
    pub metadata: Metadata,
}

impl PendingUpload {
    pub fn piece_cid(&self) -> &PieceCid {
        &self.info.piece_cid
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Complete(UploadResult),
    NotYetIndexed(PendingUpload),
}

impl UploadOutcome {
    pub fn piece_cid(&self) -> &PieceCid {
        match self {
            UploadOutcome::Complete(result) => &result.piece_cid,
            UploadOutcome::NotYetIndexed(pending) => pending.piece_cid(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, UploadOutcome::Complete(_))
    }

    pub fn into_complete(self) -> Option<UploadResult> {
        match self {
            UploadOutcome::Complete(result) => Some(result),
            UploadOutcome::NotYetIndexed(_) => None,
        }
    }
}

/// How `StorageManager::create_context` picks a provider and dataset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextOptions {
    pub provider_id: Option<ProviderId>,
    pub dataset_id: Option<DatasetId>,
    /// Defaults to one past the client's existing dataset count
    pub client_dataset_id: Option<u64>,
    pub metadata: Metadata,
    pub with_cdn: bool,
    /// Skip reuse and always create a new dataset
    pub force_create: bool,
    pub exclude_providers: BTreeSet<ProviderId>,
}

impl ContextOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provider_id(mut self, provider_id: ProviderId) -> Self {
        self.provider_id = Some(provider_id);
        self
    }

    pub fn dataset_id(mut self, dataset_id: DatasetId) -> Self {
        self.dataset_id = Some(dataset_id);
        self
    }

    pub fn client_dataset_id(mut self, client_dataset_id: u64) -> Self {
        self.client_dataset_id = Some(client_dataset_id);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_cdn(mut self, with_cdn: bool) -> Self {
        self.with_cdn = with_cdn;
        self
    }

    pub fn force_create(mut self) -> Self {
        self.force_create = true;
        self
    }

    pub fn exclude_provider(mut self, provider_id: ProviderId) -> Self {
        self.exclude_providers.insert(provider_id);
        self
    }
}
