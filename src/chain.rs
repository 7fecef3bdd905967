//! Chain-side collaborators
//!
//! The chain is the source of truth for which datasets exist, what metadata
//! they carry and which providers hold a piece. Signing is delegated too; the
//! client never handles key material.

use crate::error::Result;
use crate::retrieval::types::RetrievalCandidate;
use crate::types::{DatasetId, Metadata, PieceCid, ProviderId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dataset as recorded on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub dataset_id: DatasetId,
    pub provider_id: ProviderId,
    pub client_dataset_id: u64,
    pub payer: String,
    /// False once the dataset has been terminated
    pub live: bool,
    pub active_piece_count: u64,
}

/// Receipt for an on-chain piece confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    pub confirmed_at: DateTime<Utc>,
}

/// Hex-encoded signed authorization forwarded as `extraData`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedPayload(pub String);

impl SignedPayload {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Read and confirm access to chain state
#[async_trait]
pub trait ChainIndex: Send + Sync {
    /// Every (dataset, provider) pair recorded as holding the piece
    async fn holders_of(&self, piece_cid: &PieceCid) -> Result<Vec<RetrievalCandidate>>;

    /// Metadata stored for a dataset
    async fn dataset_metadata(&self, dataset_id: DatasetId) -> Result<Metadata>;

    /// Datasets paid for by `client_address`
    async fn client_datasets(&self, client_address: &str) -> Result<Vec<DatasetInfo>>;

    /// Wait for the piece addition to be confirmed
    async fn confirm_piece_onchain(
        &self,
        dataset_id: DatasetId,
        piece_cid: &PieceCid,
        signed_payload: &SignedPayload,
    ) -> Result<TxReceipt>;
}

/// Produces signed authorizations for provider calls
///
/// Signatures must be deterministic for identical inputs, so that a replayed
/// request carries the same payload and the provider can recognise it.
pub trait PayloadSigner: Send + Sync {
    fn client_address(&self) -> String;

    fn sign_create_dataset(
        &self,
        client_dataset_id: u64,
        payee: &str,
        metadata: &Metadata,
    ) -> Result<SignedPayload>;

    fn sign_add_pieces(
        &self,
        client_dataset_id: u64,
        pieces: &[(PieceCid, Metadata)],
    ) -> Result<SignedPayload>;
}
