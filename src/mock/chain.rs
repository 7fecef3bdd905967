//! In-memory chain index

use super::lock;
use crate::chain::{ChainIndex, DatasetInfo, SignedPayload, TxReceipt};
use crate::error::{Result, StorageError};
use crate::retrieval::RetrievalCandidate;
use crate::types::{DatasetId, Metadata, PieceCid};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct ChainState {
    next_dataset_id: DatasetId,
    datasets: BTreeMap<DatasetId, (DatasetInfo, Metadata)>,
    holders: BTreeMap<String, Vec<RetrievalCandidate>>,
    receipts: HashMap<(DatasetId, String), TxReceipt>,
    next_block: u64,
}

/// Chain state shared by every mock provider on a [`MockNetwork`](super::MockNetwork)
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next unused dataset id; ids are unique across providers
    pub fn allocate_dataset_id(&self) -> DatasetId {
        let mut state = lock(&self.state);
        state.next_dataset_id += 1;
        state.next_dataset_id
    }

    pub fn register_dataset(&self, info: DatasetInfo, metadata: Metadata) {
        let mut state = lock(&self.state);
        state.next_dataset_id = state.next_dataset_id.max(info.dataset_id);
        state.datasets.insert(info.dataset_id, (info, metadata));
    }

    pub fn record_pieces(&self, dataset_id: DatasetId, count: u64) {
        if let Some((info, _)) = lock(&self.state).datasets.get_mut(&dataset_id) {
            info.active_piece_count += count;
        }
    }

    pub fn terminate_dataset(&self, dataset_id: DatasetId) {
        if let Some((info, _)) = lock(&self.state).datasets.get_mut(&dataset_id) {
            info.live = false;
        }
    }

    pub fn dataset(&self, dataset_id: DatasetId) -> Option<DatasetInfo> {
        lock(&self.state)
            .datasets
            .get(&dataset_id)
            .map(|(info, _)| info.clone())
    }

    /// Record a holder directly, in the order holders should be tried
    pub fn add_holder(&self, piece_cid: &PieceCid, candidate: RetrievalCandidate) {
        let mut state = lock(&self.state);
        let holders = state.holders.entry(piece_cid.to_string()).or_default();
        if !holders.contains(&candidate) {
            holders.push(candidate);
        }
    }

    /// Number of distinct piece confirmations recorded
    pub fn confirmations(&self) -> usize {
        lock(&self.state).receipts.len()
    }
}

#[async_trait]
impl ChainIndex for MockChain {
    async fn holders_of(&self, piece_cid: &PieceCid) -> Result<Vec<RetrievalCandidate>> {
        Ok(lock(&self.state)
            .holders
            .get(piece_cid.as_str())
            .cloned()
            .unwrap_or_default())
    }

    async fn dataset_metadata(&self, dataset_id: DatasetId) -> Result<Metadata> {
        lock(&self.state)
            .datasets
            .get(&dataset_id)
            .map(|(_, metadata)| metadata.clone())
            .ok_or_else(|| {
                StorageError::chain("dataset_metadata", format!("unknown dataset {}", dataset_id))
            })
    }

    async fn client_datasets(&self, client_address: &str) -> Result<Vec<DatasetInfo>> {
        Ok(lock(&self.state)
            .datasets
            .values()
            .filter(|(info, _)| info.payer == client_address)
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn confirm_piece_onchain(
        &self,
        dataset_id: DatasetId,
        piece_cid: &PieceCid,
        signed_payload: &SignedPayload,
    ) -> Result<TxReceipt> {
        let mut state = lock(&self.state);
        let provider_id = state
            .datasets
            .get(&dataset_id)
            .map(|(info, _)| info.provider_id)
            .ok_or_else(|| {
                StorageError::chain(
                    "confirm_piece_onchain",
                    format!("unknown dataset {}", dataset_id),
                )
            })?;

        let receipt_key = (dataset_id, piece_cid.to_string());
        if let Some(receipt) = state.receipts.get(&receipt_key) {
            return Ok(receipt.clone());
        }

        let mut hasher = Sha256::new();
        hasher.update(dataset_id.to_be_bytes());
        hasher.update(piece_cid.as_str().as_bytes());
        hasher.update(signed_payload.as_str().as_bytes());
        state.next_block += 1;
        let receipt = TxReceipt {
            tx_hash: format!("0x{}", hex::encode(hasher.finalize())),
            block_number: Some(state.next_block),
            confirmed_at: Utc::now(),
        };
        state.receipts.insert(receipt_key, receipt.clone());

        let candidate = RetrievalCandidate {
            dataset_id,
            provider_id,
        };
        let holders = state.holders.entry(piece_cid.to_string()).or_default();
        if !holders.contains(&candidate) {
            holders.push(candidate);
        }
        Ok(receipt)
    }
}
