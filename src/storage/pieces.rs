//! Idempotent piece registration

use super::types::AddResult;
use crate::chain::PayloadSigner;
use crate::error::{Result, StorageError};
use crate::idempotency::{operations, IdempotencyKey};
use crate::pdp::{AddPiecesRequest, PdpClient, PieceEntry};
use crate::types::{Dataset, DatasetId, Metadata, Phase, PieceCid};
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Adds pieces to a dataset so that replays never double-add
///
/// Every piece gets its own key. With batching, pieces the provider reports
/// as present are moved to `already_existing` and the rest are resubmitted;
/// without it, pieces are sent one request each.
#[derive(Clone)]
pub struct PieceAdder {
    pdp: PdpClient,
    signer: Arc<dyn PayloadSigner>,
    batching: bool,
}

impl PieceAdder {
    pub fn new(pdp: PdpClient, signer: Arc<dyn PayloadSigner>, batching: bool) -> Self {
        Self {
            pdp,
            signer,
            batching,
        }
    }

    pub fn piece_key(
        dataset_id: DatasetId,
        piece_cid: &PieceCid,
        metadata: &Metadata,
    ) -> IdempotencyKey {
        IdempotencyKey::derive(
            operations::ADD_PIECE,
            &[&dataset_id.to_string(), piece_cid.as_str()],
            Some(metadata),
        )
    }

    fn batch_key(dataset_id: DatasetId, entries: &[PieceEntry]) -> IdempotencyKey {
        let mut piece_keys: Vec<&str> =
            entries.iter().map(|e| e.idempotency_key.as_str()).collect();
        piece_keys.sort_unstable();

        let dataset = dataset_id.to_string();
        let mut args = vec![dataset.as_str()];
        args.extend(piece_keys);
        IdempotencyKey::derive(operations::ADD_PIECES_BATCH, &args, None)
    }

    pub async fn add(
        &self,
        dataset: &Dataset,
        pieces: &[(PieceCid, Metadata)],
    ) -> Result<AddResult> {
        let pieces = dedupe(pieces)?;
        if self.batching {
            self.add_batched(dataset, pieces).await
        } else {
            self.add_sequential(dataset, pieces).await
        }
    }

    fn entries(&self, dataset_id: DatasetId, pieces: &[(PieceCid, Metadata)]) -> Vec<PieceEntry> {
        pieces
            .iter()
            .map(|(cid, metadata)| PieceEntry {
                piece_cid: cid.clone(),
                metadata: metadata.clone(),
                idempotency_key: Self::piece_key(dataset_id, cid, metadata),
            })
            .collect()
    }

    async fn submit(
        &self,
        dataset: &Dataset,
        pieces: &[(PieceCid, Metadata)],
        key: &IdempotencyKey,
        entries: Vec<PieceEntry>,
    ) -> Result<Option<String>> {
        let extra_data = self
            .signer
            .sign_add_pieces(dataset.client_dataset_id, pieces)?;
        let request = AddPiecesRequest {
            pieces: entries,
            extra_data: extra_data.0,
        };
        let response = self
            .pdp
            .add_pieces(dataset.dataset_id, &request, key)
            .await?;
        Ok(response.tx_hash)
    }

    async fn add_batched(
        &self,
        dataset: &Dataset,
        mut remaining: Vec<(PieceCid, Metadata)>,
    ) -> Result<AddResult> {
        let mut result = AddResult::default();

        while !remaining.is_empty() {
            let entries = self.entries(dataset.dataset_id, &remaining);
            let key = Self::batch_key(dataset.dataset_id, &entries);
            debug!(
                "Adding {} pieces to dataset {} (key {})",
                remaining.len(),
                dataset.dataset_id,
                key
            );

            let submitted = self.submit(dataset, &remaining, &key, entries).await;
            match submitted {
                Ok(tx_hash) => {
                    result.added.extend(remaining.drain(..).map(|(cid, _)| cid));
                    result.tx_hash = tx_hash;
                }
                Err(StorageError::AlreadyExists {
                    existing_pieces, ..
                }) => {
                    let existing: BTreeSet<&str> =
                        existing_pieces.iter().map(String::as_str).collect();
                    let before = remaining.len();

                    if existing.is_empty() && before == 1 {
                        // A lone piece conflicting can only mean that piece
                        result
                            .already_existing
                            .extend(remaining.drain(..).map(|(cid, _)| cid));
                        break;
                    }

                    let (present, missing): (Vec<_>, Vec<_>) = remaining
                        .into_iter()
                        .partition(|(cid, _)| existing.contains(cid.as_str()));
                    result
                        .already_existing
                        .extend(present.into_iter().map(|(cid, _)| cid));
                    remaining = missing;

                    if remaining.len() == before {
                        return Err(StorageError::transient(
                            Phase::AddPieces,
                            Some(409),
                            Some(key),
                            "provider reported a conflict without naming any submitted piece",
                        ));
                    }
                    debug!(
                        "{} pieces already present in dataset {}, resubmitting {}",
                        before - remaining.len(),
                        dataset.dataset_id,
                        remaining.len()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Dataset {}: {} pieces added, {} already present",
            dataset.dataset_id,
            result.added.len(),
            result.already_existing.len()
        );
        Ok(result)
    }

    async fn add_sequential(
        &self,
        dataset: &Dataset,
        pieces: Vec<(PieceCid, Metadata)>,
    ) -> Result<AddResult> {
        let mut result = AddResult::default();

        for piece in pieces {
            let single = std::slice::from_ref(&piece);
            let entries = self.entries(dataset.dataset_id, single);
            let key = entries[0].idempotency_key.clone();

            let submitted = self.submit(dataset, single, &key, entries).await;
            match submitted {
                Ok(tx_hash) => {
                    result.added.insert(piece.0);
                    if tx_hash.is_some() {
                        result.tx_hash = tx_hash;
                    }
                }
                Err(StorageError::AlreadyExists { .. }) => {
                    debug!("Piece {} already in dataset {}", piece.0, dataset.dataset_id);
                    result.already_existing.insert(piece.0);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Dataset {}: {} pieces added, {} already present",
            dataset.dataset_id,
            result.added.len(),
            result.already_existing.len()
        );
        Ok(result)
    }
}

/// Collapse repeated pieces; the same piece with two metadata maps is ambiguous
/// Reject a piece listed twice with different metadata
pub(crate) fn check_unique(pieces: &[(PieceCid, Metadata)]) -> Result<()> {
    dedupe(pieces).map(|_| ())
}

fn dedupe(pieces: &[(PieceCid, Metadata)]) -> Result<Vec<(PieceCid, Metadata)>> {
    if pieces.is_empty() {
        return Err(StorageError::validation(
            "pieces",
            "at least one piece is required",
        ));
    }

    let mut unique: Vec<(PieceCid, Metadata)> = Vec::with_capacity(pieces.len());
    for (cid, metadata) in pieces {
        match unique.iter().find(|(seen, _)| seen == cid) {
            Some((_, seen_metadata)) if seen_metadata != metadata => {
                return Err(StorageError::validation(
                    "pieces",
                    format!("piece {} listed twice with different metadata", cid),
                ));
            }
            Some(_) => {}
            None => unique.push((cid.clone(), metadata.clone())),
        }
    }
    Ok(unique)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CID_A: &str = "bafkreihdwdcefgh4dqkjv67uzcmw7ojee6xedzdetojuzjevtenxquvyku";

    #[test]
    fn test_piece_key_depends_on_dataset() {
        let cid = PieceCid::parse(CID_A).unwrap();
        let metadata = Metadata::new();
        assert_ne!(
            PieceAdder::piece_key(1, &cid, &metadata),
            PieceAdder::piece_key(2, &cid, &metadata)
        );
    }

    #[test]
    fn test_dedupe() {
        let cid = PieceCid::parse(CID_A).unwrap();
        let metadata = Metadata::new();

        let unique = dedupe(&[
            (cid.clone(), metadata.clone()),
            (cid.clone(), metadata.clone()),
        ])
        .unwrap();
        assert_eq!(unique.len(), 1);

        let mut other = Metadata::new();
        other.insert("k".to_string(), "v".to_string());
        assert!(dedupe(&[(cid.clone(), metadata), (cid, other)]).is_err());
        assert!(dedupe(&[]).is_err());
    }
}
