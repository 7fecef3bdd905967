//! Upload orchestration against one provider and one dataset

use super::pieces::{check_unique, PieceAdder};
use super::registrar::DatasetRegistrar;
use super::types::{PendingUpload, UploadOutcome, UploadResult};
use super::upload::UploadSession;
use crate::chain::{ChainIndex, PayloadSigner};
use crate::commp::{CommitmentCalculator, PieceCidInfo, StreamCommp};
use crate::config::ClientConfig;
use crate::error::{Result, StorageError};
use crate::pdp::{FinalizeResult, PdpClient};
use crate::transport::Transport;
use crate::types::{Capability, Dataset, DatasetId, Metadata, PieceCid, ProviderRecord};
use bytesize::ByteSize;
use chrono::Utc;
use futures::lock::Mutex;
use log::{debug, info};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Builder for [`StorageContext`]
pub struct StorageContextBuilder {
    provider: ProviderRecord,
    transport: Arc<dyn Transport>,
    chain: Arc<dyn ChainIndex>,
    signer: Arc<dyn PayloadSigner>,
    commp: Option<Arc<dyn CommitmentCalculator>>,
    config: ClientConfig,
    client_dataset_id: u64,
    metadata: Metadata,
    dataset: Option<Dataset>,
}

impl StorageContextBuilder {
    pub fn commitment(mut self, commp: Arc<dyn CommitmentCalculator>) -> Self {
        self.commp = Some(commp);
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_dataset_id(mut self, client_dataset_id: u64) -> Self {
        self.client_dataset_id = client_dataset_id;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Start from an already resolved dataset; no creation call will be made
    pub fn dataset(mut self, dataset: Dataset) -> Self {
        self.client_dataset_id = dataset.client_dataset_id;
        self.metadata = dataset.metadata.clone();
        self.dataset = Some(dataset);
        self
    }

    pub fn build(self) -> Result<StorageContext> {
        self.config.validate()?;

        if let Some(dataset) = &self.dataset {
            if dataset.provider_id != self.provider.provider_id {
                return Err(StorageError::validation(
                    "dataset",
                    format!(
                        "dataset {} belongs to provider {}, not {}",
                        dataset.dataset_id, dataset.provider_id, self.provider.provider_id
                    ),
                ));
            }
        }

        let pdp = PdpClient::new(
            self.transport,
            self.provider.endpoint.clone(),
            self.config.clone(),
        );
        let registrar = DatasetRegistrar::new(
            pdp.clone(),
            self.provider.clone(),
            self.chain.clone(),
            self.signer.clone(),
        );
        let adder = PieceAdder::new(
            pdp.clone(),
            self.signer.clone(),
            self.provider.has_capability(Capability::BatchAdd),
        );
        let commp: Arc<dyn CommitmentCalculator> = match self.commp {
            Some(commp) => commp,
            None => Arc::new(StreamCommp::new(&self.config)),
        };

        Ok(StorageContext {
            provider: self.provider,
            pdp,
            registrar,
            adder,
            chain: self.chain,
            signer: self.signer,
            commp,
            config: self.config,
            client_dataset_id: self.client_dataset_id,
            metadata: self.metadata,
            dataset: Mutex::new(self.dataset),
        })
    }
}

/// Uploads payloads into one dataset on one provider
///
/// The dataset is resolved on first use and cached for the lifetime of the
/// context. Every step derives its idempotency key from the payload and
/// metadata, so calling `upload` again after any failure is safe.
pub struct StorageContext {
    provider: ProviderRecord,
    pdp: PdpClient,
    registrar: DatasetRegistrar,
    adder: PieceAdder,
    chain: Arc<dyn ChainIndex>,
    signer: Arc<dyn PayloadSigner>,
    commp: Arc<dyn CommitmentCalculator>,
    config: ClientConfig,
    client_dataset_id: u64,
    metadata: Metadata,
    dataset: Mutex<Option<Dataset>>,
}

impl StorageContext {
    pub fn builder(
        provider: ProviderRecord,
        transport: Arc<dyn Transport>,
        chain: Arc<dyn ChainIndex>,
        signer: Arc<dyn PayloadSigner>,
    ) -> StorageContextBuilder {
        StorageContextBuilder {
            provider,
            transport,
            chain,
            signer,
            commp: None,
            config: ClientConfig::default(),
            client_dataset_id: 1,
            metadata: Metadata::new(),
            dataset: None,
        }
    }

    pub fn provider(&self) -> &ProviderRecord {
        &self.provider
    }

    pub fn client_dataset_id(&self) -> u64 {
        self.client_dataset_id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Dataset id if it has been resolved already
    pub async fn dataset_id(&self) -> Option<DatasetId> {
        self.dataset.lock().await.as_ref().map(|d| d.dataset_id)
    }

    /// Resolve the context's dataset, creating it on first use
    pub async fn dataset(&self) -> Result<Dataset> {
        let mut cached = self.dataset.lock().await;
        if let Some(dataset) = cached.as_ref() {
            return Ok(dataset.clone());
        }

        let dataset = self
            .registrar
            .create_or_reuse(
                &self.signer.client_address(),
                self.provider.provider_id,
                self.client_dataset_id,
                &self.metadata,
            )
            .await?;
        *cached = Some(dataset.clone());
        Ok(dataset)
    }

    pub fn validate_size(&self, size: u64) -> Result<()> {
        if size < self.config.min_upload_size {
            return Err(StorageError::validation(
                "data",
                format!(
                    "payload of {} is below the minimum of {}",
                    ByteSize(size),
                    ByteSize(self.config.min_upload_size)
                ),
            ));
        }
        if size > self.config.max_upload_size {
            return Err(StorageError::validation(
                "data",
                format!(
                    "payload of {} exceeds the maximum of {}",
                    ByteSize(size),
                    ByteSize(self.config.max_upload_size)
                ),
            ));
        }
        if !self.provider.supports_piece_size(size) {
            return Err(StorageError::validation(
                "data",
                format!(
                    "provider {} does not accept pieces of {}",
                    self.provider.provider_id,
                    ByteSize(size)
                ),
            ));
        }
        Ok(())
    }

    /// Upload one payload and register it in the dataset
    ///
    /// Returns [`UploadOutcome::NotYetIndexed`] when the provider has not
    /// indexed the piece within the configured timeout.
    pub async fn upload(&self, data: &[u8], metadata: Metadata) -> Result<UploadOutcome> {
        self.validate_size(data.len() as u64)?;
        let info = self.commp.compute(data)?;
        let dataset = self.dataset().await?;

        let finalized = self.transfer(&dataset, data, &info, &metadata).await?;
        let pending = PendingUpload {
            dataset,
            info,
            server_piece_id: finalized.server_piece_id,
            metadata,
        };
        self.complete(pending, self.config.indexing_timeout_duration())
            .await
    }

    /// Poll again for a pending upload and finish its registration
    pub async fn resume(&self, pending: PendingUpload) -> Result<UploadOutcome> {
        self.check_pending(&pending).await?;
        self.complete(pending, self.config.indexing_timeout_duration())
            .await
    }

    /// Upload several payloads, registering all indexed pieces in one batch
    ///
    /// Outcomes are returned in input order.
    pub async fn upload_many(
        &self,
        items: &[(Vec<u8>, Metadata)],
    ) -> Result<Vec<UploadOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        for (data, _) in items {
            self.validate_size(data.len() as u64)?;
        }
        let infos = items
            .iter()
            .map(|(data, _)| self.commp.compute(data))
            .collect::<Result<Vec<PieceCidInfo>>>()?;
        let pieces: Vec<(PieceCid, Metadata)> = infos
            .iter()
            .zip(items)
            .map(|(info, (_, metadata))| (info.piece_cid.clone(), metadata.clone()))
            .collect();
        check_unique(&pieces)?;
        let dataset = self.dataset().await?;

        let mut pending = Vec::with_capacity(items.len());
        for ((data, metadata), info) in items.iter().zip(infos) {
            let finalized = self.transfer(&dataset, data, &info, metadata).await?;
            pending.push(PendingUpload {
                dataset: dataset.clone(),
                info,
                server_piece_id: finalized.server_piece_id,
                metadata: metadata.clone(),
            });
        }

        // One indexing budget shared by the whole batch
        let deadline = Instant::now() + self.config.indexing_timeout_duration();
        let mut indexed = Vec::with_capacity(pending.len());
        for upload in &pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            indexed.push(
                self.pdp
                    .poll_indexed(&upload.server_piece_id, remaining)
                    .await?,
            );
        }

        let ready: Vec<&PendingUpload> = pending
            .iter()
            .zip(&indexed)
            .filter(|(_, indexed)| **indexed)
            .map(|(upload, _)| upload)
            .collect();
        let registered = if ready.is_empty() {
            Vec::new()
        } else {
            self.register(&dataset, &ready).await?
        };

        let mut results = registered.into_iter();
        let mut outcomes = Vec::with_capacity(pending.len());
        for (upload, indexed) in pending.into_iter().zip(indexed) {
            if indexed {
                let result = results.next().ok_or_else(|| {
                    StorageError::validation("items", "batch registration lost a result")
                })?;
                outcomes.push(UploadOutcome::Complete(result));
            } else {
                outcomes.push(UploadOutcome::NotYetIndexed(upload));
            }
        }
        Ok(outcomes)
    }

    /// Fetch a piece from this context's provider
    pub async fn download(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        self.pdp.download_piece(piece_cid, None).await
    }

    /// Whether this context's provider already stores the piece
    pub async fn has_piece(&self, piece_cid: &PieceCid) -> Result<bool> {
        self.pdp.has_piece(piece_cid).await
    }

    async fn check_pending(&self, pending: &PendingUpload) -> Result<()> {
        let dataset = self.dataset().await?;
        if pending.dataset.dataset_id != dataset.dataset_id {
            return Err(StorageError::validation(
                "pending",
                format!(
                    "upload belongs to dataset {}, this context uses {}",
                    pending.dataset.dataset_id, dataset.dataset_id
                ),
            ));
        }
        Ok(())
    }

    async fn transfer(
        &self,
        dataset: &Dataset,
        data: &[u8],
        info: &PieceCidInfo,
        metadata: &Metadata,
    ) -> Result<FinalizeResult> {
        let mut session = UploadSession::new(dataset.dataset_id, info, metadata);
        debug!(
            "Uploading {} ({}) to dataset {} (key {})",
            info.piece_cid,
            ByteSize(info.payload_size),
            dataset.dataset_id,
            session.key()
        );
        let finalized = session.run(&self.pdp, data, info).await?;
        info!(
            "Upload of {} finalized as piece {}",
            info.piece_cid, finalized.server_piece_id
        );
        Ok(finalized)
    }

    async fn complete(&self, pending: PendingUpload, timeout: Duration) -> Result<UploadOutcome> {
        let indexed = self
            .pdp
            .poll_indexed(&pending.server_piece_id, timeout)
            .await?;
        if !indexed {
            info!(
                "Piece {} not indexed within {:?}; returning pending upload",
                pending.info.piece_cid, timeout
            );
            return Ok(UploadOutcome::NotYetIndexed(pending));
        }

        let dataset = pending.dataset.clone();
        let mut results = self.register(&dataset, &[&pending]).await?;
        results
            .pop()
            .map(UploadOutcome::Complete)
            .ok_or_else(|| {
                StorageError::validation("pending", "registration produced no result")
            })
    }

    /// Add indexed pieces to the dataset and confirm each on chain
    async fn register(
        &self,
        dataset: &Dataset,
        uploads: &[&PendingUpload],
    ) -> Result<Vec<UploadResult>> {
        let pieces: Vec<(PieceCid, Metadata)> = uploads
            .iter()
            .map(|u| (u.info.piece_cid.clone(), u.metadata.clone()))
            .collect();
        let added = self.adder.add(dataset, &pieces).await?;
        let payload = self
            .signer
            .sign_add_pieces(dataset.client_dataset_id, &pieces)?;

        let mut results = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let piece_cid = &upload.info.piece_cid;
            let receipt = self
                .chain
                .confirm_piece_onchain(dataset.dataset_id, piece_cid, &payload)
                .await?;
            info!(
                "Piece {} confirmed in dataset {} (tx {})",
                piece_cid, dataset.dataset_id, receipt.tx_hash
            );
            results.push(UploadResult {
                piece_cid: piece_cid.clone(),
                size: upload.info.payload_size,
                dataset_id: dataset.dataset_id,
                provider_id: self.provider.provider_id,
                server_piece_id: upload.server_piece_id.clone(),
                already_existed: added.already_existing.contains(piece_cid),
                tx_hash: added.tx_hash.clone(),
                receipt,
                completed_at: Utc::now(),
            });
        }
        Ok(results)
    }
}
