//! Provider selection and dataset reuse

use super::context::{StorageContext, StorageContextBuilder};
use super::types::{ContextOptions, UploadOutcome};
use crate::chain::{ChainIndex, DatasetInfo, PayloadSigner};
use crate::commp::{CommitmentCalculator, StreamCommp};
use crate::config::ClientConfig;
use crate::error::{Result, StorageError};
use crate::pdp::PdpClient;
use crate::retrieval::{
    CapabilityFilter, ChainRetriever, PieceRetriever, ProviderDiscovery, ProviderRegistry,
};
use crate::transport::Transport;
use crate::types::{
    combine_metadata, metadata_matches, Capability, Dataset, Metadata, PieceCid, ProviderRecord,
};
use log::{debug, info, warn};
use std::sync::Arc;

/// Entry point tying the collaborators together
///
/// Builds [`StorageContext`]s for uploads and a [`ChainRetriever`] for
/// downloads, all sharing one transport.
#[derive(Clone)]
pub struct StorageManager {
    transport: Arc<dyn Transport>,
    chain: Arc<dyn ChainIndex>,
    registry: Arc<dyn ProviderRegistry>,
    signer: Arc<dyn PayloadSigner>,
    commp: Option<Arc<dyn CommitmentCalculator>>,
    fallback: Option<Arc<dyn PieceRetriever>>,
    config: ClientConfig,
}

impl StorageManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        chain: Arc<dyn ChainIndex>,
        registry: Arc<dyn ProviderRegistry>,
        signer: Arc<dyn PayloadSigner>,
    ) -> Self {
        Self {
            transport,
            chain,
            registry,
            signer,
            commp: None,
            fallback: None,
            config: ClientConfig::from_env(),
        }
    }

    pub fn with_commitment(mut self, commp: Arc<dyn CommitmentCalculator>) -> Self {
        self.commp = Some(commp);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn PieceRetriever>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn client_address(&self) -> String {
        self.signer.client_address()
    }

    pub fn discovery(&self) -> ProviderDiscovery {
        ProviderDiscovery::new(self.registry.clone())
    }

    pub fn retriever(&self) -> ChainRetriever {
        let retriever = ChainRetriever::new(
            self.chain.clone(),
            self.discovery(),
            self.transport.clone(),
            self.config.clone(),
        );
        match &self.fallback {
            Some(fallback) => retriever.with_fallback(fallback.clone()),
            None => retriever,
        }
    }

    /// Fetch a piece from any provider holding it
    pub async fn download(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        self.retriever().fetch(piece_cid).await
    }

    /// Datasets paid for by this client
    pub async fn find_datasets(&self) -> Result<Vec<DatasetInfo>> {
        self.chain.client_datasets(&self.client_address()).await
    }

    /// Pick a provider and dataset for `options` and build a context for it
    ///
    /// A pinned dataset is used as is. Otherwise a live dataset with exactly
    /// the requested metadata on a usable, reachable provider is reused, and
    /// failing that a new one is planned on the best-ranked reachable provider.
    /// New datasets are created lazily by the context.
    pub async fn create_context(&self, options: ContextOptions) -> Result<StorageContext> {
        self.config.validate()?;
        let metadata = combine_metadata(options.metadata.clone(), options.with_cdn);
        let client_address = self.client_address();
        let existing = self.chain.client_datasets(&client_address).await?;

        if let Some(dataset_id) = options.dataset_id {
            return self
                .pinned_dataset(dataset_id, &client_address, &existing, &metadata, &options)
                .await;
        }

        if !options.force_create {
            if let Some(context) = self
                .reusable_dataset(&client_address, &existing, &metadata, &options)
                .await?
            {
                return Ok(context);
            }
        }

        let provider = match options.provider_id {
            Some(provider_id) => self.usable_provider(provider_id).await?,
            None => self.select_provider(&options).await?,
        };
        let client_dataset_id = options
            .client_dataset_id
            .unwrap_or(existing.len() as u64 + 1);
        info!(
            "Planning new dataset {} on provider {}",
            client_dataset_id, provider.provider_id
        );

        self.context_builder(provider)
            .client_dataset_id(client_dataset_id)
            .metadata(metadata)
            .build()
    }

    /// Contexts on up to `count` distinct providers, for keeping copies
    ///
    /// Each selected provider is excluded from the following selections. A
    /// pinned provider or dataset applies to the first context only. When no
    /// further provider qualifies the contexts built so far are returned; the
    /// call fails only if not even the first one can be built.
    pub async fn create_contexts(
        &self,
        count: usize,
        options: ContextOptions,
    ) -> Result<Vec<StorageContext>> {
        if count == 0 {
            return Err(StorageError::validation(
                "count",
                "at least one context is required",
            ));
        }

        let mut contexts: Vec<StorageContext> = Vec::with_capacity(count);
        let mut next = options;
        while contexts.len() < count {
            match self.create_context(next.clone()).await {
                Ok(context) => {
                    next.exclude_providers.insert(context.provider().provider_id);
                    next.provider_id = None;
                    next.dataset_id = None;
                    contexts.push(context);
                }
                Err(e) if !contexts.is_empty() => {
                    warn!(
                        "Only {} of {} providers available for replicas: {}",
                        contexts.len(),
                        count,
                        e
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(contexts)
    }

    /// Store the same payload through every context, in order
    ///
    /// Stops at the first failure; copies already stored stay in place and a
    /// repeated call completes the rest without duplicating them.
    pub async fn upload_multi(
        &self,
        contexts: &[StorageContext],
        data: &[u8],
        metadata: Metadata,
    ) -> Result<Vec<UploadOutcome>> {
        if contexts.is_empty() {
            return Err(StorageError::validation(
                "contexts",
                "at least one context is required",
            ));
        }

        let mut outcomes = Vec::with_capacity(contexts.len());
        for context in contexts {
            outcomes.push(context.upload(data, metadata.clone()).await?);
        }
        info!(
            "Stored {} copies of {} bytes",
            outcomes.len(),
            data.len()
        );
        Ok(outcomes)
    }

    fn context_builder(&self, provider: ProviderRecord) -> StorageContextBuilder {
        let builder = StorageContext::builder(
            provider,
            self.transport.clone(),
            self.chain.clone(),
            self.signer.clone(),
        )
        .config(self.config.clone());
        let commp: Arc<dyn CommitmentCalculator> = match &self.commp {
            Some(commp) => commp.clone(),
            None => Arc::new(StreamCommp::new(&self.config)),
        };
        builder.commitment(commp)
    }

    async fn pinned_dataset(
        &self,
        dataset_id: u64,
        client_address: &str,
        existing: &[DatasetInfo],
        metadata: &Metadata,
        options: &ContextOptions,
    ) -> Result<StorageContext> {
        let info = existing
            .iter()
            .find(|d| d.dataset_id == dataset_id && d.live)
            .ok_or_else(|| {
                StorageError::validation(
                    "dataset_id",
                    format!("no live dataset {} for client {}", dataset_id, client_address),
                )
            })?;

        if let Some(provider_id) = options.provider_id {
            if provider_id != info.provider_id {
                return Err(StorageError::validation(
                    "provider_id",
                    format!(
                        "dataset {} is held by provider {}, not {}",
                        dataset_id, info.provider_id, provider_id
                    ),
                ));
            }
        }

        let stored = self.chain.dataset_metadata(dataset_id).await?;
        if !metadata.is_empty() && !metadata_matches(&stored, metadata) {
            return Err(StorageError::MetadataConflict {
                dataset_id,
                requested: metadata.clone(),
                stored,
            });
        }

        let provider = self.usable_provider(info.provider_id).await?;
        self.context_builder(provider)
            .dataset(Dataset {
                dataset_id,
                client_dataset_id: info.client_dataset_id,
                provider_id: info.provider_id,
                client_address: client_address.to_string(),
                metadata: stored,
                is_new: false,
            })
            .build()
    }

    async fn reusable_dataset(
        &self,
        client_address: &str,
        existing: &[DatasetInfo],
        metadata: &Metadata,
        options: &ContextOptions,
    ) -> Result<Option<StorageContext>> {
        let mut candidates: Vec<&DatasetInfo> = existing
            .iter()
            .filter(|d| d.live)
            .filter(|d| options.provider_id.map_or(true, |id| id == d.provider_id))
            .filter(|d| !options.exclude_providers.contains(&d.provider_id))
            .collect();
        // Prefer the fullest dataset, then the oldest
        candidates.sort_by_key(|d| (std::cmp::Reverse(d.active_piece_count), d.dataset_id));

        for info in candidates {
            let stored = self.chain.dataset_metadata(info.dataset_id).await?;
            if !metadata_matches(&stored, metadata) {
                continue;
            }

            let provider = match self.discovery().resolve(info.provider_id).await? {
                Some(provider) if provider.is_usable() => provider,
                _ => {
                    debug!(
                        "Dataset {} matches but provider {} is not usable",
                        info.dataset_id, info.provider_id
                    );
                    continue;
                }
            };
            if !self.ping(&provider).await {
                warn!(
                    "Provider {} did not answer ping, not reusing dataset {}",
                    provider.provider_id, info.dataset_id
                );
                continue;
            }

            info!(
                "Reusing dataset {} on provider {}",
                info.dataset_id, provider.provider_id
            );
            let context = self
                .context_builder(provider)
                .dataset(Dataset {
                    dataset_id: info.dataset_id,
                    client_dataset_id: info.client_dataset_id,
                    provider_id: info.provider_id,
                    client_address: client_address.to_string(),
                    metadata: stored,
                    is_new: false,
                })
                .build()?;
            return Ok(Some(context));
        }
        Ok(None)
    }

    async fn usable_provider(&self, provider_id: u64) -> Result<ProviderRecord> {
        match self.discovery().resolve(provider_id).await? {
            Some(provider) if provider.is_usable() => Ok(provider),
            Some(_) => Err(StorageError::registry(format!(
                "provider {} is inactive or unhealthy",
                provider_id
            ))),
            None => Err(StorageError::registry(format!(
                "provider {} is not registered",
                provider_id
            ))),
        }
    }

    async fn select_provider(&self, options: &ContextOptions) -> Result<ProviderRecord> {
        let mut filter = CapabilityFilter::new();
        for provider_id in &options.exclude_providers {
            filter = filter.exclude(*provider_id);
        }
        if options.with_cdn {
            filter = filter.require(Capability::Cdn);
        }

        let ranked = self.discovery().find(&filter).await?;
        if ranked.is_empty() {
            return Err(StorageError::registry("no provider matches the request"));
        }
        for provider in ranked {
            if self.ping(&provider).await {
                return Ok(provider);
            }
            warn!("Provider {} did not answer ping, skipping", provider.provider_id);
        }
        Err(StorageError::registry("no matching provider answered ping"))
    }

    async fn ping(&self, provider: &ProviderRecord) -> bool {
        PdpClient::new(
            self.transport.clone(),
            provider.endpoint.clone(),
            self.config.clone(),
        )
        .ping()
        .await
    }
}
