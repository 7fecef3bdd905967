//! Idempotent dataset creation

use crate::chain::{ChainIndex, PayloadSigner};
use crate::error::{Result, StorageError};
use crate::idempotency::{operations, IdempotencyKey};
use crate::pdp::{CreateDatasetRequest, PdpClient};
use crate::types::{
    metadata_matches, Dataset, DatasetId, Metadata, Phase, ProviderId, ProviderRecord,
};
use log::{debug, info, warn};
use std::sync::Arc;

/// Creates a dataset on one provider, or reuses the one an earlier attempt made
///
/// The request key covers the client, provider, client dataset id and
/// metadata. A 409 from the provider is never taken at face value: the
/// existing dataset's stored metadata is read back from the chain and must
/// match exactly.
#[derive(Clone)]
pub struct DatasetRegistrar {
    pdp: PdpClient,
    provider: ProviderRecord,
    chain: Arc<dyn ChainIndex>,
    signer: Arc<dyn PayloadSigner>,
}

impl DatasetRegistrar {
    pub fn new(
        pdp: PdpClient,
        provider: ProviderRecord,
        chain: Arc<dyn ChainIndex>,
        signer: Arc<dyn PayloadSigner>,
    ) -> Self {
        Self {
            pdp,
            provider,
            chain,
            signer,
        }
    }

    /// Key guarding the creation of one dataset
    pub fn dataset_key(
        client_address: &str,
        provider_id: ProviderId,
        client_dataset_id: u64,
        metadata: &Metadata,
    ) -> IdempotencyKey {
        IdempotencyKey::derive(
            operations::CREATE_DATASET,
            &[
                client_address,
                &provider_id.to_string(),
                &client_dataset_id.to_string(),
            ],
            Some(metadata),
        )
    }

    pub async fn create_or_reuse(
        &self,
        client_address: &str,
        provider_id: ProviderId,
        client_dataset_id: u64,
        metadata: &Metadata,
    ) -> Result<Dataset> {
        if provider_id != self.provider.provider_id {
            return Err(StorageError::validation(
                "provider_id",
                format!(
                    "registrar is bound to provider {}, not {}",
                    self.provider.provider_id, provider_id
                ),
            ));
        }

        let key = Self::dataset_key(client_address, provider_id, client_dataset_id, metadata);
        let extra_data =
            self.signer
                .sign_create_dataset(client_dataset_id, &self.provider.payee, metadata)?;
        let request = CreateDatasetRequest {
            record_keeper: self.pdp.config().record_keeper.clone(),
            payer: client_address.to_string(),
            client_data_set_id: client_dataset_id,
            metadata: metadata.clone(),
            extra_data: extra_data.0,
        };

        debug!(
            "Creating dataset {} for {} on provider {} (key {})",
            client_dataset_id, client_address, provider_id, key
        );

        match self.pdp.create_dataset(&request, &key).await {
            Ok(created) => {
                let dataset_id = self
                    .pdp
                    .wait_for_dataset_creation(&created.tx_hash)
                    .await?;
                info!(
                    "Created dataset {} on provider {} (tx {})",
                    dataset_id, provider_id, created.tx_hash
                );
                Ok(Dataset {
                    dataset_id,
                    client_dataset_id,
                    provider_id,
                    client_address: client_address.to_string(),
                    metadata: metadata.clone(),
                    is_new: true,
                })
            }
            Err(StorageError::AlreadyExists {
                existing_resource_id,
                ..
            }) => {
                let dataset_id = self
                    .existing_dataset_id(
                        existing_resource_id.as_deref(),
                        client_address,
                        client_dataset_id,
                        &key,
                    )
                    .await?;
                self.verify_reuse(dataset_id, client_address, client_dataset_id, metadata)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn existing_dataset_id(
        &self,
        reported: Option<&str>,
        client_address: &str,
        client_dataset_id: u64,
        key: &IdempotencyKey,
    ) -> Result<DatasetId> {
        if let Some(id) = reported {
            return id.parse().map_err(|_| {
                StorageError::transient(
                    Phase::CreateDataset,
                    Some(409),
                    Some(key.clone()),
                    format!("provider reported unparseable dataset id {:?}", id),
                )
            });
        }

        // No id in the conflict body: find it through the chain
        let provider_id = self.provider.provider_id;
        self.chain
            .client_datasets(client_address)
            .await?
            .into_iter()
            .find(|d| {
                d.live && d.provider_id == provider_id && d.client_dataset_id == client_dataset_id
            })
            .map(|d| d.dataset_id)
            .ok_or_else(|| {
                StorageError::transient(
                    Phase::CreateDataset,
                    Some(409),
                    Some(key.clone()),
                    "provider reported an existing dataset that is not visible on chain yet",
                )
            })
    }

    async fn verify_reuse(
        &self,
        dataset_id: DatasetId,
        client_address: &str,
        client_dataset_id: u64,
        metadata: &Metadata,
    ) -> Result<Dataset> {
        let stored = self.chain.dataset_metadata(dataset_id).await?;
        if !metadata_matches(&stored, metadata) {
            warn!(
                "Dataset {} exists with different metadata, refusing to reuse it",
                dataset_id
            );
            return Err(StorageError::MetadataConflict {
                dataset_id,
                requested: metadata.clone(),
                stored,
            });
        }

        info!(
            "Reusing dataset {} on provider {}",
            dataset_id, self.provider.provider_id
        );
        Ok(Dataset {
            dataset_id,
            client_dataset_id,
            provider_id: self.provider.provider_id,
            client_address: client_address.to_string(),
            metadata: stored,
            is_new: false,
        })
    }
}
