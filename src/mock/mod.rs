//! In-memory provider network
//!
//! Everything needed to exercise the client without a real provider or
//! chain: [`MockNetwork`] routes requests by endpoint to [`MockPdpServer`]s,
//! which record datasets on a shared [`MockChain`]. Providers added to the
//! network are listed in its [`MockRegistry`].

pub mod chain;
pub mod server;

pub use chain::MockChain;
pub use server::{MockFailure, MockPdpServer};

use crate::chain::{PayloadSigner, SignedPayload};
use crate::commp::{padded_piece_size, CommitmentCalculator, PieceCidInfo, RAW_CODEC};
use crate::config::ClientConfig;
use crate::error::{Result, StorageError};
use crate::retrieval::{CapabilityFilter, ProviderRegistry};
use crate::storage::StorageManager;
use crate::transport::{HttpRequest, HttpResponse, Transport};
use crate::types::{Metadata, PieceCid, ProviderId, ProviderRecord};
use async_trait::async_trait;
use cid::multihash::Multihash;
use cid::Cid;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SHA2_256: u64 = 0x12;

/// Lock a mutex, recovering the data if a panicking test poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Config with poll intervals short enough for tests
pub fn fast_config() -> ClientConfig {
    ClientConfig::new()
        .indexing_timeout(Duration::from_secs(2))
        .indexing_poll_interval(Duration::from_millis(10))
        .dataset_creation_timeout(Duration::from_secs(2))
        .dataset_poll_interval(Duration::from_millis(10))
        .request_timeout(Duration::from_secs(5))
}

/// Routes requests to mock providers by endpoint
pub struct MockNetwork {
    servers: Mutex<Vec<Arc<MockPdpServer>>>,
    chain: Arc<MockChain>,
    registry: Arc<MockRegistry>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            servers: Mutex::new(Vec::new()),
            chain: Arc::new(MockChain::new()),
            registry: Arc::new(MockRegistry::new()),
        })
    }

    pub fn chain(&self) -> Arc<MockChain> {
        self.chain.clone()
    }

    pub fn registry(&self) -> Arc<MockRegistry> {
        self.registry.clone()
    }

    /// Register `record` and start a provider at its endpoint
    pub fn add_provider(&self, record: ProviderRecord) -> Arc<MockPdpServer> {
        let server = Arc::new(MockPdpServer::new(
            record.provider_id,
            record.endpoint.clone(),
            self.chain.clone(),
        ));
        self.registry.upsert(record);
        lock(&self.servers).push(server.clone());
        server
    }

    pub fn server(&self, provider_id: ProviderId) -> Option<Arc<MockPdpServer>> {
        lock(&self.servers)
            .iter()
            .find(|s| s.provider_id() == provider_id)
            .cloned()
    }

    /// A manager wired to this network with a [`MockSigner`] and [`MockCommitment`]
    pub fn manager(self: &Arc<Self>, client_address: &str) -> StorageManager {
        StorageManager::new(
            self.clone(),
            self.chain.clone(),
            self.registry.clone(),
            Arc::new(MockSigner::new(client_address)),
        )
        .with_commitment(Arc::new(MockCommitment::new()))
        .with_config(fast_config())
    }
}

#[async_trait]
impl Transport for MockNetwork {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let server = lock(&self.servers)
            .iter()
            .find(|s| s.serves(&request.url))
            .cloned();
        match server {
            Some(server) => server.handle(&request),
            None => Err(StorageError::network(format!(
                "connection refused: {}",
                request.url
            ))),
        }
    }

    async fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Registry holding provider records in memory
#[derive(Default)]
pub struct MockRegistry {
    providers: Mutex<Vec<ProviderRecord>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record with the same provider id
    pub fn upsert(&self, record: ProviderRecord) {
        let mut providers = lock(&self.providers);
        match providers
            .iter_mut()
            .find(|p| p.provider_id == record.provider_id)
        {
            Some(existing) => *existing = record,
            None => providers.push(record),
        }
    }

    pub fn remove(&self, provider_id: ProviderId) {
        lock(&self.providers).retain(|p| p.provider_id != provider_id);
    }

    /// Apply `update` to a registered provider
    pub fn update(&self, provider_id: ProviderId, update: impl FnOnce(&mut ProviderRecord)) {
        if let Some(record) = lock(&self.providers)
            .iter_mut()
            .find(|p| p.provider_id == provider_id)
        {
            update(record);
        }
    }
}

#[async_trait]
impl ProviderRegistry for MockRegistry {
    async fn list_providers(&self, _filter: &CapabilityFilter) -> Result<Vec<ProviderRecord>> {
        Ok(lock(&self.providers).clone())
    }

    async fn get_provider(&self, provider_id: ProviderId) -> Result<Option<ProviderRecord>> {
        Ok(lock(&self.providers)
            .iter()
            .find(|p| p.provider_id == provider_id)
            .cloned())
    }
}

/// Deterministic signer: the payload is a hash of the signed fields
#[derive(Debug, Clone)]
pub struct MockSigner {
    address: String,
}

impl MockSigner {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    fn sign(&self, value: serde_json::Value) -> Result<SignedPayload> {
        let encoded = serde_json::to_vec(&value)?;
        let digest = Sha256::new()
            .chain_update(self.address.as_bytes())
            .chain_update(&encoded)
            .finalize();
        Ok(SignedPayload(format!("0x{}", hex::encode(digest))))
    }
}

impl PayloadSigner for MockSigner {
    fn client_address(&self) -> String {
        self.address.clone()
    }

    fn sign_create_dataset(
        &self,
        client_dataset_id: u64,
        payee: &str,
        metadata: &Metadata,
    ) -> Result<SignedPayload> {
        self.sign(json!({
            "op": "create_dataset",
            "clientDataSetId": client_dataset_id,
            "payee": payee,
            "metadata": metadata,
        }))
    }

    fn sign_add_pieces(
        &self,
        client_dataset_id: u64,
        pieces: &[(PieceCid, Metadata)],
    ) -> Result<SignedPayload> {
        let pieces: Vec<_> = pieces
            .iter()
            .map(|(cid, metadata)| json!({"pieceCid": cid, "metadata": metadata}))
            .collect();
        self.sign(json!({
            "op": "add_pieces",
            "clientDataSetId": client_dataset_id,
            "pieces": pieces,
        }))
    }
}

/// Commitment stand-in: a raw sha2-256 CID of the payload
#[derive(Debug, Default)]
pub struct MockCommitment {
    calls: AtomicUsize,
    unavailable: bool,
}

impl MockCommitment {
    pub fn new() -> Self {
        Self::default()
    }

    /// A calculator whose helper is missing
    pub fn unavailable() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            unavailable: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The CID `compute` yields for `data`
    pub fn piece_cid(data: &[u8]) -> Result<PieceCid> {
        let digest = Sha256::digest(data);
        let hash = Multihash::<64>::wrap(SHA2_256, &digest)
            .map_err(|e| StorageError::commitment(e.to_string()))?;
        PieceCid::parse(Cid::new_v1(RAW_CODEC, hash).to_string())
    }
}

impl CommitmentCalculator for MockCommitment {
    fn compute(&self, data: &[u8]) -> Result<PieceCidInfo> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(StorageError::commitment("stream-commp not found"));
        }

        let payload_size = data.len() as u64;
        let padded = padded_piece_size(payload_size);
        Ok(PieceCidInfo {
            piece_cid: Self::piece_cid(data)?,
            piece_cid_v1: None,
            payload_size,
            unpadded_piece_size: padded / 128 * 127,
            padded_piece_size: padded,
        })
    }
}
