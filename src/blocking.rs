//! Thread-blocking facade
//!
//! Wraps the async workflows so they can be called from plain threads. Each
//! call is driven to completion on the current thread with
//! `futures::executor::block_on`; nothing is spawned.
//!
//! Pair these types with [`BlockingHttpTransport`], whose requests and poll
//! sleeps block the thread directly. Do not call them from inside an async
//! runtime.

use crate::chain::{ChainIndex, PayloadSigner};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::retrieval::{ChainRetriever, ProviderRegistry};
use crate::storage::{
    ContextOptions, PendingUpload, StorageContext, StorageManager, UploadOutcome,
};
use crate::transport::{BlockingHttpTransport, Transport};
use crate::types::{Dataset, Metadata, PieceCid};
use futures::executor::block_on;
use std::sync::Arc;
use std::time::Duration;

/// Build the default blocking transport
pub fn http_transport(config: &ClientConfig) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(BlockingHttpTransport::new(config)?))
}

/// Blocking counterpart of [`StorageManager`]
#[derive(Clone)]
pub struct BlockingStorageManager {
    inner: StorageManager,
}

impl BlockingStorageManager {
    /// Create a manager backed by a [`BlockingHttpTransport`]
    ///
    /// # Arguments
    ///
    /// * `chain` - Chain/index collaborator
    /// * `registry` - Provider registry collaborator
    /// * `signer` - Payload signer for the client wallet
    /// * `config` - Client configuration
    pub fn connect(
        chain: Arc<dyn ChainIndex>,
        registry: Arc<dyn ProviderRegistry>,
        signer: Arc<dyn PayloadSigner>,
        config: ClientConfig,
    ) -> Result<Self> {
        let transport = http_transport(&config)?;
        Ok(Self {
            inner: StorageManager::new(transport, chain, registry, signer).with_config(config),
        })
    }

    pub fn from_manager(inner: StorageManager) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &StorageManager {
        &self.inner
    }

    pub fn create_context(&self, options: ContextOptions) -> Result<BlockingStorageContext> {
        let inner = block_on(self.inner.create_context(options))?;
        Ok(BlockingStorageContext { inner })
    }

    pub fn create_contexts(
        &self,
        count: usize,
        options: ContextOptions,
    ) -> Result<Vec<BlockingStorageContext>> {
        let contexts = block_on(self.inner.create_contexts(count, options))?;
        Ok(contexts
            .into_iter()
            .map(BlockingStorageContext::new)
            .collect())
    }

    pub fn download(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        block_on(self.inner.download(piece_cid))
    }

    pub fn retriever(&self) -> BlockingChainRetriever {
        BlockingChainRetriever::new(self.inner.retriever())
    }
}

/// Blocking counterpart of [`StorageContext`]
pub struct BlockingStorageContext {
    inner: StorageContext,
}

impl BlockingStorageContext {
    pub fn new(inner: StorageContext) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &StorageContext {
        &self.inner
    }

    pub fn dataset(&self) -> Result<Dataset> {
        block_on(self.inner.dataset())
    }

    pub fn upload(&self, data: &[u8], metadata: Metadata) -> Result<UploadOutcome> {
        block_on(self.inner.upload(data, metadata))
    }

    pub fn resume(&self, pending: PendingUpload) -> Result<UploadOutcome> {
        block_on(self.inner.resume(pending))
    }

    pub fn upload_many(&self, items: &[(Vec<u8>, Metadata)]) -> Result<Vec<UploadOutcome>> {
        block_on(self.inner.upload_many(items))
    }

    pub fn download(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        block_on(self.inner.download(piece_cid))
    }

    pub fn has_piece(&self, piece_cid: &PieceCid) -> Result<bool> {
        block_on(self.inner.has_piece(piece_cid))
    }
}

/// Blocking counterpart of [`ChainRetriever`]
#[derive(Clone)]
pub struct BlockingChainRetriever {
    inner: ChainRetriever,
}

impl BlockingChainRetriever {
    pub fn new(inner: ChainRetriever) -> Self {
        Self { inner }
    }

    pub fn fetch(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        block_on(self.inner.fetch(piece_cid))
    }

    pub fn fetch_with_deadline(
        &self,
        piece_cid: &PieceCid,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        block_on(self.inner.fetch_with_deadline(piece_cid, deadline))
    }
}
