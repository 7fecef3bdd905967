//! Chain-driven piece retrieval with provider fallback

use super::discovery::ProviderDiscovery;
use super::types::{RetrievalCandidate, RetrievalFailure};
use crate::chain::ChainIndex;
use crate::config::ClientConfig;
use crate::error::{Result, StorageError};
use crate::pdp::PdpClient;
use crate::transport::Transport;
use crate::types::PieceCid;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Anything that can produce piece bytes for a content identifier
#[async_trait]
pub trait PieceRetriever: Send + Sync {
    async fn fetch_piece(&self, piece_cid: &PieceCid) -> Result<Vec<u8>>;
}

/// Fetches a piece from whichever provider holds it
///
/// Holders come from the chain, endpoints from the registry. Providers are
/// tried one at a time in holder order and the first success wins. When every
/// holder fails the optional fallback retriever gets a last try; if that fails
/// as well the caller receives every recorded failure.
#[derive(Clone)]
pub struct ChainRetriever {
    chain: Arc<dyn ChainIndex>,
    discovery: ProviderDiscovery,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    fallback: Option<Arc<dyn PieceRetriever>>,
}

impl ChainRetriever {
    pub fn new(
        chain: Arc<dyn ChainIndex>,
        discovery: ProviderDiscovery,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            chain,
            discovery,
            transport,
            config,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn PieceRetriever>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Holders of the piece, one entry per provider, in chain order
    pub async fn candidates(&self, piece_cid: &PieceCid) -> Result<Vec<RetrievalCandidate>> {
        let holders = self.chain.holders_of(piece_cid).await?;
        let mut seen = HashSet::new();
        Ok(holders
            .into_iter()
            .filter(|holder| seen.insert(holder.provider_id))
            .collect())
    }

    pub async fn fetch(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        self.fetch_inner(piece_cid, None).await
    }

    /// Like [`fetch`](Self::fetch), but gives up with `Timeout` once `deadline` has elapsed
    pub async fn fetch_with_deadline(
        &self,
        piece_cid: &PieceCid,
        deadline: Duration,
    ) -> Result<Vec<u8>> {
        self.fetch_inner(piece_cid, Some(Instant::now() + deadline))
            .await
    }

    async fn fetch_inner(
        &self,
        piece_cid: &PieceCid,
        deadline: Option<Instant>,
    ) -> Result<Vec<u8>> {
        let candidates = self.candidates(piece_cid).await?;
        debug!("{} holders recorded for {}", candidates.len(), piece_cid);

        let mut attempts = Vec::new();
        let mut skipped = Vec::new();

        for candidate in &candidates {
            let remaining = remaining_time(piece_cid, deadline, attempts.len())?;

            let provider = match self.discovery.resolve(candidate.provider_id).await {
                Ok(Some(provider)) if provider.is_usable() => provider,
                Ok(Some(provider)) => {
                    debug!("Skipping provider {}: not usable", provider.provider_id);
                    skipped.push(
                        RetrievalFailure::for_candidate(candidate, "provider inactive or unhealthy")
                            .with_endpoint(provider.endpoint),
                    );
                    continue;
                }
                Ok(None) => {
                    debug!("Skipping provider {}: not registered", candidate.provider_id);
                    skipped.push(RetrievalFailure::for_candidate(
                        candidate,
                        "provider not found in registry",
                    ));
                    continue;
                }
                Err(e) => {
                    skipped.push(RetrievalFailure::for_candidate(candidate, e.to_string()));
                    continue;
                }
            };

            let client = PdpClient::new(
                self.transport.clone(),
                provider.endpoint.clone(),
                self.config.clone(),
            );
            match client.download_piece(piece_cid, remaining).await {
                Ok(bytes) => {
                    info!(
                        "Retrieved {} ({} bytes) from provider {}",
                        piece_cid,
                        bytes.len(),
                        provider.provider_id
                    );
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!(
                        "Provider {} failed to serve {}: {}",
                        provider.provider_id, piece_cid, e
                    );
                    attempts.push(
                        RetrievalFailure::for_candidate(candidate, e.to_string())
                            .with_endpoint(provider.endpoint),
                    );
                }
            }
        }

        if let Some(fallback) = &self.fallback {
            remaining_time(piece_cid, deadline, attempts.len())?;
            warn!("All chain holders failed for {}, trying fallback", piece_cid);
            match fallback.fetch_piece(piece_cid).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => attempts.push(RetrievalFailure::fallback(e.to_string())),
            }
        }

        Err(StorageError::Unavailable {
            content_id: piece_cid.to_string(),
            attempts,
            skipped,
        })
    }
}

fn remaining_time(
    piece_cid: &PieceCid,
    deadline: Option<Instant>,
    attempted: usize,
) -> Result<Option<Duration>> {
    let Some(deadline) = deadline else {
        return Ok(None);
    };
    let now = Instant::now();
    if now >= deadline {
        return Err(StorageError::timeout(format!(
            "retrieval of {} after {} provider attempts",
            piece_cid, attempted
        )));
    }
    Ok(Some(deadline - now))
}

#[async_trait]
impl PieceRetriever for ChainRetriever {
    async fn fetch_piece(&self, piece_cid: &PieceCid) -> Result<Vec<u8>> {
        self.fetch(piece_cid).await
    }
}
