//! HTTP client for one storage provider

use super::types::{
    AddPiecesRequest, AddPiecesResponse, ConflictBody, CreateDatasetRequest,
    CreateDatasetResponse, CreateSessionRequest, CreateSessionResponse, DatasetCreationStatus,
    FinalizeRequest, FinalizeResponse, FinalizeResult, PieceStatus, SessionHandle,
};
use crate::config::ClientConfig;
use crate::error::{Result, StorageError};
use crate::idempotency::{IdempotencyKey, IDEMPOTENCY_HEADER};
use crate::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::types::{DatasetId, Phase, PieceCid};
use log::{debug, info};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Map a provider response onto the error taxonomy
///
/// Statuses in `expected` pass through. 409 becomes `AlreadyExists` carrying
/// whatever identifiers the body names, 422 becomes `Idempotency`, and
/// everything else is `Transient` with the key that remains safe to replay.
pub fn check_status(
    phase: Phase,
    key: Option<&IdempotencyKey>,
    response: HttpResponse,
    expected: &[u16],
) -> Result<HttpResponse> {
    if expected.contains(&response.status) {
        return Ok(response);
    }

    match response.status {
        409 => {
            let body: ConflictBody = response.json().unwrap_or_default();
            let message = body.message.clone().unwrap_or_else(|| response.text());
            Err(StorageError::AlreadyExists {
                phase,
                existing_resource_id: body.resource_id(),
                existing_pieces: body.existing_pieces,
                message,
            })
        }
        422 => Err(StorageError::Idempotency {
            phase,
            key: key.map(|k| k.to_string()).unwrap_or_default(),
            message: response.text(),
        }),
        status => Err(StorageError::transient(
            phase,
            Some(status),
            key.cloned(),
            format!("unexpected status {}: {}", status, response.text()),
        )),
    }
}

/// Driver for the protocol exposed by a single provider endpoint
#[derive(Clone)]
pub struct PdpClient {
    transport: Arc<dyn Transport>,
    endpoint: String,
    config: ClientConfig,
}

impl PdpClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        endpoint: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            config,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn request(&self, method: Method, path: &str, key: Option<&IdempotencyKey>) -> HttpRequest {
        let request = HttpRequest::new(method, self.url(path))
            .timeout(Some(self.config.request_timeout_duration()));
        match key {
            Some(key) => request.header(IDEMPOTENCY_HEADER, key.as_str()),
            None => request,
        }
    }

    async fn call(
        &self,
        phase: Phase,
        key: Option<&IdempotencyKey>,
        request: HttpRequest,
        expected: &[u16],
    ) -> Result<HttpResponse> {
        debug!("{} {} {}", phase, request.method, request.url);
        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| e.in_phase(phase, key))?;
        check_status(phase, key, response, expected)
    }

    fn decode<T: DeserializeOwned>(
        phase: Phase,
        key: Option<&IdempotencyKey>,
        response: &HttpResponse,
    ) -> Result<T> {
        response.json().map_err(|e| {
            StorageError::transient(
                phase,
                Some(response.status),
                key.cloned(),
                format!("malformed response body: {}", e),
            )
        })
    }

    /// Submit a dataset creation transaction
    pub async fn create_dataset(
        &self,
        request: &CreateDatasetRequest,
        key: &IdempotencyKey,
    ) -> Result<CreateDatasetResponse> {
        let phase = Phase::CreateDataset;
        let http = self.request(Method::Post, "/data-sets", Some(key)).json(request)?;
        let response = self.call(phase, Some(key), http, &[200, 201, 202]).await?;

        if let Ok(created) = response.json::<CreateDatasetResponse>() {
            return Ok(created);
        }
        // Some providers only answer with a Location header
        let tx_hash = response
            .header("Location")
            .and_then(|location| location.rsplit('/').next())
            .filter(|tx| !tx.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                StorageError::transient(
                    phase,
                    Some(response.status),
                    Some(key.clone()),
                    "dataset creation response carried no transaction hash",
                )
            })?;
        Ok(CreateDatasetResponse { tx_hash })
    }

    /// Query whether a creation transaction has produced a dataset yet
    pub async fn dataset_creation_status(&self, tx_hash: &str) -> Result<DatasetCreationStatus> {
        let phase = Phase::DatasetStatus;
        let path = format!("/data-sets/created/{}", tx_hash);
        let response = self
            .call(phase, None, self.request(Method::Get, &path, None), &[200, 404])
            .await?;
        if response.status == 404 {
            return Ok(DatasetCreationStatus::default());
        }
        Self::decode(phase, None, &response)
    }

    /// Poll until the creation transaction yields a dataset id
    pub async fn wait_for_dataset_creation(&self, tx_hash: &str) -> Result<DatasetId> {
        let timeout = self.config.dataset_creation_timeout_duration();
        let interval = self.config.dataset_poll_interval_duration();
        let started = Instant::now();

        loop {
            let status = self.dataset_creation_status(tx_hash).await?;
            if status.data_set_created {
                if let Some(dataset_id) = status.data_set_id {
                    info!("Dataset {} created by transaction {}", dataset_id, tx_hash);
                    return Ok(dataset_id);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(StorageError::timeout(format!(
                    "dataset creation {} not confirmed after {:?}",
                    tx_hash, elapsed
                )));
            }
            self.transport.sleep(interval.min(timeout - elapsed)).await;
        }
    }

    /// Register pieces in a dataset
    pub async fn add_pieces(
        &self,
        dataset_id: DatasetId,
        request: &AddPiecesRequest,
        key: &IdempotencyKey,
    ) -> Result<AddPiecesResponse> {
        let phase = Phase::AddPieces;
        let path = format!("/data-sets/{}/pieces", dataset_id);
        let http = self.request(Method::Post, &path, Some(key)).json(request)?;
        let response = self.call(phase, Some(key), http, &[200, 201, 202]).await?;
        if response.body.is_empty() {
            return Ok(AddPiecesResponse::default());
        }
        Self::decode(phase, Some(key), &response)
    }

    /// Open an upload session for `expected_size` bytes
    pub async fn create_session(
        &self,
        dataset_id: DatasetId,
        expected_size: u64,
        key: &IdempotencyKey,
    ) -> Result<SessionHandle> {
        let phase = Phase::CreateSession;
        let body = CreateSessionRequest {
            data_set_id: dataset_id,
            size: expected_size,
            idempotency_key: key.clone(),
        };
        let http = self.request(Method::Post, "/sessions", Some(key)).json(&body)?;
        let response = self.call(phase, Some(key), http, &[200, 201]).await?;

        let session_id = match response.json::<CreateSessionResponse>() {
            Ok(created) => created.session_id,
            Err(_) => response
                .header("Location")
                .and_then(|location| location.rsplit('/').next())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .ok_or_else(|| {
                    StorageError::transient(
                        phase,
                        Some(response.status),
                        Some(key.clone()),
                        "session response carried no session id",
                    )
                })?,
        };

        Ok(self.session_handle(session_id, dataset_id, expected_size, key))
    }

    /// Build a handle for a session that already exists on the provider
    pub fn session_handle(
        &self,
        session_id: impl Into<String>,
        dataset_id: DatasetId,
        expected_size: u64,
        key: &IdempotencyKey,
    ) -> SessionHandle {
        SessionHandle {
            session_id: session_id.into(),
            dataset_id,
            expected_size,
            key: key.clone(),
        }
    }

    /// Transfer the payload. No timeout applies to the transfer itself.
    pub async fn put_bytes(&self, session: &SessionHandle, data: &[u8]) -> Result<()> {
        let phase = Phase::PutBytes;
        if data.len() as u64 != session.expected_size {
            return Err(StorageError::validation(
                "data",
                format!(
                    "session {} expects {} bytes, got {}",
                    session.session_id,
                    session.expected_size,
                    data.len()
                ),
            ));
        }

        let path = format!("/sessions/{}/bytes", session.session_id);
        let http = self
            .request(Method::Put, &path, Some(&session.key))
            .timeout(None)
            .bytes(data.to_vec());
        self.call(phase, Some(&session.key), http, &[200, 201, 204])
            .await?;
        Ok(())
    }

    /// Close the session and obtain the provider's piece id
    pub async fn finalize(
        &self,
        session: &SessionHandle,
        piece_cid: &PieceCid,
        padded_size: Option<u64>,
    ) -> Result<FinalizeResult> {
        let phase = Phase::Finalize;
        let path = format!("/sessions/{}/finalize", session.session_id);
        let body = FinalizeRequest {
            piece_cid: piece_cid.clone(),
            size: padded_size,
            idempotency_key: session.key.clone(),
        };
        let http = self
            .request(Method::Post, &path, Some(&session.key))
            .json(&body)?;
        let response = self
            .call(phase, Some(&session.key), http, &[200, 201])
            .await?;
        let finalized: FinalizeResponse = Self::decode(phase, Some(&session.key), &response)?;

        Ok(FinalizeResult {
            server_piece_id: finalized.piece_id,
            piece_cid: piece_cid.clone(),
        })
    }

    /// Single indexing status check. A 404 means the piece is not indexed yet.
    pub async fn piece_status(&self, server_piece_id: &str) -> Result<bool> {
        let phase = Phase::PollIndexed;
        let path = format!("/pieces/{}/status", server_piece_id);
        let response = self
            .call(phase, None, self.request(Method::Get, &path, None), &[200, 404])
            .await?;
        if response.status == 404 {
            return Ok(false);
        }
        let status: PieceStatus = Self::decode(phase, None, &response)?;
        Ok(status.indexed)
    }

    /// Poll until the piece is indexed or `timeout` elapses
    ///
    /// Returns `Ok(false)` on expiry: an unindexed piece is a pending state,
    /// not a failure. The status is always checked at least once.
    pub async fn poll_indexed(&self, server_piece_id: &str, timeout: Duration) -> Result<bool> {
        let interval = self.config.indexing_poll_interval_duration();
        let started = Instant::now();

        loop {
            if self.piece_status(server_piece_id).await? {
                debug!("Piece {} indexed after {:?}", server_piece_id, started.elapsed());
                return Ok(true);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!("Piece {} still not indexed after {:?}", server_piece_id, elapsed);
                return Ok(false);
            }
            self.transport.sleep(interval.min(timeout - elapsed)).await;
        }
    }

    /// Fetch piece bytes by content identifier
    pub async fn download_piece(
        &self,
        piece_cid: &PieceCid,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let path = format!("/pieces/{}", piece_cid);
        let http = self
            .request(Method::Get, &path, None)
            .timeout(timeout.or(Some(self.config.request_timeout_duration())));
        let response = self.call(Phase::Download, None, http, &[200]).await?;
        Ok(response.body)
    }

    /// Whether the provider stores the piece
    pub async fn has_piece(&self, piece_cid: &PieceCid) -> Result<bool> {
        let path = format!("/pieces/{}", piece_cid);
        let response = self
            .call(
                Phase::Download,
                None,
                self.request(Method::Head, &path, None),
                &[200, 404],
            )
            .await?;
        Ok(response.status == 200)
    }

    /// Health check; any answer below 500 counts as alive
    pub async fn ping(&self) -> bool {
        let http = HttpRequest::head(self.url("/"))
            .timeout(Some(self.config.ping_timeout_duration()));
        match self.transport.send(http).await {
            Ok(response) => response.status < 500,
            Err(e) => {
                debug!("Ping {} failed: {}", self.endpoint, e);
                false
            }
        }
    }
}
