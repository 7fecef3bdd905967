//! Three-phase upload session
//!
//! ```text
//! Idle --create--> SessionCreated --put--> BytesSent --finalize--> Finalized
//!   \___________________\____________________\______________> Failed
//! ```
//!
//! A 409 in any phase means an earlier attempt with the same key already got
//! that far, so the session adopts the provider's identifiers and moves on.

use crate::commp::PieceCidInfo;
use crate::error::{Result, StorageError};
use crate::idempotency::{operations, IdempotencyKey};
use crate::pdp::{FinalizeResult, PdpClient, SessionHandle};
use crate::types::{DatasetId, Metadata, Phase};
use log::debug;

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    SessionCreated(SessionHandle),
    BytesSent(SessionHandle),
    Finalized(FinalizeResult),
    Failed(StorageError),
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::SessionCreated(_) => "session-created",
            SessionState::BytesSent(_) => "bytes-sent",
            SessionState::Finalized(_) => "finalized",
            SessionState::Failed(_) => "failed",
        }
    }
}

/// One payload's upload to one provider
#[derive(Debug)]
pub struct UploadSession {
    dataset_id: DatasetId,
    key: IdempotencyKey,
    state: SessionState,
}

impl UploadSession {
    /// Key guarding the upload of one payload into one dataset
    pub fn upload_key(
        dataset_id: DatasetId,
        info: &PieceCidInfo,
        metadata: &Metadata,
    ) -> IdempotencyKey {
        IdempotencyKey::derive(
            operations::UPLOAD_PIECE,
            &[&dataset_id.to_string(), info.piece_cid.as_str()],
            Some(metadata),
        )
    }

    pub fn new(dataset_id: DatasetId, info: &PieceCidInfo, metadata: &Metadata) -> Self {
        Self {
            dataset_id,
            key: Self::upload_key(dataset_id, info, metadata),
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Drive the session to `Finalized`, resuming from whatever state it is in
    pub async fn run(
        &mut self,
        pdp: &PdpClient,
        data: &[u8],
        info: &PieceCidInfo,
    ) -> Result<FinalizeResult> {
        loop {
            let next = match &self.state {
                SessionState::Finalized(result) => return Ok(result.clone()),
                SessionState::Failed(cause) => {
                    return Err(StorageError::validation(
                        "session",
                        format!("upload session already failed: {}", cause),
                    ))
                }
                SessionState::Idle => self.create(pdp, data.len() as u64).await,
                SessionState::SessionCreated(handle) => self.send(pdp, handle, data).await,
                SessionState::BytesSent(handle) => self.finalize(pdp, handle, info).await,
            };

            match next {
                Ok(state) => {
                    debug!(
                        "Upload {} moved {} -> {}",
                        self.key,
                        self.state.name(),
                        state.name()
                    );
                    self.state = state;
                }
                Err(e) => {
                    self.state = SessionState::Failed(e.clone());
                    return Err(e);
                }
            }
        }
    }

    async fn create(&self, pdp: &PdpClient, size: u64) -> Result<SessionState> {
        match pdp.create_session(self.dataset_id, size, &self.key).await {
            Ok(handle) => Ok(SessionState::SessionCreated(handle)),
            Err(StorageError::AlreadyExists {
                existing_resource_id: Some(session_id),
                ..
            }) => {
                debug!("Adopting existing session {}", session_id);
                Ok(SessionState::SessionCreated(pdp.session_handle(
                    session_id,
                    self.dataset_id,
                    size,
                    &self.key,
                )))
            }
            Err(StorageError::AlreadyExists { message, .. }) => {
                Err(self.unresolved(Phase::CreateSession, message))
            }
            Err(e) => Err(e),
        }
    }

    async fn send(
        &self,
        pdp: &PdpClient,
        handle: &SessionHandle,
        data: &[u8],
    ) -> Result<SessionState> {
        match pdp.put_bytes(handle, data).await {
            Ok(()) => Ok(SessionState::BytesSent(handle.clone())),
            Err(StorageError::AlreadyExists { .. }) => {
                debug!("Session {} already holds the payload", handle.session_id);
                Ok(SessionState::BytesSent(handle.clone()))
            }
            Err(e) => Err(e),
        }
    }

    async fn finalize(
        &self,
        pdp: &PdpClient,
        handle: &SessionHandle,
        info: &PieceCidInfo,
    ) -> Result<SessionState> {
        match pdp
            .finalize(handle, &info.piece_cid, Some(info.padded_piece_size))
            .await
        {
            Ok(result) => Ok(SessionState::Finalized(result)),
            Err(StorageError::AlreadyExists {
                existing_resource_id: Some(piece_id),
                ..
            }) => {
                debug!("Adopting existing piece {}", piece_id);
                Ok(SessionState::Finalized(FinalizeResult {
                    server_piece_id: piece_id,
                    piece_cid: info.piece_cid.clone(),
                }))
            }
            Err(StorageError::AlreadyExists { message, .. }) => {
                Err(self.unresolved(Phase::Finalize, message))
            }
            Err(e) => Err(e),
        }
    }

    fn unresolved(&self, phase: Phase, message: String) -> StorageError {
        StorageError::transient(
            phase,
            Some(409),
            Some(self.key.clone()),
            format!("conflict without an existing resource id: {}", message),
        )
    }
}
