//! Wire types for the provider protocol

use crate::idempotency::IdempotencyKey;
use crate::types::{DatasetId, Metadata, PieceCid};
use serde::{Deserialize, Serialize};

/// Body of `POST /data-sets`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatasetRequest {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub record_keeper: Option<String>,
    pub payer: String,
    pub client_data_set_id: u64,
    #[serde(default)]
    pub metadata: Metadata,
    /// Hex-encoded signed payload
    pub extra_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDatasetResponse {
    pub tx_hash: String,
}

/// Body of `GET /data-sets/created/{tx_hash}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatasetCreationStatus {
    pub data_set_created: bool,
    pub data_set_id: Option<DatasetId>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PieceEntry {
    pub piece_cid: PieceCid,
    #[serde(default)]
    pub metadata: Metadata,
    pub idempotency_key: IdempotencyKey,
}

/// Body of `POST /data-sets/{id}/pieces`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPiecesRequest {
    pub pieces: Vec<PieceEntry>,
    pub extra_data: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddPiecesResponse {
    pub tx_hash: Option<String>,
}

/// Body of `POST /sessions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub data_set_id: DatasetId,
    pub size: u64,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionResponse {
    pub session_id: String,
}

/// Body of `POST /sessions/{id}/finalize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub piece_cid: PieceCid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub size: Option<u64>,
    pub idempotency_key: IdempotencyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FinalizeResponse {
    pub piece_id: String,
}

/// Body of `GET /pieces/{id}/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PieceStatus {
    pub indexed: bool,
}

/// Body returned with 409 responses. Providers name the identifier field after
/// the resource kind, so all spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConflictBody {
    #[serde(
        alias = "existingDataSetId",
        alias = "existingSessionId",
        alias = "existingPieceId"
    )]
    pub existing_resource_id: Option<serde_json::Value>,
    pub existing_pieces: Vec<String>,
    pub message: Option<String>,
}

impl ConflictBody {
    pub fn resource_id(&self) -> Option<String> {
        match &self.existing_resource_id {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// An open upload session on one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub dataset_id: DatasetId,
    pub expected_size: u64,
    pub key: IdempotencyKey,
}

/// Outcome of a finalized upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeResult {
    pub server_piece_id: String,
    pub piece_cid: PieceCid,
}
