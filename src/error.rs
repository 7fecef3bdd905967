//! Error handling for the PDP storage client
//!
//! This module defines the error taxonomy shared by the protocol driver, the
//! idempotent dataset/piece workflows and the retrieval path.

use crate::idempotency::IdempotencyKey;
use crate::retrieval::types::RetrievalFailure;
use crate::types::{DatasetId, Metadata, Phase};
use thiserror::Error;

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, StorageError>;

/// Error types returned by the client
#[derive(Error, Debug)]
pub enum StorageError {
    /// Bad input shape or size; never retried
    #[error("Invalid parameter: {parameter} - {message}")]
    Validation { parameter: String, message: String },

    /// An existing dataset was found for the same identifying triple but its metadata differs
    #[error("Metadata conflict on dataset {dataset_id}: requested {requested:?}, stored {stored:?}")]
    MetadataConflict {
        dataset_id: DatasetId,
        requested: Metadata,
        stored: Metadata,
    },

    /// The provider reports the resource already exists for this key (HTTP 409)
    #[error("Already exists during {phase}: {message}")]
    AlreadyExists {
        phase: Phase,
        existing_resource_id: Option<String>,
        existing_pieces: Vec<String>,
        message: String,
    },

    /// The key was reused with a different payload (HTTP 422)
    #[error("Idempotency key conflict during {phase} (key {key}): {message}")]
    Idempotency {
        phase: Phase,
        key: String,
        message: String,
    },

    /// Network failure or unexpected provider status; safe to replay with `retry_key`
    #[error("Transient provider error during {phase}{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Transient {
        phase: Phase,
        status: Option<u16>,
        retry_key: Option<IdempotencyKey>,
        message: String,
    },

    /// A polling or fallback loop ran out of time before completing
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Every known holder of the content failed
    #[error("Content {content_id} unavailable from all known holders ({} attempted, {} skipped)", .attempts.len(), .skipped.len())]
    Unavailable {
        content_id: String,
        attempts: Vec<RetrievalFailure>,
        skipped: Vec<RetrievalFailure>,
    },

    /// The external commitment helper is missing or failed
    #[error("Commitment unavailable: {message}")]
    CommitmentUnavailable { message: String },

    /// Chain/index collaborator failure
    #[error("Chain operation failed: {operation} - {message}")]
    Chain { operation: String, message: String },

    /// Provider registry collaborator failure
    #[error("Registry operation failed: {message}")]
    Registry { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transport-level failure before a phase could be attributed
    #[error("Network error: {message}")]
    Network { message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Create a new validation error
    pub fn validation(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Validation {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a new transient provider error
    pub fn transient(
        phase: Phase,
        status: Option<u16>,
        retry_key: Option<IdempotencyKey>,
        message: impl Into<String>,
    ) -> Self {
        StorageError::Transient {
            phase,
            status,
            retry_key,
            message: message.into(),
        }
    }

    /// Create a new timeout condition
    pub fn timeout(operation: impl Into<String>) -> Self {
        StorageError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a new commitment error
    pub fn commitment(message: impl Into<String>) -> Self {
        StorageError::CommitmentUnavailable {
            message: message.into(),
        }
    }

    /// Create a new chain error
    pub fn chain(operation: impl Into<String>, message: impl Into<String>) -> Self {
        StorageError::Chain {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new registry error
    pub fn registry(message: impl Into<String>) -> Self {
        StorageError::Registry {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        StorageError::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        StorageError::Network {
            message: message.into(),
        }
    }

    /// Whether a caller may retry the failed operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Transient { .. }
                | StorageError::Network { .. }
                | StorageError::Timeout { .. }
                | StorageError::Unavailable { .. }
        )
    }

    /// Protocol phase the error was raised in, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            StorageError::AlreadyExists { phase, .. }
            | StorageError::Idempotency { phase, .. }
            | StorageError::Transient { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Idempotency key that remains valid for replaying the failed phase
    pub fn retry_key(&self) -> Option<&IdempotencyKey> {
        match self {
            StorageError::Transient { retry_key, .. } => retry_key.as_ref(),
            _ => None,
        }
    }

    /// Attach a phase (and key) to a phase-less network error
    pub(crate) fn in_phase(self, phase: Phase, retry_key: Option<&IdempotencyKey>) -> Self {
        match self {
            StorageError::Network { message } => {
                StorageError::transient(phase, None, retry_key.cloned(), message)
            }
            other => other,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::network(err.to_string())
    }
}

impl Clone for StorageError {
    fn clone(&self) -> Self {
        match self {
            StorageError::Validation { parameter, message } => StorageError::Validation {
                parameter: parameter.clone(),
                message: message.clone(),
            },
            StorageError::MetadataConflict {
                dataset_id,
                requested,
                stored,
            } => StorageError::MetadataConflict {
                dataset_id: *dataset_id,
                requested: requested.clone(),
                stored: stored.clone(),
            },
            StorageError::AlreadyExists {
                phase,
                existing_resource_id,
                existing_pieces,
                message,
            } => StorageError::AlreadyExists {
                phase: *phase,
                existing_resource_id: existing_resource_id.clone(),
                existing_pieces: existing_pieces.clone(),
                message: message.clone(),
            },
            StorageError::Idempotency {
                phase,
                key,
                message,
            } => StorageError::Idempotency {
                phase: *phase,
                key: key.clone(),
                message: message.clone(),
            },
            StorageError::Transient {
                phase,
                status,
                retry_key,
                message,
            } => StorageError::Transient {
                phase: *phase,
                status: *status,
                retry_key: retry_key.clone(),
                message: message.clone(),
            },
            StorageError::Timeout { operation } => StorageError::Timeout {
                operation: operation.clone(),
            },
            StorageError::Unavailable {
                content_id,
                attempts,
                skipped,
            } => StorageError::Unavailable {
                content_id: content_id.clone(),
                attempts: attempts.clone(),
                skipped: skipped.clone(),
            },
            StorageError::CommitmentUnavailable { message } => {
                StorageError::CommitmentUnavailable {
                    message: message.clone(),
                }
            }
            StorageError::Chain { operation, message } => StorageError::Chain {
                operation: operation.clone(),
                message: message.clone(),
            },
            StorageError::Registry { message } => StorageError::Registry {
                message: message.clone(),
            },
            StorageError::Config { message } => StorageError::Config {
                message: message.clone(),
            },
            StorageError::Network { message } => StorageError::Network {
                message: message.clone(),
            },
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StorageError::Json(e) => {
                StorageError::Json(<serde_json::Error as serde::de::Error>::custom(e))
            }
        }
    }
}
