//! Storage provider protocol driver
//!
//! [`PdpClient`] speaks the provider's HTTP protocol: dataset creation, piece
//! registration and the three-phase upload (session, bytes, finalize). It maps
//! statuses into the error taxonomy but never resolves a conflict itself; that
//! is left to the workflows in [`crate::storage`].

pub mod client;
pub mod types;

pub use client::{check_status, PdpClient};
pub use types::{
    AddPiecesRequest, AddPiecesResponse, ConflictBody, CreateDatasetRequest,
    CreateDatasetResponse, CreateSessionRequest, DatasetCreationStatus, FinalizeRequest,
    FinalizeResult, PieceEntry, PieceStatus, SessionHandle,
};
