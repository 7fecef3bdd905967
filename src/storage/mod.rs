//! Idempotent storage workflows
//!
//! This module builds the dataset and piece workflows on top of the
//! [`PdpClient`](crate::pdp::PdpClient) protocol driver.
//!
//! ## Core Types
//!
//! - [`DatasetRegistrar`] - create a dataset or verify and reuse an existing one
//! - [`PieceAdder`] - add pieces without double-adding on replay
//! - [`UploadSession`] - the create / put / finalize state machine
//! - [`StorageContext`] - full upload of a payload into one dataset
//! - [`StorageManager`] - provider selection, dataset reuse and downloads

pub mod context;
pub mod manager;
pub mod pieces;
pub mod registrar;
pub mod types;
pub mod upload;

pub use context::{StorageContext, StorageContextBuilder};
pub use manager::StorageManager;
pub use pieces::PieceAdder;
pub use registrar::DatasetRegistrar;
pub use types::{AddResult, ContextOptions, PendingUpload, UploadOutcome, UploadResult};
pub use upload::{SessionState, UploadSession};
