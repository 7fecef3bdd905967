//! Integration tests for the PDP storage client
//!
//! Every test runs against the in-memory provider network in `pdp_storage::mock`.
//!
//! Available tests:
//! - blocking_mode: The thread-blocking facade
//! - commp_helper: The external commitment helper and configuration
//! - dataset_idempotency: Dataset creation, replay and metadata conflicts
//! - piece_batches: Piece registration with partial overlaps
//! - provider_selection: Dataset reuse and provider ranking
//! - retrieval_fallback: Multi-provider retrieval and failure aggregation
//! - upload_flow: Upload sessions, indexing timeouts and resumption

pub mod dataset_idempotency;
pub mod provider_selection;
pub mod thread_safety;
pub mod upload_flow;
