//! Provider discovery and multi-provider piece retrieval

pub mod chain;
pub mod discovery;
pub mod types;

pub use chain::{ChainRetriever, PieceRetriever};
pub use discovery::{rank_providers, ProviderDiscovery, ProviderRegistry};
pub use types::{CapabilityFilter, RetrievalCandidate, RetrievalFailure};
