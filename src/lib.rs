pub mod blocking;
pub mod chain;
pub mod commp;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod mock;
pub mod pdp;
pub mod retrieval;
pub mod storage;
pub mod transport;
pub mod types;

pub use blocking::{BlockingChainRetriever, BlockingStorageContext, BlockingStorageManager};

pub use chain::{ChainIndex, DatasetInfo, PayloadSigner, SignedPayload, TxReceipt};

pub use commp::{CommitmentCalculator, PieceCidInfo, StreamCommp};

pub use config::{ClientConfig, COMMP_HELPER_ENV, MAX_UPLOAD_SIZE, MIN_UPLOAD_SIZE};

pub use error::{Result, StorageError};

pub use idempotency::{IdempotencyKey, IDEMPOTENCY_HEADER};

pub use pdp::{FinalizeResult, PdpClient, SessionHandle};

pub use retrieval::{
    CapabilityFilter, ChainRetriever, PieceRetriever, ProviderDiscovery, ProviderRegistry,
    RetrievalCandidate, RetrievalFailure,
};

pub use storage::{
    AddResult, ContextOptions, DatasetRegistrar, PendingUpload, PieceAdder, StorageContext,
    StorageManager, UploadOutcome, UploadResult, UploadSession,
};

pub use transport::{BlockingHttpTransport, HttpRequest, HttpResponse, Transport};

#[cfg(feature = "tokio")]
pub use transport::AsyncHttpTransport;

pub use types::{
    Capability, Dataset, DatasetId, Metadata, Phase, PieceCid, ProviderHealth, ProviderId,
    ProviderRecord,
};
