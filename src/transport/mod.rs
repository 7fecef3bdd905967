//! Transport abstraction for provider calls
//!
//! Every network call and every poll delay in this crate goes through a
//! [`Transport`]. The same workflow code runs in both execution modes:
//!
//! - [`AsyncHttpTransport`] suspends the calling task on I/O and sleeps
//! - [`BlockingHttpTransport`] blocks the calling thread on both, and is
//!   driven by the executors in [`crate::blocking`]

pub mod http;
pub mod types;

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

pub use http::BlockingHttpTransport;
#[cfg(feature = "tokio")]
pub use http::AsyncHttpTransport;
pub use types::{Body, HttpRequest, HttpResponse, Method};

/// A request/response capability plus the suspension primitive used by polling loops
///
/// Implementations must be safe to share across concurrent logical operations;
/// they keep no per-call state between requests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. Connection failures surface as `StorageError::Network`.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Wait between polls
    async fn sleep(&self, duration: Duration);
}
