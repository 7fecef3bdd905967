//! reqwest-backed transports

use super::types::{Body, HttpRequest, HttpResponse, Method};
use super::Transport;
use crate::config::ClientConfig;
use crate::error::Result;
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use std::time::Duration;

const OCTET_STREAM: &str = "application/octet-stream";

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Head => reqwest::Method::HEAD,
    }
}

fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Transport that blocks the calling thread
///
/// Must not be used from inside an async runtime; pair it with
/// [`crate::blocking`] instead.
pub struct BlockingHttpTransport {
    client: reqwest::blocking::Client,
}

impl BlockingHttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        // Per-request timeouts are set by the caller; transfers stay unbounded
        let client = reqwest::blocking::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for BlockingHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Bytes(bytes) => builder.header(CONTENT_TYPE, OCTET_STREAM).body(bytes),
        };

        let response = builder.send()?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes()?.to_vec();

        debug!("{} {} -> {}", request.method, request.url, status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Transport that suspends the calling task on tokio
#[cfg(feature = "tokio")]
pub struct AsyncHttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "tokio")]
impl AsyncHttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[cfg(feature = "tokio")]
#[async_trait]
impl Transport for AsyncHttpTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Bytes(bytes) => builder.header(CONTENT_TYPE, OCTET_STREAM).body(bytes),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response.bytes().await?.to_vec();

        debug!("{} {} -> {}", request.method, request.url, status);
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
