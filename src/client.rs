//! HTTP client abstraction
//!
//! One trait covers every outbound HTTP call the control plane makes:
//! proxying inference requests to the managed backend, readiness probing
//! during a launch, and served-model resolution against `/v1/models`.
//! Keeping it a trait lets tests script backend behavior without sockets.
//! Managed backends are loopback-only, so the production client is plain
//! HTTP.

use async_trait::async_trait;
use axum::response::IntoResponse;
use bytes::Bytes;
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::time::Duration;

pub type HyperClient = Client<HttpConnector, axum::body::Body>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

pub fn create_hyper_client() -> HyperClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_timer(TokioTimer::new())
        .build_http()
}

/// Time-bounded GET returning the status code and collected body.
///
/// Connection failures and timeouts come back as `Err`; callers that only
/// care about reachability (the health probe) treat both the same way.
pub async fn get_with_timeout<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
    timeout: Duration,
) -> Result<(u16, Bytes), String> {
    let req = axum::http::Request::builder()
        .method("GET")
        .uri(url)
        .body(axum::body::Body::empty())
        .map_err(|e| format!("failed to build request for {url}: {e}"))?;

    let response = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| format!("request to {url} timed out"))?
        .map_err(|e| format!("request to {url} failed: {e}"))?;

    let status = response.status().as_u16();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .map_err(|e| format!("failed to read body from {url}: {e}"))?;

    Ok((status, body))
}
