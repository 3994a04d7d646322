//! Outbound HTTP transport used for bidder and cache calls.
//!
//! Everything that leaves the exchange goes through [`HttpClient`] so the
//! auction core can be driven by scripted partners in tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use error_stack::{Report, ResultExt};
use http::{HeaderMap, Method, StatusCode};

use crate::error::BidExchangeError;

/// A request an adapter or the cache client wants sent.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OutboundRequest {
    /// JSON POST to `uri`.
    pub fn post_json(uri: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        Self {
            method: Method::POST,
            uri: uri.into(),
            headers,
            body: body.into(),
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Status, headers and body of a completed call.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends `request`, giving up once `timeout` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Http`] on transport failure or timeout.
    async fn send(
        &self,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<RawResponse, Report<BidExchangeError>>;
}

/// Production client backed by a pooled [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(
        &self,
        request: OutboundRequest,
        timeout: Duration,
    ) -> Result<RawResponse, Report<BidExchangeError>> {
        let response = self
            .client
            .request(request.method, &request.uri)
            .headers(request.headers)
            .body(request.body)
            .timeout(timeout)
            .send()
            .await
            .change_context(BidExchangeError::Http {
                message: format!("Request to {} failed", request.uri),
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .change_context(BidExchangeError::Http {
                message: format!("Failed to read body from {}", request.uri),
            })?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
