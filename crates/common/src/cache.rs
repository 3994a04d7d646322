//! Creative cache client.
//!
//! Markup that must be rendered later is stored in an external cache
//! service. One `PUT /cache` carries every object for a response; the
//! service answers with one uuid per object, in order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, ResultExt};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auction::types::{AggregatedBid, CacheMarkup, MediaType};
use crate::constants::CACHE_UUID_MACRO;
use crate::error::BidExchangeError;
use crate::http_client::{HttpClient, OutboundRequest};
use crate::metrics::Metrics;
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Json,
    Xml,
}

/// One payload to store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheObject {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    pub value: Value,
    #[serde(rename = "ttlseconds", skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl CacheObject {
    #[must_use]
    pub fn xml(value: impl Into<String>) -> Self {
        Self {
            cache_type: CacheType::Xml,
            value: Value::String(value.into()),
            ttl_seconds: None,
            key: None,
        }
    }

    #[must_use]
    pub fn json(value: Value) -> Self {
        Self {
            cache_type: CacheType::Json,
            value,
            ttl_seconds: None,
            key: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub puts: Vec<CacheObject>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutResponseEntry {
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PutResponse {
    pub responses: Vec<PutResponseEntry>,
}

#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Stores every object in one call and returns their uuids in order.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Cache`] if the call fails or the service
    /// returns a different number of uuids than objects sent.
    async fn put_all(&self, objects: Vec<CacheObject>)
        -> Result<Vec<String>, Report<BidExchangeError>>;

    /// Fetches a stored payload by uuid.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Cache`] if the object cannot be fetched.
    async fn get(&self, uuid: &str) -> Result<String, Report<BidExchangeError>>;

    /// Public URL a renderer uses to fetch `uuid`.
    fn retrieval_url(&self, uuid: &str) -> String;
}

/// [`CacheClient`] speaking the cache service's HTTP protocol.
pub struct HttpCacheClient {
    client: Arc<dyn HttpClient>,
    base_url: String,
    query: String,
    timeout: Duration,
}

impl HttpCacheClient {
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>, settings: &Settings) -> Self {
        Self {
            client,
            base_url: format!("{}://{}/cache", settings.cache.scheme, settings.cache.host),
            query: settings.cache.query.clone(),
            timeout: Duration::from_millis(settings.cache.timeout_ms),
        }
    }

    fn cache_error(message: impl Into<String>) -> BidExchangeError {
        BidExchangeError::Cache {
            message: message.into(),
        }
    }
}

#[async_trait]
impl CacheClient for HttpCacheClient {
    async fn put_all(
        &self,
        objects: Vec<CacheObject>,
    ) -> Result<Vec<String>, Report<BidExchangeError>> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let expected = objects.len();

        let body = serde_json::to_vec(&PutRequest { puts: objects })
            .change_context(Self::cache_error("Failed to encode cache request"))?;
        let mut request = OutboundRequest::post_json(&self.base_url, body);
        request.method = http::Method::PUT;

        let response = self
            .client
            .send(request, self.timeout)
            .await
            .change_context(Self::cache_error("Cache write failed"))?;

        if response.status != StatusCode::OK {
            return Err(Report::new(Self::cache_error(format!(
                "Cache write returned status {}",
                response.status.as_u16()
            ))));
        }

        let parsed: PutResponse = serde_json::from_slice(&response.body)
            .change_context(Self::cache_error("Failed to decode cache response"))?;

        if parsed.responses.len() != expected {
            return Err(Report::new(Self::cache_error(format!(
                "Cache returned {} uuids for {} objects",
                parsed.responses.len(),
                expected
            ))));
        }

        log::debug!("Stored {} objects in cache", expected);
        Ok(parsed.responses.into_iter().map(|entry| entry.uuid).collect())
    }

    async fn get(&self, uuid: &str) -> Result<String, Report<BidExchangeError>> {
        let response = self
            .client
            .send(OutboundRequest::get(self.retrieval_url(uuid)), self.timeout)
            .await
            .change_context(Self::cache_error("Cache read failed"))?;

        if response.status != StatusCode::OK {
            return Err(Report::new(Self::cache_error(format!(
                "Cache read for {uuid} returned status {}",
                response.status.as_u16()
            ))));
        }

        String::from_utf8(response.body.to_vec())
            .change_context(Self::cache_error("Cached payload is not UTF-8"))
    }

    fn retrieval_url(&self, uuid: &str) -> String {
        let query = self.query.replace(CACHE_UUID_MACRO, uuid);
        if query.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}?{}", self.base_url, query)
        }
    }
}

/// Payload stored for one bid.
fn cache_object_for(bid: &AggregatedBid) -> CacheObject {
    if bid.media_type == MediaType::Video {
        CacheObject::xml(bid.adm.clone().unwrap_or_default())
    } else {
        CacheObject::json(json!({
            "adm": bid.adm,
            "nurl": bid.nurl,
            "width": bid.width,
            "height": bid.height,
        }))
    }
}

/// Moves markup for the bids `mode` selects into the cache.
///
/// Cached bids lose `adm` and `nurl` and gain `cache_id` and `cache_url`.
///
/// # Errors
///
/// Returns [`BidExchangeError::Cache`] if the batch write fails. No bid is
/// modified in that case.
pub async fn cache_bids(
    cache: &dyn CacheClient,
    bids: &mut [AggregatedBid],
    mode: CacheMarkup,
) -> Result<(), Report<BidExchangeError>> {
    let selected: Vec<usize> = bids
        .iter()
        .enumerate()
        .filter(|(_, bid)| mode.applies_to(bid.media_type))
        .map(|(index, _)| index)
        .collect();

    if selected.is_empty() {
        return Ok(());
    }

    let objects = selected
        .iter()
        .map(|&index| cache_object_for(&bids[index]))
        .collect();

    let metrics = Metrics::get();
    let uuids = cache.put_all(objects).await.inspect_err(|e| {
        log::error!("Cache write for {} bids failed: {:?}", selected.len(), e);
        if let Some(metrics) = metrics {
            metrics.cache_write("failed");
        }
    })?;
    if let Some(metrics) = metrics {
        metrics.cache_write("ok");
    }

    for (index, uuid) in selected.into_iter().zip(uuids) {
        let bid = &mut bids[index];
        bid.cache_url = Some(cache.retrieval_url(&uuid));
        bid.cache_id = Some(uuid);
        bid.adm = None;
        bid.nurl = None;
    }

    Ok(())
}
