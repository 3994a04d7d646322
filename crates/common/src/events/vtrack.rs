//! `POST /vtrack`: store VAST with impression tracking injected.

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use http::{Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::cache::{CacheClient, CacheObject, CacheType, PutResponse, PutResponseEntry};
use crate::error::BidExchangeError;
use crate::http_util::{json_response, query_param};
use crate::settings::Settings;

use super::vast::modify_vast;
use super::vast_modification_allowed;

#[derive(Debug, Deserialize)]
struct VtrackRequest {
    #[serde(default)]
    puts: Vec<VtrackPut>,
}

#[derive(Debug, Deserialize)]
struct VtrackPut {
    #[serde(default, rename = "bidid")]
    bid_id: String,
    #[serde(default)]
    bidder: String,
    #[serde(rename = "type")]
    cache_type: CacheType,
    value: Value,
    #[serde(default, rename = "ttlseconds")]
    ttl_seconds: Option<u32>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    timestamp: i64,
}

fn invalid(message: impl Into<String>) -> Report<BidExchangeError> {
    Report::new(BidExchangeError::InvalidRequest {
        message: message.into(),
    })
}

fn parse_vtrack_request(
    settings: &Settings,
    body: &[u8],
) -> Result<VtrackRequest, Report<BidExchangeError>> {
    if body.is_empty() {
        return Err(invalid("Request body is empty"));
    }
    if body.len() > settings.host.max_request_size {
        return Err(invalid(format!(
            "Request size exceeds max size of {} bytes",
            settings.host.max_request_size
        )));
    }

    let request: VtrackRequest =
        serde_json::from_slice(body).change_context(BidExchangeError::InvalidRequest {
            message: "Unable to parse vtrack request".to_string(),
        })?;

    for put in &request.puts {
        if put.bid_id.is_empty() {
            return Err(invalid("'bidid' is required and can't be empty"));
        }
        if put.bidder.is_empty() {
            return Err(invalid("'bidder' is required and can't be empty"));
        }
    }

    Ok(request)
}

/// Stores the posted VAST, adding impression tracking for bidders that allow it.
///
/// Replies with the cache service's `{"responses": [{"uuid"}]}`.
///
/// # Errors
///
/// - [`BidExchangeError::InvalidRequest`] for a missing account or malformed body
/// - [`BidExchangeError::UnknownAccount`] when accounts are required and unknown
/// - [`BidExchangeError::Cache`] when storing fails
pub async fn handle_vtrack(
    settings: &Settings,
    cache: &dyn CacheClient,
    req: &Request<Bytes>,
) -> Result<Response<String>, Report<BidExchangeError>> {
    let account_id = query_param(req.uri(), "a")
        .filter(|account| !account.is_empty())
        .ok_or_else(|| invalid("Account 'a' is required query parameter and can't be empty"))?;

    if settings.auction.account_required && !settings.accounts.contains_key(&account_id) {
        return Err(Report::new(BidExchangeError::UnknownAccount { account_id }));
    }

    let request = parse_vtrack_request(settings, req.body())?;
    let mut modified = 0;

    let objects: Vec<CacheObject> = request
        .puts
        .into_iter()
        .map(|put| {
            let tracked = match &put.value {
                Value::String(vast) if vast_modification_allowed(settings, &put.bidder) => {
                    modify_vast(
                        &settings.host.external_url,
                        vast,
                        &put.bid_id,
                        &put.bidder,
                        &account_id,
                        put.timestamp,
                    )
                }
                _ => None,
            };
            let value = match tracked {
                Some(tracked) => {
                    modified += 1;
                    Value::String(tracked)
                }
                None => put.value,
            };

            CacheObject {
                cache_type: put.cache_type,
                value,
                ttl_seconds: put.ttl_seconds,
                key: put.key,
            }
        })
        .collect();

    log::info!(
        "vtrack for account '{}': {} puts, {} with injected tracking",
        account_id,
        objects.len(),
        modified
    );

    let uuids = cache.put_all(objects).await?;
    let response = PutResponse {
        responses: uuids
            .into_iter()
            .map(|uuid| PutResponseEntry { uuid })
            .collect(),
    };

    json_response(StatusCode::OK, &response)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::cache::tests::{cache_client, InMemoryCacheServer};
    use crate::test_support::tests::create_test_settings;

    fn vtrack_request(query: &str, body: Value) -> Request<Bytes> {
        Request::post(format!("https://exchange.test/vtrack{query}"))
            .body(Bytes::from(body.to_string()))
            .expect("should build request")
    }

    #[tokio::test]
    async fn test_injects_for_allowed_bidder_only() {
        let settings = create_test_settings();
        let server = Arc::new(InMemoryCacheServer::default());
        let cache = cache_client(Arc::clone(&server));
        let vast = "<VAST><Ad><Wrapper><Impression></Impression></Wrapper></Ad></VAST>";
        let req = vtrack_request(
            "?a=acct-1",
            json!({"puts": [
                {"bidid": "b1", "bidder": "alpha", "type": "xml", "value": vast, "timestamp": 1000},
                {"bidid": "b2", "bidder": "beta", "type": "xml", "value": vast}
            ]}),
        );

        let response = handle_vtrack(&settings, &cache, &req)
            .await
            .expect("vtrack should succeed");

        assert_eq!(response.status(), StatusCode::OK);
        let body: PutResponse = serde_json::from_str(response.body()).expect("should decode");
        assert_eq!(body.responses.len(), 2);

        let alpha = cache
            .get(&body.responses[0].uuid)
            .await
            .expect("should fetch alpha");
        assert!(alpha.contains(
            "<Impression><![CDATA[https://exchange.test/event?t=imp&b=b1&a=acct-1&bidder=alpha&f=b&ts=1000]]></Impression>"
        ));

        let beta = cache
            .get(&body.responses[1].uuid)
            .await
            .expect("should fetch beta");
        assert_eq!(beta, vast, "beta does not allow VAST modification");
    }

    #[tokio::test]
    async fn test_missing_account_rejected() {
        let settings = create_test_settings();
        let cache = cache_client(Arc::default());
        let req = vtrack_request("", json!({"puts": []}));

        let err = handle_vtrack(&settings, &cache, &req)
            .await
            .expect_err("account is required");

        assert!(matches!(
            err.current_context(),
            BidExchangeError::InvalidRequest { .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_bidid_rejected() {
        let settings = create_test_settings();
        let cache = cache_client(Arc::default());
        let req = vtrack_request(
            "?a=acct-1",
            json!({"puts": [{"bidder": "alpha", "type": "xml", "value": "<VAST/>"}]}),
        );

        let err = handle_vtrack(&settings, &cache, &req)
            .await
            .expect_err("bidid is required");

        assert!(format!("{err:?}").contains("bidid"));
    }

    #[tokio::test]
    async fn test_cache_failure_is_server_error() {
        let settings = create_test_settings();
        let cache = cache_client(Arc::new(InMemoryCacheServer {
            fail: true,
            ..Default::default()
        }));
        let req = vtrack_request(
            "?a=acct-1",
            json!({"puts": [{"bidid": "b1", "bidder": "alpha", "type": "xml", "value": "<VAST/>"}]}),
        );

        let err = handle_vtrack(&settings, &cache, &req)
            .await
            .expect_err("cache failure should surface");

        assert!(matches!(err.current_context(), BidExchangeError::Cache { .. }));
    }
}
