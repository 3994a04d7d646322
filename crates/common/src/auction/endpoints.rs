//! `POST /auction` handler.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use http::{Request, Response, StatusCode};
use tokio::time::Instant;

use crate::cache::cache_bids;
use crate::constants::{STATUS_NO_COOKIE, STATUS_OK};
use crate::error::{BidExchangeError, IntoHttpResponse as _};
use crate::events::vast::track_video_bids;
use crate::exchange::Exchange;
use crate::http_util::json_response;
use crate::metrics::Metrics;
use crate::privacy::Permissions;
use crate::usersync::cookie::SyncState;

use super::aggregate::{Aggregation, ResponseAggregator};
use super::price_granularity::PriceGranularity;
use super::request::{parse_auction_request, partition_jobs};
use super::targeting::Targeter;
use super::types::{AuctionResponse, BidderJob, BidderStatus, CacheMarkup};

/// Runs one auction.
///
/// Bidder failures only show up in `bidder_status`; the response is 200
/// with whatever bids arrived before the deadline.
///
/// # Errors
///
/// - [`BidExchangeError::InvalidRequest`] or [`BidExchangeError::UnknownAccount`]
///   when the request cannot be parsed
/// - [`BidExchangeError::Cache`] when markup had to be cached and the write failed
pub async fn handle_auction(
    exchange: &Exchange,
    req: &Request<Bytes>,
) -> Result<Response<String>, Report<BidExchangeError>> {
    let started = Instant::now();
    let result = run_auction(exchange, req).await;

    if let Some(metrics) = Metrics::get() {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(report) if report.current_context().status_code().is_client_error() => {
                "rejected"
            }
            Err(_) => "failed",
        };
        metrics.auction_finished(outcome, started.elapsed());
    }

    result
}

async fn run_auction(
    exchange: &Exchange,
    req: &Request<Bytes>,
) -> Result<Response<String>, Report<BidExchangeError>> {
    let settings = &exchange.settings;
    let request = Arc::new(parse_auction_request(settings, req.headers(), req.body())?);
    let deadline = Instant::now() + Duration::from_millis(request.timeout_ms);
    let state = SyncState::from_headers(req.headers());

    log::info!(
        "Auction '{}' for account '{}': {} ad units, {}ms budget",
        request.tid,
        request.account_id,
        request.ad_units.len(),
        request.timeout_ms
    );

    let mut rejected = Vec::new();
    let mut jobs: Vec<BidderJob> = Vec::new();
    for mut job in partition_jobs(&request) {
        if !exchange.registry.contains(&job.bidder) {
            log::warn!("Rejecting unsupported bidder '{}'", job.bidder);
            rejected.push(BidderStatus::rejected(
                job.bidder,
                job.placements.len(),
                "Unsupported bidder".to_string(),
            ));
            continue;
        }
        if exchange
            .privacy
            .bidder_sync_allowed(&job.bidder, &request.privacy)
        {
            job.buyer_uid = settings
                .family_for(&job.bidder)
                .and_then(|family| state.uid(family))
                .map(ToString::to_string);
        }
        jobs.push(job);
    }

    let results = exchange.dispatcher.dispatch(jobs, deadline).await;
    let Aggregation {
        mut bids,
        mut bidder_status,
    } = ResponseAggregator::aggregate(&request, results);
    if let Some(metrics) = Metrics::get() {
        for status in &rejected {
            metrics.adapter_status(&status.bidder, status.status);
        }
    }
    bidder_status.extend(rejected);

    for status in &mut bidder_status {
        let annotation =
            exchange
                .usersync
                .annotate(&status.bidder, &state, &request.privacy, &exchange.privacy);
        status.no_cookie = annotation.no_cookie;
        status.usersync = annotation.usersync;
    }

    track_video_bids(
        settings,
        &request.account_id,
        &mut bids,
        chrono::Utc::now().timestamp_millis(),
    );

    if request.cache_markup != CacheMarkup::None {
        cache_bids(exchange.cache.as_ref(), &mut bids, request.cache_markup).await?;
    }

    if request.sort_bids {
        let granularity =
            PriceGranularity::from_name(settings.price_granularity_for(&request.account_id));
        Targeter::new(granularity, request.max_key_length).apply(&mut bids);
    }

    let status = if state.sync_count() == 0 {
        STATUS_NO_COOKIE
    } else {
        STATUS_OK
    };

    log::info!(
        "Auction '{}' finished with {} bids from {} bidders",
        request.tid,
        bids.len(),
        bidder_status.len()
    );

    json_response(
        StatusCode::OK,
        &AuctionResponse {
            tid: request.tid.clone(),
            status: status.to_string(),
            bidder_status,
            bids,
        },
    )
}

#[cfg(test)]
mod tests {
    use http::header;
    use serde_json::{json, Value};

    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::auction::dispatch::tests::{openrtb_registry, seat_bid, Script, ScriptedClient};
    use crate::auction::types::AdapterStatus;
    use crate::cache::tests::{cache_client, InMemoryCacheServer};
    use crate::error::IntoHttpResponse;
    use crate::test_support::tests::create_test_settings;

    fn exchange_with(client: ScriptedClient, cache: Arc<InMemoryCacheServer>) -> Exchange {
        let registry: AdapterRegistry = (*openrtb_registry()).clone();
        Exchange::new(
            create_test_settings(),
            registry,
            Arc::new(client),
            Arc::new(cache_client(cache)),
        )
        .expect("should build exchange")
    }

    fn auction_body() -> Value {
        json!({
            "account_id": "acct-1",
            "tid": "tid-e2e",
            "timeout_millis": 100,
            "sort_bids": 1,
            "regs": {"ext": {"gdpr": 0}},
            "ad_units": [
                {
                    "code": "div-1",
                    "sizes": [{"w": 300, "h": 250}],
                    "bids": [
                        {"bidder": "alpha", "bid_id": "a-1", "params": {"placement": 1}},
                        {"bidder": "beta", "bid_id": "b-1", "params": {"zone": "x"}}
                    ]
                },
                {
                    "code": "div-2",
                    "sizes": [{"w": 300, "h": 250}, {"w": 728, "h": 90}],
                    "bids": [{"bidder": "alpha", "bid_id": "a-2", "params": {"placement": 2}}]
                },
                {
                    "code": "div-3",
                    "sizes": [{"w": 160, "h": 600}],
                    "bids": [{"bidder": "beta", "bid_id": "b-3", "params": {"zone": "y"}}]
                }
            ]
        })
    }

    fn post(body: &Value) -> Request<Bytes> {
        Request::post("https://exchange.test/auction")
            .header(header::REFERER, "https://publisher.test/page")
            .body(Bytes::from(body.to_string()))
            .expect("should build request")
    }

    fn decode(response: &Response<String>) -> AuctionResponse {
        serde_json::from_str(response.body()).expect("should decode auction response")
    }

    fn status_for<'a>(response: &'a AuctionResponse, bidder: &str) -> &'a BidderStatus {
        response
            .bidder_status
            .iter()
            .find(|status| status.bidder == bidder)
            .expect("every bidder should have a status")
    }

    #[tokio::test]
    async fn test_slow_bidder_times_out_and_other_wins() {
        let client = ScriptedClient::default()
            .with(
                "https://alpha.test/bid",
                Script::Delay(
                    Duration::from_secs(5),
                    StatusCode::OK,
                    seat_bid("div-1", 9.0, 300, 250),
                ),
            )
            .with(
                "https://beta.test/openrtb",
                Script::Respond(StatusCode::OK, seat_bid("div-1", 1.5, 300, 250)),
            );
        let exchange = exchange_with(client, Arc::default());
        let started = std::time::Instant::now();

        let response = handle_auction(&exchange, &post(&auction_body()))
            .await
            .expect("auction should succeed");

        assert!(
            started.elapsed() < Duration::from_millis(1000),
            "auction should return near its deadline"
        );
        assert_eq!(response.status(), StatusCode::OK);
        let body = decode(&response);
        assert_eq!(body.tid, "tid-e2e");
        assert_eq!(body.status, "no_cookie");
        assert_eq!(body.bids.len(), 1);
        assert_eq!(status_for(&body, "alpha").status, AdapterStatus::Timeout);
        let beta = status_for(&body, "beta");
        assert_eq!(beta.status, AdapterStatus::Ok);
        assert_eq!(beta.num_bids, 1);
        assert_eq!(beta.ad_unit_count, 2);

        let targeting = &body.bids[0].ad_server_targeting;
        assert_eq!(targeting.get("hb_pb").map(String::as_str), Some("1.50"));
        assert_eq!(targeting.get("hb_bidder").map(String::as_str), Some("beta"));
        assert_eq!(targeting.get("hb_pb_beta").map(String::as_str), Some("1.50"));
        assert_eq!(body.bids[0].bid_id, "b-1");
    }

    #[tokio::test]
    async fn test_usersync_annotations_and_unsupported_bidder() {
        let client = ScriptedClient::default()
            .with(
                "https://alpha.test/bid",
                Script::Respond(StatusCode::NO_CONTENT, String::new()),
            )
            .with(
                "https://beta.test/openrtb",
                Script::Respond(StatusCode::NO_CONTENT, String::new()),
            );
        let exchange = exchange_with(client, Arc::default());
        let mut body = auction_body();
        body["ad_units"][2]["bids"][0]["bidder"] = json!("gamma");
        let metrics = Metrics::get().expect("should register metrics");
        let rejected_before = metrics.adapter_count("gamma", AdapterStatus::BadInput);

        let response = handle_auction(&exchange, &post(&body))
            .await
            .expect("auction should succeed");
        let body = decode(&response);

        assert!(body.bids.is_empty());
        assert_eq!(body.bidder_status.len(), 3);
        let alpha = status_for(&body, "alpha");
        assert_eq!(alpha.status, AdapterStatus::NoBid);
        assert!(alpha.no_cookie);
        assert!(alpha
            .usersync
            .as_ref()
            .is_some_and(|sync| sync.url.starts_with("https://alpha.test/sync?gdpr=0")));
        let gamma = status_for(&body, "gamma");
        assert_eq!(gamma.status, AdapterStatus::BadInput);
        assert_eq!(gamma.error.as_deref(), Some("Unsupported bidder"));
        assert!(
            metrics.adapter_count("gamma", AdapterStatus::BadInput) > rejected_before,
            "rejected bidder should be counted"
        );
    }

    #[tokio::test]
    async fn test_cache_markup_round_trip() {
        let client = ScriptedClient::default()
            .with(
                "https://alpha.test/bid",
                Script::Respond(StatusCode::OK, seat_bid("div-1", 2.0, 300, 250)),
            )
            .with(
                "https://beta.test/openrtb",
                Script::Respond(StatusCode::NO_CONTENT, String::new()),
            );
        let server = Arc::new(InMemoryCacheServer::default());
        let exchange = exchange_with(client, Arc::clone(&server));
        let mut body = auction_body();
        body["cache_markup"] = json!(1);

        let response = handle_auction(&exchange, &post(&body))
            .await
            .expect("auction should succeed");
        let body = decode(&response);

        let bid = &body.bids[0];
        assert!(bid.adm.is_none(), "markup moves to the cache");
        let cache_id = bid.cache_id.clone().expect("bid should have a cache id");
        assert_eq!(
            bid.ad_server_targeting.get("hb_cache_id").map(String::as_str),
            Some(cache_id.as_str())
        );
        let stored: Value = serde_json::from_str(
            &exchange.cache.get(&cache_id).await.expect("should fetch"),
        )
        .expect("stored payload should be JSON");
        assert_eq!(stored["adm"], "<div>ad</div>");
    }

    #[tokio::test]
    async fn test_cache_failure_fails_auction() {
        let client = ScriptedClient::default().with(
            "https://alpha.test/bid",
            Script::Respond(StatusCode::OK, seat_bid("div-1", 2.0, 300, 250)),
        );
        let server = Arc::new(InMemoryCacheServer {
            fail: true,
            ..Default::default()
        });
        let exchange = exchange_with(client, server);
        let mut body = auction_body();
        body["cache_markup"] = json!(1);

        let err = handle_auction(&exchange, &post(&body))
            .await
            .expect_err("cache failure should fail the auction");

        assert_eq!(
            err.current_context().status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_invalid_request() {
        let exchange = exchange_with(ScriptedClient::default(), Arc::default());
        let req = Request::post("https://exchange.test/auction")
            .body(Bytes::from_static(b"{"))
            .expect("should build request");
        let metrics = Metrics::get().expect("should register metrics");
        let rejected_before = metrics.auction_count("rejected");

        let err = handle_auction(&exchange, &req)
            .await
            .expect_err("unparseable body should fail");

        assert_eq!(err.current_context().status_code(), StatusCode::BAD_REQUEST);
        assert!(metrics.auction_count("rejected") > rejected_before);
    }
}
