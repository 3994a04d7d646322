//! Inbound auction request parsing and per-bidder partitioning.

use std::sync::Arc;

use error_stack::{Report, ResultExt};
use http::{header, HeaderMap};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::BidExchangeError;
use crate::privacy::{GdprSignal, PrivacyPolicy};
use crate::settings::Settings;

use super::types::{
    AdUnit, AuctionRequest, BidderJob, BidderPlacement, CacheMarkup, MediaType, PageContext,
    PlacementBid, Size,
};

#[derive(Debug, Deserialize)]
struct AuctionRequestBody {
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    tid: Option<String>,
    #[serde(default)]
    timeout_millis: u64,
    #[serde(default)]
    cache_markup: u8,
    #[serde(default)]
    sort_bids: u8,
    #[serde(default)]
    max_key_length: usize,
    #[serde(default)]
    ad_units: Vec<AdUnitBody>,
    #[serde(default)]
    regs: Option<RegsBody>,
    #[serde(default)]
    user: Option<UserBody>,
    #[serde(default)]
    app: Option<Value>,
    #[serde(default)]
    device: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AdUnitBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    sizes: Vec<Size>,
    #[serde(default)]
    media_types: Vec<MediaType>,
    #[serde(default, alias = "bidders")]
    bids: Vec<BidBody>,
}

#[derive(Debug, Deserialize)]
struct BidBody {
    bidder: String,
    #[serde(default)]
    bid_id: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Default, Deserialize)]
struct RegsBody {
    #[serde(default)]
    ext: RegsExtBody,
}

#[derive(Debug, Default, Deserialize)]
struct RegsExtBody {
    #[serde(default)]
    gdpr: Option<u8>,
    #[serde(default)]
    us_privacy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserBody {
    #[serde(default)]
    ext: UserExtBody,
}

#[derive(Debug, Default, Deserialize)]
struct UserExtBody {
    #[serde(default)]
    consent: Option<String>,
}

fn invalid(message: impl Into<String>) -> Report<BidExchangeError> {
    Report::new(BidExchangeError::InvalidRequest {
        message: message.into(),
    })
}

/// Parses and validates an auction request body.
///
/// # Errors
///
/// Returns [`BidExchangeError::InvalidRequest`] for oversized or malformed
/// bodies and missing ad unit data, and [`BidExchangeError::UnknownAccount`]
/// for accounts not present in settings.
pub fn parse_auction_request(
    settings: &Settings,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<AuctionRequest, Report<BidExchangeError>> {
    if body.len() > settings.host.max_request_size {
        return Err(invalid(format!(
            "Request size exceeds max size of {} bytes",
            settings.host.max_request_size
        )));
    }

    let parsed: AuctionRequestBody =
        serde_json::from_slice(body).change_context(BidExchangeError::InvalidRequest {
            message: "Unable to parse auction request".to_string(),
        })?;

    let account_id = resolve_account(settings, parsed.account_id.as_deref())?;

    if parsed.ad_units.is_empty() {
        return Err(invalid("No ad units specified"));
    }

    let mut ad_units = Vec::with_capacity(parsed.ad_units.len());
    for unit in parsed.ad_units {
        if unit.code.is_empty() {
            return Err(invalid("Ad unit is missing a code"));
        }
        if unit.sizes.is_empty() {
            return Err(invalid(format!("Ad unit '{}' has no sizes", unit.code)));
        }
        if unit.bids.is_empty() {
            return Err(invalid(format!("Ad unit '{}' has no bids", unit.code)));
        }

        let media_types = if unit.media_types.is_empty() {
            vec![MediaType::Banner]
        } else {
            unit.media_types
        };

        let bids = unit
            .bids
            .into_iter()
            .map(|bid| PlacementBid {
                bidder: bid.bidder,
                bid_id: if bid.bid_id.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    bid.bid_id
                },
                params: bid.params,
            })
            .collect();

        ad_units.push(AdUnit {
            code: unit.code,
            sizes: unit.sizes,
            media_types,
            bids,
        });
    }

    let cache_markup = CacheMarkup::from_flag(parsed.cache_markup)
        .ok_or_else(|| invalid(format!("Invalid cache_markup value {}", parsed.cache_markup)))?;

    let regs_ext = parsed.regs.map(|regs| regs.ext).unwrap_or_default();
    let gdpr_value = regs_ext.gdpr.map(|gdpr| gdpr.to_string());
    let privacy = PrivacyPolicy::new(
        GdprSignal::resolve(gdpr_value.as_deref(), settings.gdpr.default_value.as_deref()),
        parsed
            .user
            .and_then(|user| user.ext.consent)
            .unwrap_or_default(),
        regs_ext.us_privacy.unwrap_or_default(),
    );

    let timeout_ms = settings.auction_timeouts.limit(parsed.timeout_millis);

    Ok(AuctionRequest {
        account_id,
        tid: parsed
            .tid
            .filter(|tid| !tid.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        timeout_ms,
        cache_markup,
        sort_bids: parsed.sort_bids == 1,
        max_key_length: parsed.max_key_length,
        ad_units,
        page: page_context(headers),
        app: parsed.app,
        device: parsed.device,
        privacy,
    })
}

fn resolve_account(
    settings: &Settings,
    account_id: Option<&str>,
) -> Result<String, Report<BidExchangeError>> {
    match account_id.filter(|id| !id.is_empty()) {
        Some(id) if settings.accounts.contains_key(id) => Ok(id.to_string()),
        Some(id) => Err(Report::new(BidExchangeError::UnknownAccount {
            account_id: id.to_string(),
        })),
        None if settings.auction.account_required => Err(invalid("Missing account id")),
        None => Ok(String::new()),
    }
}

fn page_context(headers: &HeaderMap) -> PageContext {
    let Some(referer) = headers
        .get(header::REFERER)
        .and_then(|value| value.to_str().ok())
    else {
        return PageContext::default();
    };

    match url::Url::parse(referer) {
        Ok(url) => PageContext {
            domain: url.host_str().map(ToString::to_string),
            url: Some(referer.to_string()),
        },
        Err(e) => {
            log::debug!("Ignoring unparseable referer '{}': {}", referer, e);
            PageContext::default()
        }
    }
}

/// Splits a request into one job per bidder, in first-seen bidder order.
///
/// Each job owns its own copy of the placements it bids on.
#[must_use]
pub fn partition_jobs(request: &Arc<AuctionRequest>) -> Vec<BidderJob> {
    request
        .bidders()
        .into_iter()
        .map(|bidder| {
            let placements = request
                .ad_units
                .iter()
                .filter_map(|unit| {
                    unit.bids
                        .iter()
                        .find(|bid| bid.bidder == bidder)
                        .map(|bid| BidderPlacement {
                            code: unit.code.clone(),
                            sizes: unit.sizes.clone(),
                            media_types: unit.media_types.clone(),
                            bid_id: bid.bid_id.clone(),
                            params: bid.params.clone(),
                        })
                })
                .collect();

            BidderJob {
                bidder,
                placements,
                request: Arc::clone(request),
                buyer_uid: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use serde_json::json;

    use super::*;
    use crate::test_support::tests::{create_test_settings, sample_auction_request};

    fn body(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).expect("should encode body")
    }

    fn minimal() -> Value {
        json!({
            "account_id": "acct-1",
            "tid": "abcd",
            "ad_units": [{
                "code": "first",
                "sizes": [{"w": 300, "h": 250}],
                "bids": [{"bidder": "alpha", "bid_id": "bid-a", "params": {"id": 417}}]
            }]
        })
    }

    #[test]
    fn test_parse_minimal_request() {
        let settings = create_test_settings();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://news.publisher.test/article?id=1"),
        );

        let request = parse_auction_request(&settings, &headers, &body(&minimal()))
            .expect("should parse request");

        assert_eq!(request.account_id, "acct-1");
        assert_eq!(request.tid, "abcd");
        assert_eq!(request.timeout_ms, 200, "unset timeout takes the default");
        assert_eq!(request.cache_markup, CacheMarkup::None);
        assert!(!request.sort_bids);
        assert_eq!(request.ad_units[0].media_types, vec![MediaType::Banner]);
        assert_eq!(request.ad_units[0].bids[0].bid_id, "bid-a");
        assert_eq!(request.page.domain.as_deref(), Some("news.publisher.test"));
        assert_eq!(request.privacy.gdpr, GdprSignal::Ambiguous);
    }

    #[test]
    fn test_parse_full_request() {
        let settings = create_test_settings();
        let mut value = minimal();
        value["timeout_millis"] = json!(10_000);
        value["cache_markup"] = json!(2);
        value["sort_bids"] = json!(1);
        value["max_key_length"] = json!(20);
        value["regs"] = json!({"ext": {"gdpr": 1, "us_privacy": "1YNN"}});
        value["user"] = json!({"ext": {"consent": "CONSENT"}});
        value["ad_units"][0]["bids"][0]["bid_id"] = json!("");

        let request = parse_auction_request(&settings, &HeaderMap::new(), &body(&value))
            .expect("should parse request");

        assert_eq!(request.timeout_ms, 500, "timeout is capped by max");
        assert_eq!(request.cache_markup, CacheMarkup::VideoOnly);
        assert!(request.sort_bids);
        assert_eq!(request.max_key_length, 20);
        assert_eq!(request.privacy.gdpr, GdprSignal::Yes);
        assert_eq!(request.privacy.consent, "CONSENT");
        assert_eq!(request.privacy.us_privacy, "1YNN");
        assert!(
            Uuid::parse_str(&request.ad_units[0].bids[0].bid_id).is_ok(),
            "missing bid id should be generated"
        );
    }

    #[test]
    fn test_rejects_bad_requests() {
        let settings = create_test_settings();
        let headers = HeaderMap::new();

        assert!(parse_auction_request(&settings, &headers, b"not json").is_err());

        let mut no_units = minimal();
        no_units["ad_units"] = json!([]);
        assert!(parse_auction_request(&settings, &headers, &body(&no_units)).is_err());

        let mut no_sizes = minimal();
        no_sizes["ad_units"][0]["sizes"] = json!([]);
        assert!(parse_auction_request(&settings, &headers, &body(&no_sizes)).is_err());

        let mut bad_cache = minimal();
        bad_cache["cache_markup"] = json!(7);
        assert!(parse_auction_request(&settings, &headers, &body(&bad_cache)).is_err());
    }

    #[test]
    fn test_account_validation() {
        let settings = create_test_settings();
        let headers = HeaderMap::new();

        let mut unknown = minimal();
        unknown["account_id"] = json!("nope");
        let err = parse_auction_request(&settings, &headers, &body(&unknown))
            .expect_err("unknown account should fail");
        assert!(matches!(
            err.current_context(),
            BidExchangeError::UnknownAccount { .. }
        ));

        let mut missing = minimal();
        missing
            .as_object_mut()
            .expect("should be an object")
            .remove("account_id");
        let err = parse_auction_request(&settings, &headers, &body(&missing))
            .expect_err("missing account should fail");
        assert!(matches!(
            err.current_context(),
            BidExchangeError::InvalidRequest { .. }
        ));
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut settings = create_test_settings();
        settings.host.max_request_size = 10;

        let result = parse_auction_request(&settings, &HeaderMap::new(), &body(&minimal()));
        assert!(result.is_err(), "body over the limit should be rejected");
    }

    #[test]
    fn test_partition_jobs() {
        let request = Arc::new(sample_auction_request());
        let jobs = partition_jobs(&request);

        let bidders: Vec<&str> = jobs.iter().map(|job| job.bidder.as_str()).collect();
        assert_eq!(bidders, vec!["alpha", "beta"]);

        let alpha: Vec<&str> = jobs[0].placements.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(alpha, vec!["div-1", "div-2"]);
        let beta: Vec<&str> = jobs[1].placements.iter().map(|p| p.code.as_str()).collect();
        assert_eq!(beta, vec!["div-1", "video-1"]);
        assert!(jobs.iter().all(|job| job.buyer_uid.is_none()));
    }
}
