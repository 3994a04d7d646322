//! `GET /setuid` and `POST /cookie_sync` handlers.

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use http::{header, HeaderValue, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::BidExchangeError;
use crate::http_util::{json_response, query_param};
use crate::privacy::{GdprSignal, Permissions, PrivacyPolicy};
use crate::settings::Settings;

use super::cookie::SyncState;
use super::{UsersyncCoordinator, UsersyncInfo};

/// Resolves the `bidder` query value, which may be a bidder code or a family.
fn family_for_param<'a>(settings: &'a Settings, value: &'a str) -> Option<&'a str> {
    settings
        .family_for(value)
        .or_else(|| settings.bidder_for_family(value).map(|_| value))
}

/// Records the uid a partner assigned to this browser.
///
/// An empty `uid` removes the family. Replies 200 with the rewritten cookie.
///
/// # Errors
///
/// - [`BidExchangeError::OptedOut`] when the browser opted out
/// - [`BidExchangeError::InvalidRequest`] without a `bidder` parameter
/// - [`BidExchangeError::UnsupportedBidder`] for an unknown bidder or family
/// - [`BidExchangeError::ConsentDenied`] when the host may not set its cookie
pub fn handle_setuid(
    settings: &Settings,
    permissions: &dyn Permissions,
    req: &Request<Bytes>,
) -> Result<Response<String>, Report<BidExchangeError>> {
    let mut state = SyncState::from_headers(req.headers());
    if state.is_opted_out() {
        return Err(Report::new(BidExchangeError::OptedOut));
    }

    let uri = req.uri();
    let bidder = query_param(uri, "bidder")
        .filter(|bidder| !bidder.is_empty())
        .ok_or_else(|| {
            Report::new(BidExchangeError::InvalidRequest {
                message: "\"bidder\" query param is required".to_string(),
            })
        })?;
    let family = family_for_param(settings, &bidder).ok_or_else(|| {
        Report::new(BidExchangeError::UnsupportedBidder {
            bidder: bidder.clone(),
        })
    })?;

    let gdpr = query_param(uri, "gdpr");
    let policy = PrivacyPolicy::new(
        GdprSignal::resolve(gdpr.as_deref(), settings.gdpr.default_value.as_deref()),
        query_param(uri, "gdpr_consent").unwrap_or_default(),
        "",
    );
    if !permissions.host_sync_allowed(&policy) {
        return Err(Report::new(BidExchangeError::ConsentDenied));
    }

    match query_param(uri, "uid").filter(|uid| !uid.is_empty()) {
        Some(uid) => {
            log::info!("Setting uid for family '{}'", family);
            let ttl = chrono::Duration::days(i64::from(settings.host.uids_cookie_ttl_days));
            state.set_uid(family, &uid, ttl);
        }
        None => {
            log::info!("Removing uid for family '{}'", family);
            state.delete_uid(family);
        }
    }

    let set_cookie = state.to_set_cookie(settings)?;
    let mut response = Response::new(String::new());
    response.headers_mut().insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&set_cookie).change_context(BidExchangeError::Serialization {
            message: "uids cookie is not a valid header value".to_string(),
        })?,
    );
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
struct CookieSyncRequest {
    #[serde(default)]
    bidders: Vec<String>,
    #[serde(default)]
    gdpr: Option<u8>,
    #[serde(default)]
    gdpr_consent: Option<String>,
    #[serde(default)]
    us_privacy: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CookieSyncBidder {
    pub bidder: String,
    pub no_cookie: bool,
    pub usersync: UsersyncInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CookieSyncResponse {
    pub status: String,
    pub bidder_status: Vec<CookieSyncBidder>,
}

/// Lists sync pixels for the requested bidders this browser is not synced with.
///
/// An empty `bidders` list means every bidder with a syncer.
///
/// # Errors
///
/// - [`BidExchangeError::OptedOut`] when the browser opted out
/// - [`BidExchangeError::InvalidRequest`] for a malformed body
pub fn handle_cookie_sync(
    settings: &Settings,
    coordinator: &UsersyncCoordinator,
    permissions: &dyn Permissions,
    req: &Request<Bytes>,
) -> Result<Response<String>, Report<BidExchangeError>> {
    let state = SyncState::from_headers(req.headers());
    if state.is_opted_out() {
        return Err(Report::new(BidExchangeError::OptedOut));
    }

    let body: CookieSyncRequest = if req.body().is_empty() {
        CookieSyncRequest::default()
    } else {
        serde_json::from_slice(req.body()).change_context(BidExchangeError::InvalidRequest {
            message: "Unable to parse cookie sync request".to_string(),
        })?
    };

    let gdpr = body.gdpr.map(|gdpr| gdpr.to_string());
    let policy = PrivacyPolicy::new(
        GdprSignal::resolve(gdpr.as_deref(), settings.gdpr.default_value.as_deref()),
        body.gdpr_consent.unwrap_or_default(),
        body.us_privacy.unwrap_or_default(),
    );

    let bidders: Vec<String> = if body.bidders.is_empty() {
        coordinator.bidders().into_iter().map(str::to_string).collect()
    } else {
        body.bidders
    };

    let mut bidder_status = Vec::new();
    if permissions.host_sync_allowed(&policy) {
        for bidder in bidders {
            let annotation = coordinator.annotate(&bidder, &state, &policy, permissions);
            if let (true, Some(usersync)) = (annotation.no_cookie, annotation.usersync) {
                bidder_status.push(CookieSyncBidder {
                    bidder,
                    no_cookie: true,
                    usersync,
                });
            }
        }
    } else {
        log::debug!("Host sync not allowed, returning no syncs");
    }

    let status = if state.sync_count() == 0 {
        "no_cookie"
    } else {
        "ok"
    };

    json_response(
        StatusCode::OK,
        &CookieSyncResponse {
            status: status.to_string(),
            bidder_status,
        },
    )
}
