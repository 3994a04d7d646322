//! Tracking event URLs and VAST impression injection.

pub mod vast;
pub mod vtrack;

use url::form_urlencoded;

use crate::settings::Settings;

/// Event being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Win,
    Imp,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win => "win",
            Self::Imp => "imp",
        }
    }
}

/// What the event endpoint replies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFormat {
    /// Empty 204.
    Blank,
    /// 1x1 pixel.
    Image,
}

impl EventFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::Blank => "b",
            Self::Image => "i",
        }
    }
}

/// One tracking event to encode as a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRequest<'a> {
    pub event_type: EventType,
    pub bid_id: &'a str,
    pub account_id: &'a str,
    pub bidder: Option<&'a str>,
    /// Milliseconds since epoch, 0 to omit.
    pub timestamp: i64,
    pub format: Option<EventFormat>,
    /// Whether downstream analytics should record the event.
    pub analytics: Option<bool>,
}

/// Builds `<external_url>/event?t=..&b=..&a=..` plus optional parameters.
///
/// Optional parameters are form-encoded in name order: `bidder`, `f`, `ts`, `x`.
#[must_use]
pub fn event_url(external_url: &str, request: &EventRequest<'_>) -> String {
    let mut url = format!(
        "{}/event?t={}&b={}&a={}",
        external_url.trim_end_matches('/'),
        request.event_type.as_str(),
        request.bid_id,
        request.account_id
    );

    let mut optional = form_urlencoded::Serializer::new(String::new());
    if let Some(bidder) = request.bidder.filter(|bidder| !bidder.is_empty()) {
        optional.append_pair("bidder", bidder);
    }
    if let Some(format) = request.format {
        optional.append_pair("f", format.as_str());
    }
    if request.timestamp > 0 {
        optional.append_pair("ts", &request.timestamp.to_string());
    }
    if let Some(analytics) = request.analytics {
        optional.append_pair("x", if analytics { "1" } else { "0" });
    }

    let optional = optional.finish();
    if !optional.is_empty() {
        url.push('&');
        url.push_str(&optional);
    }
    url
}

/// Whether VAST from `bidder` may carry injected tracking.
///
/// Configured bidders must be enabled and opted in; bidders this exchange
/// has no adapter for follow `events.allow_unknown_bidder`.
#[must_use]
pub fn vast_modification_allowed(settings: &Settings, bidder: &str) -> bool {
    match settings.adapters.get(bidder) {
        Some(adapter) => adapter.enabled && adapter.modifying_vast_xml_allowed,
        None => settings.events.allow_unknown_bidder,
    }
}
