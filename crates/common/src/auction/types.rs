//! Core types for auction requests, bidder jobs and responses.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::privacy::PrivacyPolicy;
use crate::usersync::UsersyncInfo;

/// Media type enumeration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    #[default]
    Banner,
    Video,
    Native,
}

impl MediaType {
    /// Parses the media type names bidders put in bid extensions.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "banner" => Some(Self::Banner),
            "video" => Some(Self::Video),
            "native" => Some(Self::Native),
            _ => None,
        }
    }
}

/// Creative size in pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Size {
    pub w: u32,
    pub h: u32,
}

/// Which bids get their markup moved into the creative cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMarkup {
    /// Markup stays inline.
    #[default]
    None,
    /// Every bid is cached.
    All,
    /// Only video bids are cached.
    VideoOnly,
}

impl CacheMarkup {
    #[must_use]
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(Self::None),
            1 => Some(Self::All),
            2 => Some(Self::VideoOnly),
            _ => None,
        }
    }

    /// Whether a bid of this media type must be cached.
    #[must_use]
    pub fn applies_to(self, media_type: MediaType) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::VideoOnly => media_type == MediaType::Video,
        }
    }
}

/// One bidder's entry in an ad unit.
#[derive(Debug, Clone)]
pub struct PlacementBid {
    pub bidder: String,
    /// Exchange-assigned id echoed back on the bid.
    pub bid_id: String,
    pub params: Value,
}

/// An orderable ad slot as described by the publisher.
#[derive(Debug, Clone)]
pub struct AdUnit {
    pub code: String,
    pub sizes: Vec<Size>,
    pub media_types: Vec<MediaType>,
    pub bids: Vec<PlacementBid>,
}

impl AdUnit {
    /// Bid id assigned to `bidder` in this unit.
    #[must_use]
    pub fn bid_id_for(&self, bidder: &str) -> Option<&str> {
        self.bids
            .iter()
            .find(|bid| bid.bidder == bidder)
            .map(|bid| bid.bid_id.as_str())
    }
}

/// Page the auction runs on, taken from the `Referer` header.
#[derive(Debug, Clone, Default)]
pub struct PageContext {
    pub url: Option<String>,
    pub domain: Option<String>,
}

/// Canonical auction request, immutable once dispatch begins.
#[derive(Debug, Clone)]
pub struct AuctionRequest {
    pub account_id: String,
    pub tid: String,
    /// Deadline budget after clamping.
    pub timeout_ms: u64,
    pub cache_markup: CacheMarkup,
    pub sort_bids: bool,
    /// Targeting key length limit, 0 for none.
    pub max_key_length: usize,
    pub ad_units: Vec<AdUnit>,
    pub page: PageContext,
    pub app: Option<Value>,
    pub device: Option<Value>,
    pub privacy: PrivacyPolicy,
}

impl AuctionRequest {
    #[must_use]
    pub fn ad_unit(&self, code: &str) -> Option<&AdUnit> {
        self.ad_units.iter().find(|unit| unit.code == code)
    }

    /// Distinct bidder codes in first-seen order.
    #[must_use]
    pub fn bidders(&self) -> Vec<String> {
        let mut bidders: Vec<String> = Vec::new();
        for unit in &self.ad_units {
            for bid in &unit.bids {
                if !bidders.contains(&bid.bidder) {
                    bidders.push(bid.bidder.clone());
                }
            }
        }
        bidders
    }
}

/// A bidder's view of one ad unit.
#[derive(Debug, Clone)]
pub struct BidderPlacement {
    pub code: String,
    pub sizes: Vec<Size>,
    pub media_types: Vec<MediaType>,
    pub bid_id: String,
    pub params: Value,
}

/// One bidder paired with the placements it bids on.
#[derive(Debug, Clone)]
pub struct BidderJob {
    pub bidder: String,
    pub placements: Vec<BidderPlacement>,
    /// Shared read-only request.
    pub request: Arc<AuctionRequest>,
    /// Bidder's id for this user, present only when consent allows sharing it.
    pub buyer_uid: Option<String>,
}

/// A bidder's offer as parsed from its response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBid {
    pub id: String,
    /// Ad unit code this bid is for.
    pub impid: String,
    pub price: f64,
    pub adm: Option<String>,
    pub nurl: Option<String>,
    pub crid: Option<String>,
    pub w: u32,
    pub h: u32,
    pub deal_id: Option<String>,
}

/// A bid tagged with its media type and deal metadata.
#[derive(Debug, Clone)]
pub struct TypedBid {
    pub bid: RawBid,
    pub media_type: MediaType,
    pub deal_priority: u32,
    pub meta: Option<Value>,
}

/// Everything an adapter parsed out of one response.
#[derive(Debug, Clone)]
pub struct BidderResponse {
    pub currency: String,
    pub bids: Vec<TypedBid>,
}

impl BidderResponse {
    #[must_use]
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            bids: Vec::new(),
        }
    }
}

/// Per-bidder outcome of a dispatched job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Ok,
    NoBid,
    Timeout,
    BadInput,
    BadServerResponse,
    Panic,
}

impl AdapterStatus {
    /// Wire name, also used as a metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NoBid => "no_bid",
            Self::Timeout => "timeout",
            Self::BadInput => "bad_input",
            Self::BadServerResponse => "bad_server_response",
            Self::Panic => "panic",
        }
    }
}

/// What a bidder job reported back to the dispatcher.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub bidder: String,
    pub status: AdapterStatus,
    pub currency: String,
    pub bids: Vec<TypedBid>,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

impl JobResult {
    /// Result recorded for a job that missed the deadline.
    pub fn timed_out(bidder: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            bidder: bidder.into(),
            status: AdapterStatus::Timeout,
            currency: String::new(),
            bids: Vec::new(),
            errors: vec!["Timed out".to_string()],
            elapsed_ms,
        }
    }

    /// Result recorded for a job whose task panicked.
    pub fn panicked(bidder: impl Into<String>, message: String, elapsed_ms: u64) -> Self {
        Self {
            bidder: bidder.into(),
            status: AdapterStatus::Panic,
            currency: String::new(),
            bids: Vec::new(),
            errors: vec![message],
            elapsed_ms,
        }
    }
}

/// A bid enriched for emission: size fixed up, cache handle, targeting keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregatedBid {
    pub code: String,
    pub bid_id: String,
    pub bidder: String,
    pub creative_id: String,
    pub price: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nurl: Option<String>,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_id: Option<String>,
    pub media_type: MediaType,
    #[serde(default)]
    pub deal_priority: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ad_server_targeting: BTreeMap<String, String>,
}

/// Status reported for each bidder named in the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BidderStatus {
    pub bidder: String,
    pub ad_unit_count: usize,
    pub status: AdapterStatus,
    pub response_time_ms: u64,
    pub num_bids: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub no_cookie: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usersync: Option<UsersyncInfo>,
}

impl BidderStatus {
    /// Status for a bidder that never reached dispatch.
    pub fn rejected(bidder: impl Into<String>, ad_unit_count: usize, error: String) -> Self {
        Self {
            bidder: bidder.into(),
            ad_unit_count,
            status: AdapterStatus::BadInput,
            response_time_ms: 0,
            num_bids: 0,
            error: Some(error),
            no_cookie: false,
            usersync: None,
        }
    }
}

/// Body of a successful auction response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionResponse {
    pub tid: String,
    pub status: String,
    pub bidder_status: Vec<BidderStatus>,
    pub bids: Vec<AggregatedBid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_markup_from_flag() {
        assert_eq!(CacheMarkup::from_flag(0), Some(CacheMarkup::None));
        assert_eq!(CacheMarkup::from_flag(1), Some(CacheMarkup::All));
        assert_eq!(CacheMarkup::from_flag(2), Some(CacheMarkup::VideoOnly));
        assert_eq!(CacheMarkup::from_flag(3), None);
    }

    #[test]
    fn test_cache_markup_applies_to() {
        assert!(CacheMarkup::All.applies_to(MediaType::Banner));
        assert!(CacheMarkup::VideoOnly.applies_to(MediaType::Video));
        assert!(!CacheMarkup::VideoOnly.applies_to(MediaType::Banner));
        assert!(!CacheMarkup::None.applies_to(MediaType::Video));
    }

    #[test]
    fn test_adapter_status_serializes_snake_case() {
        let json = serde_json::to_string(&AdapterStatus::BadServerResponse)
            .expect("should serialize status");
        assert_eq!(json, "\"bad_server_response\"");
    }

    #[test]
    fn test_adapter_status_label_matches_wire_name() {
        for status in [
            AdapterStatus::Ok,
            AdapterStatus::NoBid,
            AdapterStatus::Timeout,
            AdapterStatus::BadInput,
            AdapterStatus::BadServerResponse,
            AdapterStatus::Panic,
        ] {
            let json = serde_json::to_string(&status).expect("should serialize status");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }
}
