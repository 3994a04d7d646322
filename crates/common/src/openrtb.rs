use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimal subset of OpenRTB 2.x bid request sent to bidders.
#[derive(Debug, Serialize, Deserialize)]
pub struct OpenRtbRequest {
    /// Unique ID of the bid request, provided by the exchange.
    pub id: String,
    pub imp: Vec<Imp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site: Option<Site>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regs: Option<Regs>,
    /// Maximum time in milliseconds the bidder has to respond.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmax: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cur: Vec<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Imp {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<Banner>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Video>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<ImpExt>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Banner {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub format: Vec<Format>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Video {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub w: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mimes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Format {
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImpExt {
    /// Bidder-specific parameters copied from the ad unit.
    pub bidder: Value,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Site {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buyeruid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<UserExt>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct UserExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Regs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<RegsExt>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct RegsExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdpr: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub us_privacy: Option<String>,
}

/// Minimal subset of OpenRTB 2.x bid response read back from bidders.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct OpenRtbResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub seatbid: Vec<SeatBid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cur: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct SeatBid {
    #[serde(default)]
    pub bid: Vec<Bid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seat: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Bid {
    #[serde(default)]
    pub id: String,
    pub impid: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nurl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dealid: Option<String>,
    #[serde(default)]
    pub w: u32,
    #[serde(default)]
    pub h: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<BidExt>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct BidExt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prebid: Option<BidExtPrebid>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct BidExtPrebid {
    /// Media type the bidder claims for this bid ("banner", "video", "native").
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub bid_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_priority: Option<u32>,
}
