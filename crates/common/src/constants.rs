use http::header::HeaderName;

pub const HEADER_X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Browser cookie holding per-family sync state.
pub const UIDS_COOKIE_NAME: &str = "uids";

/// Placeholder in the cache retrieval query replaced by the stored object's uuid.
pub const CACHE_UUID_MACRO: &str = "%PBS_CACHE_UUID%";

pub const TARGETING_KEY_PRICE: &str = "hb_pb";
pub const TARGETING_KEY_BIDDER: &str = "hb_bidder";
pub const TARGETING_KEY_CACHE_ID: &str = "hb_cache_id";
pub const TARGETING_KEY_DEAL: &str = "hb_deal";
pub const TARGETING_KEY_SIZE: &str = "hb_size";

pub const STATUS_OK: &str = "OK";
pub const STATUS_NO_COOKIE: &str = "no_cookie";
