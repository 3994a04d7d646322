//! The `uids` cookie: which bidder families this browser is synced with.
//!
//! The cookie value is base64url-encoded JSON:
//! `{"tempUIDs": {"<family>": {"uid": "...", "expires": "<rfc3339>"}}, "optout": false, "bday": "<rfc3339>"}`.
//! The auction path only reads it; the setuid endpoint rewrites it.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use error_stack::{Report, ResultExt};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::constants::UIDS_COOKIE_NAME;
use crate::cookies::{build_set_cookie, cookie_value};
use crate::error::BidExchangeError;
use crate::settings::Settings;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct UidWithExpiry {
    uid: String,
    expires: DateTime<Utc>,
}

/// Per-browser sync state carried in the `uids` cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    #[serde(rename = "tempUIDs", default)]
    uids: HashMap<String, UidWithExpiry>,
    #[serde(default)]
    optout: bool,
    #[serde(default = "Utc::now")]
    bday: DateTime<Utc>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            uids: HashMap::new(),
            optout: false,
            bday: Utc::now(),
        }
    }
}

impl SyncState {
    /// Decodes a cookie value. Anything unreadable yields a fresh state.
    #[must_use]
    pub fn from_cookie_value(value: &str) -> Self {
        let decoded = match URL_SAFE_NO_PAD.decode(value.trim_end_matches('=')) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::debug!("Ignoring uids cookie with bad encoding: {}", e);
                return Self::default();
            }
        };

        match serde_json::from_slice::<Self>(&decoded) {
            Ok(mut state) => {
                if state.optout {
                    state.uids.clear();
                }
                state
            }
            Err(e) => {
                log::debug!("Ignoring uids cookie with bad JSON: {}", e);
                Self::default()
            }
        }
    }

    /// Reads the `uids` cookie from request headers.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        cookie_value(headers, UIDS_COOKIE_NAME)
            .map(|value| Self::from_cookie_value(&value))
            .unwrap_or_default()
    }

    /// Encodes the state as a cookie value.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Serialization`] if encoding fails.
    pub fn to_cookie_value(&self) -> Result<String, Report<BidExchangeError>> {
        let json = serde_json::to_vec(self).change_context(BidExchangeError::Serialization {
            message: "Failed to encode uids cookie".to_string(),
        })?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Full `Set-Cookie` header value for this state.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Serialization`] if encoding fails.
    pub fn to_set_cookie(&self, settings: &Settings) -> Result<String, Report<BidExchangeError>> {
        Ok(build_set_cookie(
            UIDS_COOKIE_NAME,
            &self.to_cookie_value()?,
            &settings.host.cookie_domain,
            settings.host.uids_cookie_ttl_days,
        ))
    }

    /// The live uid for `family`, if any.
    #[must_use]
    pub fn uid(&self, family: &str) -> Option<&str> {
        let now = Utc::now();
        self.uids
            .get(family)
            .filter(|entry| entry.expires > now && !entry.uid.is_empty())
            .map(|entry| entry.uid.as_str())
    }

    #[must_use]
    pub fn has_live_sync(&self, family: &str) -> bool {
        self.uid(family).is_some()
    }

    /// Number of families with an unexpired uid.
    #[must_use]
    pub fn sync_count(&self) -> usize {
        let now = Utc::now();
        self.uids
            .values()
            .filter(|entry| entry.expires > now && !entry.uid.is_empty())
            .count()
    }

    #[must_use]
    pub fn is_opted_out(&self) -> bool {
        self.optout
    }

    /// Opting out drops every stored uid.
    pub fn set_opt_out(&mut self, opt_out: bool) {
        self.optout = opt_out;
        if opt_out {
            self.uids.clear();
        }
    }

    /// Stores `uid` for `family`, valid for `ttl`. Ignored while opted out.
    pub fn set_uid(&mut self, family: &str, uid: &str, ttl: Duration) {
        if self.optout {
            return;
        }
        self.uids.insert(
            family.to_string(),
            UidWithExpiry {
                uid: uid.to_string(),
                expires: Utc::now() + ttl,
            },
        );
    }

    pub fn delete_uid(&mut self, family: &str) {
        self.uids.remove(family);
    }
}
