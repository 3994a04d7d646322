//! Exchange configuration.
//!
//! Settings come from a TOML document with environment overrides layered on
//! top (`BID_EXCHANGE__HOST__EXTERNAL_URL=...`), then pass through
//! [`validator`] checks before the server starts.

use std::collections::HashMap;
use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::BidExchangeError;

pub const ENVIRONMENT_VARIABLE_PREFIX: &str = "BID_EXCHANGE";
pub const ENVIRONMENT_VARIABLE_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Host {
    /// Public base URL of this exchange, used for event and sync callbacks.
    #[validate(url)]
    pub external_url: String,
    #[serde(default)]
    pub cookie_domain: String,
    #[serde(default = "default_uids_ttl_days")]
    #[validate(range(min = 1, max = 365))]
    pub uids_cookie_ttl_days: u32,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

fn default_uids_ttl_days() -> u32 {
    14
}

fn default_max_request_size() -> usize {
    512 * 1024
}

/// Auction deadline bounds in milliseconds. Zero means unset.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct AuctionTimeouts {
    #[serde(default)]
    pub default_ms: u64,
    #[serde(default)]
    pub max_ms: u64,
}

impl AuctionTimeouts {
    /// Clamps the deadline a request asked for.
    ///
    /// An unset request takes the default, or the max when there is no
    /// default. A non-zero max always caps the result.
    #[must_use]
    pub fn limit(&self, requested_ms: u64) -> u64 {
        let mut timeout = requested_ms;
        if timeout == 0 {
            timeout = self.default_ms;
        }
        if timeout == 0 {
            timeout = self.max_ms;
        }
        if self.max_ms > 0 && timeout > self.max_ms {
            timeout = self.max_ms;
        }
        timeout
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Cache {
    #[serde(default = "default_cache_scheme")]
    pub scheme: String,
    #[validate(length(min = 1))]
    pub host: String,
    #[serde(default = "default_cache_query")]
    pub query: String,
    #[serde(default = "default_cache_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_cache_scheme() -> String {
    "https".to_string()
}

fn default_cache_query() -> String {
    "uuid=%PBS_CACHE_UUID%".to_string()
}

fn default_cache_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Gdpr {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Vendor id the host itself needs consent for. 0 skips the vendor check.
    #[serde(default)]
    pub host_vendor_id: u16,
    /// Allow syncs when the request does not say whether GDPR applies.
    #[serde(default)]
    pub usersync_if_ambiguous: bool,
    /// Signal assumed when a request carries none ("0" or "1"). Unset leaves
    /// such requests ambiguous.
    #[serde(default)]
    #[validate(length(min = 1, max = 1))]
    pub default_value: Option<String>,
}

impl Default for Gdpr {
    fn default() -> Self {
        Self {
            enabled: true,
            host_vendor_id: 0,
            usersync_if_ambiguous: false,
            default_value: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Events {
    /// Inject VAST tracking for bidders this exchange has no adapter for.
    #[serde(default)]
    pub allow_unknown_bidder: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UsersyncType {
    #[default]
    Redirect,
    Iframe,
}

/// Per-bidder adapter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AdapterConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[validate(url)]
    pub endpoint: String,
    /// Cookie family; defaults to the bidder code.
    pub family: Option<String>,
    /// Global vendor list id used for consent checks.
    #[serde(default)]
    pub vendor_id: u16,
    #[serde(default)]
    pub modifying_vast_xml_allowed: bool,
    pub usersync_url: Option<String>,
    #[serde(default)]
    pub usersync_type: UsersyncType,
    #[serde(default)]
    pub supports_cors: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AccountConfig {
    pub price_granularity: Option<String>,
    #[serde(default)]
    pub events_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Auction {
    #[serde(default = "default_true")]
    pub account_required: bool,
    #[serde(default = "default_price_granularity")]
    pub default_price_granularity: String,
}

impl Default for Auction {
    fn default() -> Self {
        Self {
            account_required: true,
            default_price_granularity: default_price_granularity(),
        }
    }
}

fn default_price_granularity() -> String {
    "med".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    pub host: Host,
    #[serde(default)]
    #[validate(nested)]
    pub auction_timeouts: AuctionTimeouts,
    #[validate(nested)]
    pub cache: Cache,
    #[serde(default)]
    #[validate(nested)]
    pub gdpr: Gdpr,
    #[serde(default)]
    pub events: Events,
    #[serde(default)]
    pub adapters: HashMap<String, AdapterConfig>,
    #[serde(default)]
    pub accounts: HashMap<String, AccountConfig>,
    #[serde(default)]
    #[validate(nested)]
    pub auction: Auction,
    #[serde(default)]
    pub logging: Logging,
}

impl Settings {
    /// Builds settings from a TOML string with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Configuration`] when the TOML is invalid or
    /// required fields are missing.
    pub fn from_toml(toml_str: &str) -> Result<Self, Report<BidExchangeError>> {
        let environment = Environment::default()
            .prefix(ENVIRONMENT_VARIABLE_PREFIX)
            .separator(ENVIRONMENT_VARIABLE_SEPARATOR);

        let toml = File::from_str(toml_str, FileFormat::Toml);
        let config = Config::builder()
            .add_source(toml)
            .add_source(environment)
            .build()
            .change_context(BidExchangeError::Configuration {
                message: "Failed to build configuration".to_string(),
            })?;

        config
            .try_deserialize()
            .change_context(BidExchangeError::Configuration {
                message: "Failed to deserialize configuration".to_string(),
            })
    }

    /// Loads and validates settings from a TOML file on disk.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Configuration`] when the file cannot be
    /// read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, Report<BidExchangeError>> {
        let toml_str = std::fs::read_to_string(path).change_context(
            BidExchangeError::Configuration {
                message: format!("Failed to read settings file {}", path.display()),
            },
        )?;

        let settings = Self::from_toml(&toml_str)?;
        settings.validated()
    }

    /// Runs field validation, including each adapter entry.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Configuration`] naming the first failing section.
    pub fn validated(self) -> Result<Self, Report<BidExchangeError>> {
        self.validate()
            .change_context(BidExchangeError::Configuration {
                message: "Settings validation failed".to_string(),
            })?;

        for (bidder, adapter) in &self.adapters {
            adapter
                .validate()
                .change_context(BidExchangeError::Configuration {
                    message: format!("Adapter '{bidder}' settings are invalid"),
                })?;
        }

        Ok(self)
    }

    /// Cookie family for a bidder, if the bidder is configured.
    #[must_use]
    pub fn family_for<'a>(&'a self, bidder: &'a str) -> Option<&'a str> {
        self.adapters
            .get(bidder)
            .map(|adapter| adapter.family.as_deref().unwrap_or(bidder))
    }

    /// Finds the bidder code configured for a cookie family.
    #[must_use]
    pub fn bidder_for_family(&self, family: &str) -> Option<&str> {
        self.adapters.iter().find_map(|(bidder, adapter)| {
            let adapter_family = adapter.family.as_deref().unwrap_or(bidder);
            (adapter_family == family).then_some(bidder.as_str())
        })
    }

    /// Price granularity name for an account, falling back to the auction default.
    #[must_use]
    pub fn price_granularity_for(&self, account_id: &str) -> &str {
        self.accounts
            .get(account_id)
            .and_then(|account| account.price_granularity.as_deref())
            .unwrap_or(&self.auction.default_price_granularity)
    }
}
