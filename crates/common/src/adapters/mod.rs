//! Bidder adapter contract and registry.
//!
//! An adapter turns a [`BidderJob`] into outbound HTTP requests and turns
//! the partner's replies back into canonical bids. Adapters keep no state
//! between calls and may run concurrently for different bidders.

pub mod openrtb;

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::Display;
use http::StatusCode;

use crate::auction::types::{AdapterStatus, BidderJob, BidderResponse};
use crate::http_client::{OutboundRequest, RawResponse};
use crate::settings::Settings;

/// Failure category for a single bidder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum AdapterErrorKind {
    /// The request or bidder params were unusable, or the partner said 400.
    #[display("bad input")]
    BadInput,
    /// The partner replied with something we could not use.
    #[display("bad server response")]
    BadServerResponse,
    #[display("timeout")]
    Timeout,
    #[display("unknown")]
    Unknown,
}

impl AdapterErrorKind {
    #[must_use]
    pub fn status(self) -> AdapterStatus {
        match self {
            Self::BadInput => AdapterStatus::BadInput,
            Self::BadServerResponse => AdapterStatus::BadServerResponse,
            Self::Timeout => AdapterStatus::Timeout,
            Self::Unknown => AdapterStatus::Panic,
        }
    }
}

/// An error scoped to one bidder; never aborts the auction.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl core::error::Error for AdapterError {}

impl AdapterError {
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::BadInput,
            message: message.into(),
        }
    }

    pub fn bad_server_response(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::BadServerResponse,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: AdapterErrorKind::Timeout,
            message: message.into(),
        }
    }
}

/// Uniform capability every bidder implements.
pub trait Adapter: Send + Sync {
    /// Bidder code this adapter serves (e.g. "alpha").
    fn bidder_code(&self) -> &str;

    /// Builds the outbound request(s) for a job.
    ///
    /// Errors for malformed params are returned alongside whatever requests
    /// could still be built.
    fn build_requests(&self, job: &BidderJob) -> (Vec<OutboundRequest>, Vec<AdapterError>);

    /// Parses one partner reply. `None` means a silent no-bid.
    fn parse_response(
        &self,
        request: &OutboundRequest,
        response: &RawResponse,
    ) -> (Option<BidderResponse>, Vec<AdapterError>);
}

/// Maps a partner's HTTP status to whether its body should be decoded.
///
/// 204 is a silent no-bid (`Ok(false)`), 200 means decode (`Ok(true)`), 400
/// is [`AdapterErrorKind::BadInput`] and everything else is
/// [`AdapterErrorKind::BadServerResponse`].
///
/// # Errors
///
/// Returns the [`AdapterError`] for any status other than 200 or 204.
pub fn check_response_status(response: &RawResponse) -> Result<bool, AdapterError> {
    match response.status {
        StatusCode::NO_CONTENT => Ok(false),
        StatusCode::OK => Ok(true),
        StatusCode::BAD_REQUEST => Err(AdapterError::bad_input(format!(
            "Unexpected status code: 400. Body: {}",
            body_preview(response)
        ))),
        status => Err(AdapterError::bad_server_response(format!(
            "Unexpected status code: {}. Body: {}",
            status.as_u16(),
            body_preview(response)
        ))),
    }
}

fn body_preview(response: &RawResponse) -> String {
    let body = String::from_utf8_lossy(&response.body);
    body.chars().take(256).collect()
}

// ============================================================================
// Registry
// ============================================================================

/// Closed set of adapters keyed by bidder code.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bidders: Vec<&String> = self.adapters.keys().collect();
        bidders.sort();
        f.debug_struct("AdapterRegistry")
            .field("bidders", &bidders)
            .finish()
    }
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter, replacing any previous one for the same bidder.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        let code = adapter.bidder_code().to_string();
        log::info!("Registering bidder adapter: {}", code);
        self.adapters.insert(code, adapter);
    }

    #[must_use]
    pub fn get(&self, bidder: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(bidder).cloned()
    }

    #[must_use]
    pub fn contains(&self, bidder: &str) -> bool {
        self.adapters.contains_key(bidder)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Type alias for adapter builder functions.
type AdapterBuilder = fn(&Settings) -> Vec<Arc<dyn Adapter>>;

/// Every adapter family shipped with the exchange.
fn adapter_builders() -> &'static [AdapterBuilder] {
    &[openrtb::register_adapters]
}

/// Builds the registry for the current settings.
#[must_use]
pub fn build_registry(settings: &Settings) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();

    for builder in adapter_builders() {
        for adapter in builder(settings) {
            registry.register(adapter);
        }
    }

    log::info!("Adapter registry built with {} bidders", registry.len());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tests::create_test_settings;

    #[test]
    fn test_check_response_status() {
        assert_eq!(
            check_response_status(&RawResponse::new(StatusCode::OK, "{}")),
            Ok(true)
        );
        assert_eq!(
            check_response_status(&RawResponse::new(StatusCode::NO_CONTENT, "")),
            Ok(false)
        );

        let bad_input = check_response_status(&RawResponse::new(StatusCode::BAD_REQUEST, "nope"))
            .expect_err("400 should be an error");
        assert_eq!(bad_input.kind, AdapterErrorKind::BadInput);
        assert!(bad_input.message.contains("nope"));

        let server = check_response_status(&RawResponse::new(StatusCode::BAD_GATEWAY, ""))
            .expect_err("502 should be an error");
        assert_eq!(server.kind, AdapterErrorKind::BadServerResponse);
    }

    #[test]
    fn test_error_kind_status() {
        assert_eq!(AdapterErrorKind::BadInput.status(), AdapterStatus::BadInput);
        assert_eq!(AdapterErrorKind::Timeout.status(), AdapterStatus::Timeout);
        assert_eq!(AdapterErrorKind::Unknown.status(), AdapterStatus::Panic);
    }

    #[test]
    fn test_build_registry_skips_disabled() {
        let registry = build_registry(&create_test_settings());

        assert!(registry.contains("alpha"));
        assert!(registry.contains("beta"));
        assert!(!registry.contains("gamma"), "disabled adapters are not registered");
        assert_eq!(registry.len(), 2);
    }
}
