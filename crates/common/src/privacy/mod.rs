//! Consent gating for usersyncs and bidder user ids.
//!
//! A [`PrivacyPolicy`] is captured once per request and shared read-only with
//! every bidder job. The [`PrivacyGate`] answers whether the host, or a given
//! bidder, may sync or receive user ids under that policy.

pub mod tcf;

use std::collections::HashMap;

use crate::settings::Settings;

/// Whether GDPR applies to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GdprSignal {
    No,
    Yes,
    #[default]
    Ambiguous,
}

impl GdprSignal {
    /// Parses the `"0"`/`"1"` wire form; anything else is ambiguous.
    #[must_use]
    pub fn from_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some("0") => Self::No,
            Some("1") => Self::Yes,
            _ => Self::Ambiguous,
        }
    }

    /// Like [`Self::from_value`], falling back to `default` when the request
    /// carries no signal.
    #[must_use]
    pub fn resolve(value: Option<&str>, default: Option<&str>) -> Self {
        match value.filter(|v| !v.trim().is_empty()) {
            Some(value) => Self::from_value(Some(value)),
            None => Self::from_value(default),
        }
    }

    /// Value substituted for the `{{GDPR}}` macro.
    #[must_use]
    pub fn macro_value(self) -> &'static str {
        match self {
            Self::No => "0",
            Self::Yes => "1",
            Self::Ambiguous => "",
        }
    }
}

/// Consent snapshot for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivacyPolicy {
    pub gdpr: GdprSignal,
    pub consent: String,
    pub us_privacy: String,
}

impl PrivacyPolicy {
    #[must_use]
    pub fn new(gdpr: GdprSignal, consent: impl Into<String>, us_privacy: impl Into<String>) -> Self {
        Self {
            gdpr,
            consent: consent.into(),
            us_privacy: us_privacy.into(),
        }
    }
}

/// Consent decisions used by the usersync and auction paths.
pub trait Permissions: Send + Sync {
    /// May the host read or write its own sync cookie.
    fn host_sync_allowed(&self, policy: &PrivacyPolicy) -> bool;

    /// May `bidder` be offered a usersync, or receive its stored user id.
    fn bidder_sync_allowed(&self, bidder: &str, policy: &PrivacyPolicy) -> bool;
}

/// Purpose 1: store and/or access information on a device.
const PURPOSE_STORAGE: u16 = 1;

/// TCF v2 backed [`Permissions`].
#[derive(Debug, Clone)]
pub struct PrivacyGate {
    enabled: bool,
    host_vendor_id: u16,
    usersync_if_ambiguous: bool,
    vendor_ids: HashMap<String, u16>,
}

impl PrivacyGate {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            enabled: settings.gdpr.enabled,
            host_vendor_id: settings.gdpr.host_vendor_id,
            usersync_if_ambiguous: settings.gdpr.usersync_if_ambiguous,
            vendor_ids: settings
                .adapters
                .iter()
                .map(|(bidder, adapter)| (bidder.clone(), adapter.vendor_id))
                .collect(),
        }
    }

    /// Resolves the signal/consent pair to a vendor check outcome.
    ///
    /// `vendor_id` of `None` skips the vendor check; `Some(0)` means the
    /// vendor is unknown and denied when GDPR applies.
    fn allowed(&self, vendor_id: Option<u16>, policy: &PrivacyPolicy) -> bool {
        if !self.enabled {
            return true;
        }

        match policy.gdpr {
            GdprSignal::No => return true,
            GdprSignal::Ambiguous if !self.usersync_if_ambiguous => return false,
            GdprSignal::Ambiguous if policy.consent.is_empty() => return true,
            GdprSignal::Ambiguous | GdprSignal::Yes => {}
        }

        if policy.consent.is_empty() {
            return false;
        }

        let consent = match tcf::parse_consent(&policy.consent) {
            Ok(consent) => consent,
            Err(e) => {
                log::debug!("Treating unparseable consent as denied: {:?}", e);
                return false;
            }
        };

        if !consent.purpose_allowed(PURPOSE_STORAGE) {
            return false;
        }

        match vendor_id {
            None => true,
            Some(id) => consent.vendor_allowed(id),
        }
    }
}

impl Permissions for PrivacyGate {
    fn host_sync_allowed(&self, policy: &PrivacyPolicy) -> bool {
        let host_vendor = (self.host_vendor_id != 0).then_some(self.host_vendor_id);
        self.allowed(host_vendor, policy)
    }

    fn bidder_sync_allowed(&self, bidder: &str, policy: &PrivacyPolicy) -> bool {
        let vendor_id = self.vendor_ids.get(bidder).copied().unwrap_or(0);
        self.allowed(Some(vendor_id), policy)
    }
}
