//! Usersync URL building and per-bidder sync annotation.
//!
//! Each configured bidder with a `usersync_url` gets a [`Syncer`]. Templates
//! use `{{GDPR}}`, `{{GDPRConsent}}` and `{{USPrivacy}}` macros, rendered with
//! percent-encoding. Unknown macros render empty.

pub mod cookie;
pub mod endpoints;

use std::collections::HashMap;

use error_stack::{Report, ResultExt};
use handlebars::Handlebars;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::BidExchangeError;
use crate::privacy::{Permissions, PrivacyPolicy};
use crate::settings::{Settings, UsersyncType};

use self::cookie::SyncState;

/// Pixel a page should fire to sync one bidder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsersyncInfo {
    pub url: String,
    #[serde(rename = "type")]
    pub sync_type: UsersyncType,
    #[serde(rename = "supportCORS")]
    pub support_cors: bool,
}

/// Compiled usersync template for one bidder.
#[derive(Debug)]
pub struct Syncer {
    bidder: String,
    family: String,
    sync_type: UsersyncType,
    supports_cors: bool,
    templates: Handlebars<'static>,
}

impl Syncer {
    /// Compiles `template` for `bidder`.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Template`] if the template does not parse.
    pub fn new(
        bidder: &str,
        family: &str,
        template: &str,
        sync_type: UsersyncType,
        supports_cors: bool,
    ) -> Result<Self, Report<BidExchangeError>> {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(|value| urlencoding::encode(value).into_owned());
        templates
            .register_template_string(bidder, template)
            .change_context(BidExchangeError::Template {
                message: format!("Invalid usersync template for bidder '{bidder}'"),
            })?;

        Ok(Self {
            bidder: bidder.to_string(),
            family: family.to_string(),
            sync_type,
            supports_cors,
            templates,
        })
    }

    #[must_use]
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Renders the sync pixel for `policy`.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Template`] if rendering fails.
    pub fn usersync_info(
        &self,
        policy: &PrivacyPolicy,
    ) -> Result<UsersyncInfo, Report<BidExchangeError>> {
        let data = json!({
            "GDPR": policy.gdpr.macro_value(),
            "GDPRConsent": policy.consent,
            "USPrivacy": policy.us_privacy,
        });

        let url = self
            .templates
            .render(&self.bidder, &data)
            .change_context(BidExchangeError::Template {
                message: format!("Failed to render usersync URL for bidder '{}'", self.bidder),
            })?;

        Ok(UsersyncInfo {
            url,
            sync_type: self.sync_type,
            support_cors: self.supports_cors,
        })
    }
}

/// Sync outcome attached to a bidder's status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncAnnotation {
    pub no_cookie: bool,
    pub usersync: Option<UsersyncInfo>,
}

/// Builds usersync pixels for bidders that lack a live sync.
#[derive(Debug, Default)]
pub struct UsersyncCoordinator {
    syncers: HashMap<String, Syncer>,
}

impl UsersyncCoordinator {
    /// Compiles a syncer for every enabled adapter with a usersync URL.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Template`] for the first invalid template.
    pub fn from_settings(settings: &Settings) -> Result<Self, Report<BidExchangeError>> {
        let mut syncers = HashMap::new();
        for (bidder, adapter) in &settings.adapters {
            if !adapter.enabled {
                continue;
            }
            let Some(template) = adapter.usersync_url.as_deref() else {
                continue;
            };
            let family = adapter.family.as_deref().unwrap_or(bidder);
            let syncer = Syncer::new(
                bidder,
                family,
                template,
                adapter.usersync_type,
                adapter.supports_cors,
            )?;
            syncers.insert(bidder.clone(), syncer);
        }

        log::info!("Usersync coordinator built with {} syncers", syncers.len());
        Ok(Self { syncers })
    }

    #[must_use]
    pub fn syncer(&self, bidder: &str) -> Option<&Syncer> {
        self.syncers.get(bidder)
    }

    /// Bidders that have a syncer, sorted for stable output.
    #[must_use]
    pub fn bidders(&self) -> Vec<&str> {
        let mut bidders: Vec<&str> = self.syncers.keys().map(String::as_str).collect();
        bidders.sort_unstable();
        bidders
    }

    /// Annotates one bidder: `no_cookie` when the browser has no live id for
    /// its family, plus a pixel when consent allows syncing it.
    #[must_use]
    pub fn annotate(
        &self,
        bidder: &str,
        state: &SyncState,
        policy: &PrivacyPolicy,
        permissions: &dyn Permissions,
    ) -> SyncAnnotation {
        let Some(syncer) = self.syncers.get(bidder) else {
            return SyncAnnotation::default();
        };

        if state.has_live_sync(syncer.family()) {
            return SyncAnnotation::default();
        }

        let usersync = if permissions.bidder_sync_allowed(bidder, policy) {
            match syncer.usersync_info(policy) {
                Ok(info) => Some(info),
                Err(e) => {
                    log::warn!("Skipping usersync for '{}': {:?}", bidder, e);
                    None
                }
            }
        } else {
            log::debug!("Consent does not allow syncing '{}'", bidder);
            None
        };

        SyncAnnotation {
            no_cookie: true,
            usersync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privacy::tcf::tests::CONSENT_VENDORS_2_6_8;
    use crate::privacy::{GdprSignal, PrivacyGate};
    use crate::test_support::tests::create_test_settings;

    fn syncer(template: &str) -> Syncer {
        Syncer::new("alpha", "alpha", template, UsersyncType::Redirect, false)
            .expect("should compile template")
    }

    #[test]
    fn test_macro_substitution() {
        let syncer = syncer("https://s.test/sync?gdpr={{GDPR}}&gdpr_consent={{GDPRConsent}}&r=x");
        let policy = PrivacyPolicy::new(GdprSignal::Yes, "ABC", "");

        let info = syncer.usersync_info(&policy).expect("should render");

        assert_eq!(info.url, "https://s.test/sync?gdpr=1&gdpr_consent=ABC&r=x");
        assert!(!info.url.contains("{{"), "no unresolved macros should remain");
    }

    #[test]
    fn test_macro_values_are_percent_encoded() {
        let syncer = syncer("https://s.test/sync?c={{GDPRConsent}}&us={{USPrivacy}}");
        let policy = PrivacyPolicy::new(GdprSignal::Yes, "a b&c", "1YNN");

        let info = syncer.usersync_info(&policy).expect("should render");

        assert_eq!(info.url, "https://s.test/sync?c=a%20b%26c&us=1YNN");
    }

    #[test]
    fn test_uid_placeholder_and_unknown_macros() {
        let syncer = syncer("https://s.test/sync?gdpr={{GDPR}}&x={{Unknown}}&redir=%2Fsetuid%3Fuid%3D$UID");
        let policy = PrivacyPolicy::new(GdprSignal::Ambiguous, "", "");

        let info = syncer.usersync_info(&policy).expect("should render");

        assert_eq!(info.url, "https://s.test/sync?gdpr=&x=&redir=%2Fsetuid%3Fuid%3D$UID");
    }

    #[test]
    fn test_invalid_template_rejected() {
        let result = Syncer::new("alpha", "alpha", "https://s.test/{{#if}}", UsersyncType::Iframe, false);
        assert!(result.is_err(), "unclosed block should fail to compile");
    }

    #[test]
    fn test_coordinator_from_settings() {
        let settings = create_test_settings();
        let coordinator = UsersyncCoordinator::from_settings(&settings)
            .expect("should build coordinator");

        assert_eq!(coordinator.bidders(), vec!["alpha", "beta"]);
        assert_eq!(
            coordinator.syncer("beta").map(Syncer::family),
            Some("beta-family")
        );
    }

    #[test]
    fn test_annotate_without_live_sync() {
        let settings = create_test_settings();
        let coordinator = UsersyncCoordinator::from_settings(&settings)
            .expect("should build coordinator");
        let gate = PrivacyGate::from_settings(&settings);
        let policy = PrivacyPolicy::new(GdprSignal::Yes, CONSENT_VENDORS_2_6_8, "");

        let alpha = coordinator.annotate("alpha", &SyncState::default(), &policy, &gate);
        // beta's vendor id 52 is not in the consent string
        let beta = coordinator.annotate("beta", &SyncState::default(), &policy, &gate);

        assert!(alpha.no_cookie);
        let info = alpha.usersync.expect("alpha should get a sync pixel");
        assert!(info.url.starts_with("https://alpha.test/sync?gdpr=1&gdpr_consent=COzTVha"));
        assert_eq!(info.sync_type, UsersyncType::Redirect);
        assert!(beta.no_cookie);
        assert!(beta.usersync.is_none(), "beta lacks vendor consent");
    }

    #[test]
    fn test_annotate_with_live_sync() {
        let settings = create_test_settings();
        let coordinator = UsersyncCoordinator::from_settings(&settings)
            .expect("should build coordinator");
        let gate = PrivacyGate::from_settings(&settings);
        let policy = PrivacyPolicy::new(GdprSignal::No, "", "");
        let mut state = SyncState::default();
        state.set_uid("beta-family", "user-1", chrono::Duration::days(14));

        let beta = coordinator.annotate("beta", &state, &policy, &gate);

        assert_eq!(beta, SyncAnnotation::default());
    }
}
