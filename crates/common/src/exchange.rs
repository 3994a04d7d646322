//! Long-lived services shared by every request.

use std::sync::Arc;

use error_stack::Report;

use crate::adapters::{build_registry, AdapterRegistry};
use crate::auction::dispatch::AdapterDispatcher;
use crate::cache::{CacheClient, HttpCacheClient};
use crate::error::BidExchangeError;
use crate::http_client::HttpClient;
use crate::privacy::PrivacyGate;
use crate::settings::Settings;
use crate::usersync::UsersyncCoordinator;

/// Everything a handler needs, built once at startup.
pub struct Exchange {
    pub settings: Arc<Settings>,
    pub registry: Arc<AdapterRegistry>,
    pub dispatcher: AdapterDispatcher,
    pub privacy: PrivacyGate,
    pub usersync: UsersyncCoordinator,
    pub cache: Arc<dyn CacheClient>,
}

impl Exchange {
    /// Assembles an exchange from already-built parts.
    ///
    /// # Errors
    ///
    /// Returns [`BidExchangeError::Template`] if a usersync template is invalid.
    pub fn new(
        settings: Settings,
        registry: AdapterRegistry,
        client: Arc<dyn HttpClient>,
        cache: Arc<dyn CacheClient>,
    ) -> Result<Self, Report<BidExchangeError>> {
        let registry = Arc::new(registry);
        let usersync = UsersyncCoordinator::from_settings(&settings)?;
        let privacy = PrivacyGate::from_settings(&settings);

        Ok(Self {
            dispatcher: AdapterDispatcher::new(Arc::clone(&registry), client),
            settings: Arc::new(settings),
            registry,
            privacy,
            usersync,
            cache,
        })
    }
}

/// Builds the exchange for `settings`, sending all outbound traffic through `client`.
///
/// # Errors
///
/// Returns [`BidExchangeError::Template`] if a usersync template is invalid.
pub fn build_exchange(
    settings: Settings,
    client: Arc<dyn HttpClient>,
) -> Result<Exchange, Report<BidExchangeError>> {
    log::info!("Building exchange");

    let registry = build_registry(&settings);
    let cache: Arc<dyn CacheClient> =
        Arc::new(HttpCacheClient::new(Arc::clone(&client), &settings));

    let exchange = Exchange::new(settings, registry, client, cache)?;

    log::info!(
        "Exchange built with {} bidders and {} syncers",
        exchange.registry.len(),
        exchange.usersync.bidders().len()
    );
    Ok(exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auction::dispatch::tests::ScriptedClient;
    use crate::test_support::tests::create_test_settings;

    #[test]
    fn test_build_exchange() {
        let exchange = build_exchange(create_test_settings(), Arc::new(ScriptedClient::default()))
            .expect("should build exchange");

        assert_eq!(exchange.registry.len(), 2);
        assert_eq!(exchange.usersync.bidders(), vec!["alpha", "beta"]);
        assert_eq!(
            exchange.cache.retrieval_url("u"),
            "https://cache.test/cache?uuid=u"
        );
    }

    #[test]
    fn test_build_exchange_rejects_bad_template() {
        let mut settings = create_test_settings();
        if let Some(alpha) = settings.adapters.get_mut("alpha") {
            alpha.usersync_url = Some("https://alpha.test/{{#if}}".to_string());
        }

        let result = build_exchange(settings, Arc::new(ScriptedClient::default()));
        assert!(result.is_err(), "invalid usersync template should fail startup");
    }
}
