use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;

use folio_authz::TokenService;
use folio_db::{store_from_settings, CatalogStore};
use folio_events::Relay;
use folio_kernel::settings::Settings;

/// Shared handles behind every module's routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CatalogStore>,
    pub relay: Arc<Relay>,
    pub tokens: TokenService,
}

impl AppState {
    pub fn new(store: Arc<dyn CatalogStore>, relay: Arc<Relay>, tokens: TokenService) -> Self {
        Self {
            store,
            relay,
            tokens,
        }
    }

    /// Build the store, relay and token service the settings describe.
    ///
    /// Nothing connects here: the store and the broker channel are reached
    /// on first use.
    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let store = store_from_settings(&settings.database)
            .await
            .context("failed to configure catalog store")?;
        let relay = Relay::from_settings(&settings.broker, &settings.queue)
            .context("failed to configure mutation relay")?;

        Ok(Self::new(
            store,
            Arc::new(relay),
            TokenService::new(&settings.auth),
        ))
    }
}

impl FromRef<AppState> for TokenService {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}
