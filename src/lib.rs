//! Folio application library
//!
//! Wires the catalog store, the mutation relay and token checking into the
//! module registry and serves it over HTTP.

use anyhow::Context;

use folio_kernel::settings::Settings;
use folio_kernel::{InitCtx, ModuleRegistry};

pub mod modules;
pub mod state;

pub use state::AppState;

/// Registry with the core and project modules for `state`.
pub fn build_registry(state: &AppState) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    modules::register_all(&mut registry, state);
    registry
}

/// Initialize modules, serve until shutdown, then stop modules in reverse.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let state = AppState::from_settings(&settings).await?;
    let registry = build_registry(&state);
    let ctx = InitCtx {
        settings: &settings,
    };

    registry.init_core_modules(&ctx).await?;
    registry.init_custom_modules(&ctx).await?;
    registry.start_core_modules(&ctx).await?;
    registry.start_custom_modules(&ctx).await?;

    let served = folio_http::start_server(&registry, &settings)
        .await
        .context("HTTP server exited with an error");

    if let Err(e) = registry.stop_custom_modules().await {
        tracing::error!(error = %e, "failed to stop custom modules");
    }
    if let Err(e) = registry.stop_core_modules().await {
        tracing::error!(error = %e, "failed to stop core modules");
    }

    served
}
