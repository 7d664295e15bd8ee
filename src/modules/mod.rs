pub mod auth;
pub mod catalog;
pub mod infra;
pub mod queue;

use std::sync::Arc;

use folio_kernel::ModuleRegistry;

use crate::state::AppState;

/// Register core and project modules with the registry
pub fn register_all(registry: &mut ModuleRegistry, state: &AppState) {
    registry.register_core(Arc::new(infra::DatastoreModule::new(state.store.clone())));
    registry.register_core(Arc::new(infra::RelayModule::new(state.relay.clone())));

    registry.register_custom(Arc::new(queue::QueueModule::new(state.clone())));
    registry.register_custom(Arc::new(catalog::CatalogModule::new(state.clone())));
    registry.register_custom(Arc::new(auth::AuthModule::new(state.clone())));
}
