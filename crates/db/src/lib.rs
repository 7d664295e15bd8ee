//! Catalog datastore for Folio.
//!
//! [`CatalogStore`] is the boundary the rest of the service talks to;
//! [`MongoStore`] backs it with MongoDB and [`MemoryStore`] keeps everything
//! in process for tests and `database.uri = "memory://"`.

use std::sync::Arc;

use folio_kernel::settings::DatabaseSettings;

pub mod error;
pub mod memory;
pub mod models;
pub mod mongo;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use models::{
    Author, AuthorDraft, AuthorPatch, AuthorSummary, Book, BookDraft, BookPatch, BookView,
};
pub use mongo::MongoStore;
pub use store::CatalogStore;

/// Open the store the settings point at.
///
/// No round trip happens here; call [`CatalogStore::ping`] to check the
/// server answers.
pub async fn store_from_settings(settings: &DatabaseSettings) -> StoreResult<Arc<dyn CatalogStore>> {
    match settings.uri.split_once("://").map(|(scheme, _)| scheme) {
        Some("memory") => {
            tracing::info!("using in-process catalog store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Some("mongodb") | Some("mongodb+srv") => Ok(Arc::new(MongoStore::connect(settings).await?)),
        _ => Err(StoreError::Configuration(
            "unsupported database URI; expected mongodb://, mongodb+srv:// or memory://"
                .to_string(),
        )),
    }
}
