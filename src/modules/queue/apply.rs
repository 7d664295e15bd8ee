//! Applies dequeued mutation records to the catalog store.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use folio_db::{AuthorDraft, AuthorPatch, BookDraft, BookPatch, CatalogStore, StoreError};
use folio_events::{Action, ApplyError, Entity, MutationHandler, MutationRecord};

pub struct RecordApplier {
    store: Arc<dyn CatalogStore>,
}

impl RecordApplier {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }
}

fn payload<T: DeserializeOwned>(record: &MutationRecord) -> Result<T, ApplyError> {
    serde_json::from_value(record.data().clone()).map_err(|e| ApplyError::Invalid {
        entity: record.entity(),
        message: e.to_string(),
    })
}

fn target(record: &MutationRecord) -> Result<&str, ApplyError> {
    record.target_id().ok_or_else(|| ApplyError::Invalid {
        entity: record.entity(),
        message: "missing `_id`".to_string(),
    })
}

fn apply_error(entity: Entity, error: StoreError) -> ApplyError {
    match error {
        StoreError::NotFound { id, .. } => ApplyError::NotFound { entity, id },
        StoreError::InvalidId(id) => ApplyError::Invalid {
            entity,
            message: format!("'{}' is not a valid identifier", id),
        },
        StoreError::Invalid { message, .. } => ApplyError::Invalid { entity, message },
        other => ApplyError::Store(other.to_string()),
    }
}

#[async_trait]
impl MutationHandler for RecordApplier {
    async fn apply(&self, record: &MutationRecord) -> Result<(), ApplyError> {
        let entity = record.entity();
        let store = self.store.as_ref();

        let result = match (entity, record.action()) {
            (Entity::Author, Action::Create) => store
                .create_author(payload::<AuthorDraft>(record)?)
                .await
                .map(|author| author.id),
            (Entity::Author, Action::Update) => store
                .update_author(target(record)?, payload::<AuthorPatch>(record)?)
                .await
                .map(|author| author.id),
            (Entity::Author, Action::Delete) => {
                let id = target(record)?;
                store.delete_author(id).await.map(|()| id.to_string())
            }
            (Entity::Book, Action::Create) => store
                .create_book(payload::<BookDraft>(record)?)
                .await
                .map(|book| book.id),
            (Entity::Book, Action::Update) => store
                .update_book(target(record)?, payload::<BookPatch>(record)?)
                .await
                .map(|book| book.id),
            (Entity::Book, Action::Delete) => {
                let id = target(record)?;
                store.delete_book(id).await.map(|()| id.to_string())
            }
        };

        let id = result.map_err(|e| apply_error(entity, e))?;
        tracing::debug!(
            %entity,
            action = %record.action(),
            id = %id,
            submitted_by = record.submitted_by(),
            "record applied"
        );
        Ok(())
    }
}
