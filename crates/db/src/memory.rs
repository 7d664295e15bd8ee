//! Process-local catalog store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    Author, AuthorDraft, AuthorPatch, AuthorSummary, Book, BookDraft, BookPatch, BookView,
};
use crate::store::CatalogStore;

#[derive(Default)]
struct Catalog {
    // Insertion order doubles as creation order.
    authors: Vec<Author>,
    books: Vec<Book>,
}

/// Keeps authors and books in memory; ids are UUID v7 strings.
#[derive(Default)]
pub struct MemoryStore {
    catalog: RwLock<Catalog>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn assign_id(entity: &'static str, requested: Option<String>) -> StoreResult<String> {
    match requested {
        Some(id) if id.trim().is_empty() => Err(StoreError::InvalidId(id)),
        Some(id) => Ok(id),
        None => {
            tracing::trace!(entity, "assigning generated id");
            Ok(Uuid::now_v7().to_string())
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn create_author(&self, draft: AuthorDraft) -> StoreResult<Author> {
        draft.validate()?;
        let id = assign_id("author", draft.id)?;

        let mut catalog = self.catalog.write().await;
        if catalog.authors.iter().any(|a| a.id == id) {
            return Err(StoreError::invalid("author", format!("duplicate id '{}'", id)));
        }

        let now = Utc::now();
        let author = Author {
            id,
            name: draft.name,
            bio: draft.bio,
            created_at: now,
            updated_at: now,
        };
        catalog.authors.push(author.clone());
        Ok(author)
    }

    async fn update_author(&self, id: &str, patch: AuthorPatch) -> StoreResult<Author> {
        patch.validate()?;
        let mut catalog = self.catalog.write().await;
        let author = catalog
            .authors
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::not_found("author", id))?;

        patch.merge_into(author, Utc::now());
        Ok(author.clone())
    }

    async fn delete_author(&self, id: &str) -> StoreResult<()> {
        let mut catalog = self.catalog.write().await;
        let before = catalog.authors.len();
        catalog.authors.retain(|a| a.id != id);
        if catalog.authors.len() == before {
            return Err(StoreError::not_found("author", id));
        }
        Ok(())
    }

    async fn create_book(&self, draft: BookDraft) -> StoreResult<Book> {
        draft.validate()?;
        let id = assign_id("book", draft.id)?;

        let mut catalog = self.catalog.write().await;
        if catalog.books.iter().any(|b| b.id == id) {
            return Err(StoreError::invalid("book", format!("duplicate id '{}'", id)));
        }

        let now = Utc::now();
        let book = Book {
            id,
            title: draft.title,
            year: draft.year,
            author: draft.author,
            created_at: now,
            updated_at: now,
        };
        catalog.books.push(book.clone());
        Ok(book)
    }

    async fn update_book(&self, id: &str, patch: BookPatch) -> StoreResult<Book> {
        patch.validate()?;
        let mut catalog = self.catalog.write().await;
        let book = catalog
            .books
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| StoreError::not_found("book", id))?;

        patch.merge_into(book, Utc::now());
        Ok(book.clone())
    }

    async fn delete_book(&self, id: &str) -> StoreResult<()> {
        let mut catalog = self.catalog.write().await;
        let before = catalog.books.len();
        catalog.books.retain(|b| b.id != id);
        if catalog.books.len() == before {
            return Err(StoreError::not_found("book", id));
        }
        Ok(())
    }

    async fn list_authors(&self) -> StoreResult<Vec<Author>> {
        let catalog = self.catalog.read().await;
        Ok(catalog.authors.iter().rev().cloned().collect())
    }

    async fn find_author(&self, id: &str) -> StoreResult<Option<Author>> {
        let catalog = self.catalog.read().await;
        Ok(catalog.authors.iter().find(|a| a.id == id).cloned())
    }

    async fn books_by_author(&self, author_id: &str) -> StoreResult<Vec<Book>> {
        let catalog = self.catalog.read().await;
        Ok(catalog
            .books
            .iter()
            .rev()
            .filter(|b| b.author == author_id)
            .cloned()
            .collect())
    }

    async fn list_books(&self) -> StoreResult<Vec<BookView>> {
        let catalog = self.catalog.read().await;
        let authors: HashMap<&str, AuthorSummary> = catalog
            .authors
            .iter()
            .map(|a| (a.id.as_str(), AuthorSummary::from(a)))
            .collect();

        Ok(catalog
            .books
            .iter()
            .map(|book| {
                let author = authors.get(book.author.as_str()).cloned();
                BookView::new(book.clone(), author)
            })
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(name: &str) -> AuthorDraft {
        AuthorDraft {
            name: name.to_string(),
            ..AuthorDraft::default()
        }
    }

    #[tokio::test]
    async fn authors_list_newest_first() {
        let store = MemoryStore::new();
        store.create_author(author("Ada")).await.unwrap();
        store.create_author(author("Grace")).await.unwrap();

        let names: Vec<_> = store
            .list_authors()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["Grace", "Ada"]);
    }

    #[tokio::test]
    async fn update_merges_and_keeps_other_fields() {
        let store = MemoryStore::new();
        let ada = store
            .create_author(AuthorDraft {
                bio: Some("Mathematician".to_string()),
                ..author("Ada")
            })
            .await
            .unwrap();

        let updated = store
            .update_author(
                &ada.id,
                AuthorPatch {
                    name: Some("Ada Lovelace".to_string()),
                    bio: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "Ada Lovelace");
        assert_eq!(updated.bio.as_deref(), Some("Mathematician"));
        assert_eq!(updated.created_at, ada.created_at);
        assert!(updated.updated_at >= ada.updated_at);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_author("missing", AuthorPatch::default()).await,
            Err(StoreError::NotFound { entity: "author", .. })
        ));
        assert!(matches!(
            store.delete_book("missing").await,
            Err(StoreError::NotFound { entity: "book", .. })
        ));
    }

    #[tokio::test]
    async fn create_with_id_rejects_duplicates() {
        let store = MemoryStore::new();
        let draft = AuthorDraft {
            id: Some("fixed".to_string()),
            ..author("Ada")
        };
        store.create_author(draft.clone()).await.unwrap();
        assert!(matches!(
            store.create_author(draft).await,
            Err(StoreError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn book_listing_resolves_author_names() {
        let store = MemoryStore::new();
        let ada = store.create_author(author("Ada")).await.unwrap();
        store
            .create_book(BookDraft {
                title: "Notes".to_string(),
                year: Some(1843),
                author: ada.id.clone(),
                ..BookDraft::default()
            })
            .await
            .unwrap();
        store
            .create_book(BookDraft {
                title: "Orphan".to_string(),
                author: "gone".to_string(),
                ..BookDraft::default()
            })
            .await
            .unwrap();

        let books = store.list_books().await.unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(
            books[0].author,
            Some(AuthorSummary {
                id: ada.id.clone(),
                name: "Ada".to_string()
            })
        );
        assert_eq!(books[1].author, None);

        let by_ada = store.books_by_author(&ada.id).await.unwrap();
        assert_eq!(by_ada.len(), 1);
        assert_eq!(by_ada[0].title, "Notes");
    }
}
