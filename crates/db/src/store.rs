use async_trait::async_trait;

use crate::error::StoreResult;
use crate::models::{Author, AuthorDraft, AuthorPatch, Book, BookDraft, BookPatch, BookView};

/// Persistence boundary for authors and books.
///
/// Update and delete of an id that does not exist fail with
/// [`StoreError::NotFound`](crate::StoreError::NotFound).
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_author(&self, draft: AuthorDraft) -> StoreResult<Author>;

    async fn update_author(&self, id: &str, patch: AuthorPatch) -> StoreResult<Author>;

    async fn delete_author(&self, id: &str) -> StoreResult<()>;

    async fn create_book(&self, draft: BookDraft) -> StoreResult<Book>;

    async fn update_book(&self, id: &str, patch: BookPatch) -> StoreResult<Book>;

    async fn delete_book(&self, id: &str) -> StoreResult<()>;

    /// All authors, newest first.
    async fn list_authors(&self) -> StoreResult<Vec<Author>>;

    async fn find_author(&self, id: &str) -> StoreResult<Option<Author>>;

    /// Books referencing `author_id`, newest first.
    async fn books_by_author(&self, author_id: &str) -> StoreResult<Vec<Book>>;

    /// All books in insertion order, each with its author's id and name.
    async fn list_books(&self) -> StoreResult<Vec<BookView>>;

    /// Round trip to the backing server.
    async fn ping(&self) -> StoreResult<()>;

    /// Where the store points, for logs. Never includes credentials.
    fn describe(&self) -> String;
}
