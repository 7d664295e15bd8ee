//! MongoDB-backed catalog store.
//!
//! Collections `authors` and `books`; ids are ObjectIds, hex-encoded at the
//! boundary. Books reference their author by ObjectId.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use mongodb::bson::{doc, oid::ObjectId};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Client, Collection, Database};
use serde::{Deserialize, Serialize};

use folio_kernel::settings::DatabaseSettings;

use crate::error::{StoreError, StoreResult};
use crate::models::{
    Author, AuthorDraft, AuthorPatch, AuthorSummary, Book, BookDraft, BookPatch, BookView,
};
use crate::store::CatalogStore;

const AUTHORS: &str = "authors";
const BOOKS: &str = "books";
const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDoc {
    #[serde(rename = "_id")]
    id: ObjectId,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bio: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
}

impl From<AuthorDoc> for Author {
    fn from(doc: AuthorDoc) -> Self {
        Self {
            id: doc.id.to_hex(),
            name: doc.name,
            bio: doc.bio,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookDoc {
    #[serde(rename = "_id")]
    id: ObjectId,
    title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    year: Option<i32>,
    author: ObjectId,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    updated_at: DateTime<Utc>,
}

impl From<BookDoc> for Book {
    fn from(doc: BookDoc) -> Self {
        Self {
            id: doc.id.to_hex(),
            title: doc.title,
            year: doc.year,
            author: doc.author.to_hex(),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

/// Projection used to resolve book authors
#[derive(Debug, Deserialize)]
struct AuthorNameDoc {
    #[serde(rename = "_id")]
    id: ObjectId,
    name: String,
}

impl From<mongodb::error::Error> for StoreError {
    fn from(e: mongodb::error::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(w)) if w.code == DUPLICATE_KEY
    )
}

fn parse_id(id: &str) -> StoreResult<ObjectId> {
    ObjectId::parse_str(id).map_err(|_| StoreError::InvalidId(id.to_string()))
}

/// Timestamps at the millisecond precision BSON stores.
fn now() -> DateTime<Utc> {
    mongodb::bson::DateTime::now().to_chrono()
}

pub struct MongoStore {
    db: Database,
    authors: Collection<AuthorDoc>,
    books: Collection<BookDoc>,
    describe: String,
}

impl MongoStore {
    /// Build a client for `settings.uri`. The driver connects lazily.
    pub async fn connect(settings: &DatabaseSettings) -> StoreResult<Self> {
        let mut options = ClientOptions::parse(&settings.uri)
            .await
            .map_err(|e| StoreError::Configuration(format!("invalid MongoDB URI: {}", e)))?;
        options.app_name = Some("folio".to_string());
        options.server_selection_timeout =
            Some(Duration::from_millis(settings.server_selection_timeout_ms));

        let hosts: Vec<String> = options.hosts.iter().map(|h| h.to_string()).collect();
        let describe = format!("mongodb://{}/{}", hosts.join(","), settings.name);

        let client = Client::with_options(options)?;
        let db = client.database(&settings.name);

        tracing::info!(store = %describe, "mongodb client configured");

        Ok(Self {
            authors: db.collection(AUTHORS),
            books: db.collection(BOOKS),
            db,
            describe,
        })
    }

    fn newest_first() -> FindOptions {
        FindOptions::builder()
            .sort(doc! { "createdAt": -1, "_id": -1 })
            .build()
    }

    fn return_updated() -> FindOneAndUpdateOptions {
        FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build()
    }
}

#[async_trait]
impl CatalogStore for MongoStore {
    async fn create_author(&self, draft: AuthorDraft) -> StoreResult<Author> {
        draft.validate()?;
        let id = match draft.id.as_deref() {
            Some(id) => parse_id(id)?,
            None => ObjectId::new(),
        };

        let now = now();
        let doc = AuthorDoc {
            id,
            name: draft.name,
            bio: draft.bio,
            created_at: now,
            updated_at: now,
        };

        self.authors.insert_one(&doc, None).await.map_err(|e| {
            if is_duplicate_key(&e) {
                StoreError::invalid("author", format!("duplicate id '{}'", id.to_hex()))
            } else {
                e.into()
            }
        })?;
        Ok(doc.into())
    }

    async fn update_author(&self, id: &str, patch: AuthorPatch) -> StoreResult<Author> {
        patch.validate()?;
        let oid = parse_id(id)?;

        let mut set = doc! { "updatedAt": mongodb::bson::DateTime::now() };
        if let Some(name) = patch.name {
            set.insert("name", name);
        }
        if let Some(bio) = patch.bio {
            set.insert("bio", bio);
        }

        self.authors
            .find_one_and_update(doc! { "_id": oid }, doc! { "$set": set }, Self::return_updated())
            .await?
            .map(Author::from)
            .ok_or_else(|| StoreError::not_found("author", id))
    }

    async fn delete_author(&self, id: &str) -> StoreResult<()> {
        let oid = parse_id(id)?;
        let result = self.authors.delete_one(doc! { "_id": oid }, None).await?;
        if result.deleted_count == 0 {
            return Err(StoreError::not_found("author", id));
        }
        Ok(())
    }

    async fn create_book(&self, draft: BookDraft) -> StoreResult<Book> {
        draft.validate()?;
        let id = match draft.id.as_deref() {
            Some(id) => parse_id(id)?,
            None => ObjectId::new(),
        };
        let author = parse_id(&draft.author)?;

        let now = now();
        let doc = BookDoc {
            id,
            title: draft.title,
            year: draft.year,
            author,
            created_at: now,
            updated_at: now,
        };

        self.books.insert_one(&doc, None).await.map_err(|e| {
            if is_duplicate_key(&e) {
                StoreError::invalid("book", format!("duplicate id '{}'", id.to_hex()))
            } else {
                e.into()
            }
        })?;
        Ok(doc.into())
    }

    async fn update_book(&self, id: &str, patch: BookPatch) -> StoreResult<Book> {
        patch.validate()?;
        let oid = parse_id(id)?;

        let mut set = doc! { "updatedAt": mongodb::bson::DateTime::now() };
        if let Some(title) = patch.title {
            set.insert("title", title);
        }
        if let Some(year) = patch.year {
            set.insert("year", year);
        }
        if let Some(author) = patch.author.as_deref() {
            set.insert("author", parse_id(author)?);
        }

        self.books
            .find_one_and_update(doc! { "_id": oid }, doc! { "$set": set }, Self::return_updated())
            .await?
            .map(Book::from)
            .ok_or_else(|| StoreError::not_found("book", id))
    }

    async fn delete_book(&self, id: &str) -> StoreResult<()> {
        let oid = parse_id(id)?;
        let result = self.books.delete_one(doc! { "_id": oid }, None).await?;
        if result.deleted_count == 0 {
            return Err(StoreError::not_found("book", id));
        }
        Ok(())
    }

    async fn list_authors(&self) -> StoreResult<Vec<Author>> {
        let docs: Vec<AuthorDoc> = self
            .authors
            .find(None, Self::newest_first())
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Author::from).collect())
    }

    async fn find_author(&self, id: &str) -> StoreResult<Option<Author>> {
        let oid = parse_id(id)?;
        let doc = self.authors.find_one(doc! { "_id": oid }, None).await?;
        Ok(doc.map(Author::from))
    }

    async fn books_by_author(&self, author_id: &str) -> StoreResult<Vec<Book>> {
        let oid = parse_id(author_id)?;
        let docs: Vec<BookDoc> = self
            .books
            .find(doc! { "author": oid }, Self::newest_first())
            .await?
            .try_collect()
            .await?;
        Ok(docs.into_iter().map(Book::from).collect())
    }

    async fn list_books(&self) -> StoreResult<Vec<BookView>> {
        let books: Vec<BookDoc> = self.books.find(None, None).await?.try_collect().await?;

        let mut author_ids: Vec<ObjectId> = books.iter().map(|b| b.author).collect();
        author_ids.sort();
        author_ids.dedup();

        let names: HashMap<ObjectId, String> = if author_ids.is_empty() {
            HashMap::new()
        } else {
            let options = FindOptions::builder()
                .projection(doc! { "name": 1 })
                .build();
            self.authors
                .clone_with_type::<AuthorNameDoc>()
                .find(doc! { "_id": { "$in": author_ids } }, options)
                .await?
                .map_ok(|a| (a.id, a.name))
                .try_collect()
                .await?
        };

        Ok(books
            .into_iter()
            .map(|book| {
                let author = names.get(&book.author).map(|name| AuthorSummary {
                    id: book.author.to_hex(),
                    name: name.clone(),
                });
                BookView::new(book.into(), author)
            })
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.describe.clone()
    }
}
