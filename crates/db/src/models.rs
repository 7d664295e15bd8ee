//! Catalog records and the payloads that create or change them.
//!
//! Field names follow the JSON the service has always exposed: `_id`,
//! `createdAt`, `updatedAt`. Payloads accept `id` as an alias of `_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Stored author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored book. `author` is the author's id; it is not checked on write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author reference embedded in book listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
}

impl From<&Author> for AuthorSummary {
    fn from(author: &Author) -> Self {
        Self {
            id: author.id.clone(),
            name: author.name.clone(),
        }
    }
}

/// Book with its author resolved to id and name.
///
/// `author` is `None` when the referenced author no longer exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookView {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    pub author: Option<AuthorSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BookView {
    pub fn new(book: Book, author: Option<AuthorSummary>) -> Self {
        Self {
            id: book.id,
            title: book.title,
            year: book.year,
            author,
            created_at: book.created_at,
            updated_at: book.updated_at,
        }
    }
}

/// Fields of a new author. `id` is optional; the store assigns one if absent.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthorDraft {
    #[serde(default, rename = "_id", alias = "id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bio: Option<String>,
}

impl AuthorDraft {
    pub fn validate(&self) -> StoreResult<()> {
        if self.name.trim().is_empty() {
            return Err(StoreError::invalid("author", "name is required"));
        }
        Ok(())
    }
}

/// Fields to merge into an existing author. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthorPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

impl AuthorPatch {
    pub fn validate(&self) -> StoreResult<()> {
        if matches!(&self.name, Some(name) if name.trim().is_empty()) {
            return Err(StoreError::invalid("author", "name must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn merge_into(self, author: &mut Author, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            author.name = name;
        }
        if let Some(bio) = self.bio {
            author.bio = Some(bio);
        }
        author.updated_at = now;
    }
}

/// Fields of a new book
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BookDraft {
    #[serde(default, rename = "_id", alias = "id")]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub author: String,
}

impl BookDraft {
    pub fn validate(&self) -> StoreResult<()> {
        if self.title.trim().is_empty() {
            return Err(StoreError::invalid("book", "title is required"));
        }
        if self.author.trim().is_empty() {
            return Err(StoreError::invalid("book", "author is required"));
        }
        Ok(())
    }
}

/// Fields to merge into an existing book
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BookPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub author: Option<String>,
}

impl BookPatch {
    pub fn validate(&self) -> StoreResult<()> {
        if matches!(&self.title, Some(title) if title.trim().is_empty()) {
            return Err(StoreError::invalid("book", "title must not be empty"));
        }
        if matches!(&self.author, Some(author) if author.trim().is_empty()) {
            return Err(StoreError::invalid("book", "author must not be empty"));
        }
        Ok(())
    }

    pub(crate) fn merge_into(self, book: &mut Book, now: DateTime<Utc>) {
        if let Some(title) = self.title {
            book.title = title;
        }
        if let Some(year) = self.year {
            book.year = Some(year);
        }
        if let Some(author) = self.author {
            book.author = author;
        }
        book.updated_at = now;
    }
}
