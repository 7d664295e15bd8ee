use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use folio_authz::Identity;
use folio_db::{Author, Book, BookView, StoreError};
use folio_http::AppError;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AuthorDetail {
    pub author: Author,
    pub books: Vec<Book>,
}

fn store_error(error: StoreError) -> AppError {
    AppError::Internal(error.into())
}

/// Authors, newest first
pub async fn list_authors(
    _identity: Identity,
    State(state): State<AppState>,
) -> Result<Json<Vec<Author>>, AppError> {
    let authors = state.store.list_authors().await.map_err(store_error)?;
    Ok(Json(authors))
}

/// One author with their books
pub async fn get_author(
    _identity: Identity,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AuthorDetail>, AppError> {
    let author = match state.store.find_author(&id).await {
        Ok(Some(author)) => author,
        Ok(None) | Err(StoreError::InvalidId(_)) => {
            return Err(AppError::not_found(format!("author '{}' not found", id)))
        }
        Err(e) => return Err(store_error(e)),
    };

    let books = state
        .store
        .books_by_author(&author.id)
        .await
        .map_err(store_error)?;
    Ok(Json(AuthorDetail { author, books }))
}

/// Books with their author's id and name
pub async fn list_books(
    _identity: Identity,
    State(state): State<AppState>,
) -> Result<Json<Vec<BookView>>, AppError> {
    let books = state.store.list_books().await.map_err(store_error)?;
    Ok(Json(books))
}
