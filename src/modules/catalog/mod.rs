pub mod routes;

use async_trait::async_trait;
use axum::{routing::get, Router};
use folio_kernel::Module;
use serde_json::json;

use crate::state::AppState;

/// Read side: served straight from the catalog store
pub struct CatalogModule {
    state: AppState,
}

impl CatalogModule {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Module for CatalogModule {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn routes(&self) -> Router {
        Router::new()
            .route("/authors", get(routes::list_authors))
            .route("/authors/{id}", get(routes::get_author))
            .route("/books", get(routes::list_books))
            .with_state(self.state.clone())
    }

    fn openapi(&self) -> Option<serde_json::Value> {
        let unauthorized = json!({
            "description": "Missing or invalid token",
            "content": {
                "application/json": {
                    "schema": { "$ref": "#/components/schemas/ErrorResponse" }
                }
            }
        });
        let security = json!([{ "bearerAuth": [] }, { "cookieAuth": [] }]);

        Some(json!({
            "paths": {
                "/authors": {
                    "get": {
                        "summary": "List authors, newest first",
                        "tags": ["Catalog"],
                        "security": security,
                        "responses": {
                            "200": {
                                "description": "Authors",
                                "content": {
                                    "application/json": {
                                        "schema": {
                                            "type": "array",
                                            "items": { "$ref": "#/components/schemas/Author" }
                                        }
                                    }
                                }
                            },
                            "401": unauthorized
                        }
                    }
                },
                "/authors/{id}": {
                    "get": {
                        "summary": "Author with their books",
                        "tags": ["Catalog"],
                        "security": security,
                        "parameters": [{
                            "name": "id",
                            "in": "path",
                            "required": true,
                            "schema": { "type": "string" }
                        }],
                        "responses": {
                            "200": {
                                "description": "Author and books, newest first",
                                "content": {
                                    "application/json": {
                                        "schema": { "$ref": "#/components/schemas/AuthorDetail" }
                                    }
                                }
                            },
                            "401": unauthorized,
                            "404": {
                                "description": "No such author",
                                "content": {
                                    "application/json": {
                                        "schema": { "$ref": "#/components/schemas/ErrorResponse" }
                                    }
                                }
                            }
                        }
                    }
                },
                "/books": {
                    "get": {
                        "summary": "List books with author names",
                        "tags": ["Catalog"],
                        "security": security,
                        "responses": {
                            "200": {
                                "description": "Books",
                                "content": {
                                    "application/json": {
                                        "schema": {
                                            "type": "array",
                                            "items": { "$ref": "#/components/schemas/BookView" }
                                        }
                                    }
                                }
                            },
                            "401": unauthorized
                        }
                    }
                }
            },
            "components": {
                "schemas": {
                    "Author": {
                        "type": "object",
                        "properties": {
                            "_id": { "type": "string" },
                            "name": { "type": "string" },
                            "bio": { "type": "string" },
                            "createdAt": { "type": "string", "format": "date-time" },
                            "updatedAt": { "type": "string", "format": "date-time" }
                        },
                        "required": ["_id", "name", "createdAt", "updatedAt"]
                    },
                    "Book": {
                        "type": "object",
                        "properties": {
                            "_id": { "type": "string" },
                            "title": { "type": "string" },
                            "year": { "type": "integer" },
                            "author": { "type": "string" },
                            "createdAt": { "type": "string", "format": "date-time" },
                            "updatedAt": { "type": "string", "format": "date-time" }
                        },
                        "required": ["_id", "title", "author", "createdAt", "updatedAt"]
                    },
                    "BookView": {
                        "type": "object",
                        "properties": {
                            "_id": { "type": "string" },
                            "title": { "type": "string" },
                            "year": { "type": "integer" },
                            "author": {
                                "type": "object",
                                "properties": {
                                    "_id": { "type": "string" },
                                    "name": { "type": "string" }
                                }
                            },
                            "createdAt": { "type": "string", "format": "date-time" },
                            "updatedAt": { "type": "string", "format": "date-time" }
                        },
                        "required": ["_id", "title", "createdAt", "updatedAt"]
                    },
                    "AuthorDetail": {
                        "type": "object",
                        "properties": {
                            "author": { "$ref": "#/components/schemas/Author" },
                            "books": {
                                "type": "array",
                                "items": { "$ref": "#/components/schemas/Book" }
                            }
                        },
                        "required": ["author", "books"]
                    }
                }
            }
        }))
    }
}
