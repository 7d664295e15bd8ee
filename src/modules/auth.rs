use async_trait::async_trait;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;

use folio_authz::Identity;
use folio_http::AppError;
use folio_kernel::Module;

use crate::state::AppState;

/// Session check for the front end
pub struct AuthModule {
    state: AppState,
}

impl AuthModule {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// GET /me
///
/// Answers rather than rejects: a missing or invalid token is a normal
/// outcome here, reported as `401 {"authenticated": false}`.
pub async fn me(identity: Result<Identity, AppError>) -> (StatusCode, Json<SessionResponse>) {
    match identity {
        Ok(identity) => (
            StatusCode::OK,
            Json(SessionResponse {
                authenticated: true,
                username: Some(identity.username),
            }),
        ),
        Err(_) => (
            StatusCode::UNAUTHORIZED,
            Json(SessionResponse {
                authenticated: false,
                username: None,
            }),
        ),
    }
}

#[async_trait]
impl Module for AuthModule {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn routes(&self) -> Router {
        Router::new()
            .route("/me", get(me))
            .with_state(self.state.clone())
    }

    fn openapi(&self) -> Option<serde_json::Value> {
        let session = json!({
            "application/json": {
                "schema": { "$ref": "#/components/schemas/Session" }
            }
        });

        Some(json!({
            "paths": {
                "/me": {
                    "get": {
                        "summary": "Report whether the caller holds a valid token",
                        "tags": ["Auth"],
                        "security": [{ "bearerAuth": [] }, { "cookieAuth": [] }],
                        "responses": {
                            "200": { "description": "Authenticated", "content": session },
                            "401": { "description": "No valid token", "content": session }
                        }
                    }
                }
            },
            "components": {
                "schemas": {
                    "Session": {
                        "type": "object",
                        "properties": {
                            "authenticated": { "type": "boolean" },
                            "username": { "type": "string" }
                        },
                        "required": ["authenticated"]
                    }
                }
            }
        }))
    }
}
