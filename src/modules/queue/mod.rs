pub mod apply;
pub mod routes;

use async_trait::async_trait;
use axum::{routing::post, Router};
use folio_kernel::{InitCtx, Module};
use serde_json::json;

use crate::state::AppState;

/// Deferred write path: enqueue mutations, drain them into the catalog
pub struct QueueModule {
    state: AppState,
}

impl QueueModule {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Module for QueueModule {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn init(&self, ctx: &InitCtx<'_>) -> anyhow::Result<()> {
        tracing::info!(
            module = self.name(),
            queue = %ctx.settings.queue.name,
            dead_letter = %ctx.settings.queue.dead_letter_name(),
            unsupported = ?ctx.settings.queue.unsupported,
            "queue module initialized"
        );
        Ok(())
    }

    fn routes(&self) -> Router {
        Router::new()
            .route("/send", post(routes::send))
            .route("/apply", post(routes::apply))
            .with_state(self.state.clone())
    }

    fn openapi(&self) -> Option<serde_json::Value> {
        let error = |description: &str| {
            json!({
                "description": description,
                "content": {
                    "application/json": {
                        "schema": { "$ref": "#/components/schemas/ErrorResponse" }
                    }
                }
            })
        };

        Some(json!({
            "paths": {
                "/send": {
                    "post": {
                        "summary": "Enqueue a catalog mutation",
                        "tags": ["Queue"],
                        "security": [{ "bearerAuth": [] }, { "cookieAuth": [] }],
                        "requestBody": {
                            "required": true,
                            "content": {
                                "application/json": {
                                    "schema": { "$ref": "#/components/schemas/MutationRequest" }
                                }
                            }
                        },
                        "responses": {
                            "200": {
                                "description": "Accepted by the broker",
                                "content": {
                                    "application/json": {
                                        "schema": { "$ref": "#/components/schemas/Queued" }
                                    }
                                }
                            },
                            "400": error("entity or action missing"),
                            "401": error("Missing or invalid token"),
                            "422": error("Unknown entity/action, or update/delete without `_id`"),
                            "503": error("Queue channel unavailable")
                        }
                    }
                },
                "/apply": {
                    "post": {
                        "summary": "Drain the queue once and apply queued mutations",
                        "tags": ["Queue"],
                        "security": [{ "bearerAuth": [] }, { "cookieAuth": [] }],
                        "responses": {
                            "200": {
                                "description": "Number of records applied in this drain",
                                "content": {
                                    "application/json": {
                                        "schema": { "$ref": "#/components/schemas/Applied" }
                                    }
                                }
                            },
                            "401": error("Missing or invalid token"),
                            "503": error("Queue channel unavailable")
                        }
                    }
                }
            },
            "components": {
                "schemas": {
                    "MutationRequest": {
                        "type": "object",
                        "properties": {
                            "entity": { "type": "string", "enum": ["author", "book"] },
                            "action": { "type": "string", "enum": ["create", "update", "delete"] },
                            "data": { "type": "object" }
                        },
                        "required": ["entity", "action"]
                    },
                    "Queued": {
                        "type": "object",
                        "properties": { "queued": { "type": "boolean" } },
                        "required": ["queued"]
                    },
                    "Applied": {
                        "type": "object",
                        "properties": { "applied": { "type": "integer", "minimum": 0 } },
                        "required": ["applied"]
                    }
                }
            }
        }))
    }
}
