use crate::error::AppError;
use crate::state::AppState;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use backup_engine::BackendParams;
use serde_json::json;
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/test", post(test_connection))
}

/// Fail fast on bad credentials before a target is saved.
async fn test_connection(
    State(state): State<Arc<AppState>>,
    Json(params): Json<BackendParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.service.test_backend_connection(&params).await?;
    Ok(Json(json!({ "ok": true, "kind": params.kind().to_string() })))
}
