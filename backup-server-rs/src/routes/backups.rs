use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::config::DomainFlags;
use backup_engine::registry::BackupRun;
use backup_engine::storage::StorageStats;
use backup_engine::{BackupTarget, RestoreSummary};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Target as exposed over HTTP, without backend credentials.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub id: String,
    pub enabled: bool,
    pub schedule: Option<String>,
    pub backend: String,
    pub prefix: String,
    pub domains: DomainFlags,
}

impl From<&BackupTarget> for TargetSummary {
    fn from(t: &BackupTarget) -> Self {
        Self {
            id: t.id.clone(),
            enabled: t.enabled,
            schedule: t.schedule.clone(),
            backend: t.backend.kind().to_string(),
            prefix: t.prefix.clone(),
            domains: t.domains,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub destination: PathBuf,
}

pub fn targets_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_targets))
        .route("/{id}", axum::routing::put(update_target))
        .route("/{id}/backups", post(trigger_backup))
        .route("/{id}/runs", get(list_history))
        .route("/{id}/stats", get(target_stats))
}

pub fn runs_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{id}", get(get_run).delete(delete_run))
        .route("/{id}/restore", post(restore_run))
}

async fn list_targets(State(state): State<Arc<AppState>>) -> Json<Vec<TargetSummary>> {
    let targets = state.service.targets().await;
    Json(targets.iter().map(TargetSummary::from).collect())
}

async fn update_target(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<BackupTarget>,
) -> Result<Json<TargetSummary>, AppError> {
    if body.id != id {
        return Err(AppError::BadRequest("target id in body does not match the path".into()));
    }
    let summary = TargetSummary::from(&body);
    let target = body.clone();
    state.service.update_target(body).await?;

    if let Some(scheduler) = &state.scheduler {
        if let Err(e) = scheduler.apply(&target).await {
            tracing::warn!(target_id = %id, error = %e, "Failed to reschedule target");
        }
    }
    Ok(Json(summary))
}

async fn trigger_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let run_id = state.service.trigger_backup(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "runId": run_id }))))
}

async fn list_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<BackupRun>>, AppError> {
    let runs = state
        .service
        .list_history(&id, query.page, query.page_size)
        .await?;
    Ok(Json(runs))
}

async fn target_stats(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StorageStats>, AppError> {
    Ok(Json(state.service.backend_stats(&id).await?))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupRun>, AppError> {
    Ok(Json(state.service.get_status(&id).await?))
}

async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.service.delete_backup(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RestoreRequest>,
) -> Result<Json<RestoreSummary>, AppError> {
    if !body.destination.is_absolute() {
        return Err(AppError::BadRequest("destination must be an absolute path".into()));
    }
    Ok(Json(state.service.download_backup(&id, &body.destination).await?))
}
