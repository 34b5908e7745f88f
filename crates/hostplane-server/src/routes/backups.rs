//! Backup routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use hostplane_backup::{BackupDescriptor, BackupListing};
use hostplane_core::TaskKind;

use super::{accepted, ApiResult};
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/instances/{id}/backups",
            get(list_backups).post(create_backup),
        )
        .route("/instances/{id}/backups/{name}", get(get_backup))
}

/// GET /api/instances/{id}/backups: newest first.
async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<BackupListing>> {
    Ok(Json(state.ctx.backups.list_backups(&id)?))
}

/// GET /api/instances/{id}/backups/{name}
async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> ApiResult<Json<BackupDescriptor>> {
    Ok(Json(state.ctx.backups.get_backup(&id, &name)?))
}

/// POST /api/instances/{id}/backups: queue a backup.
async fn create_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let task = state
        .ctx
        .dispatcher
        .submit(TaskKind::Backup { instance_id: id })?;
    Ok(accepted(serde_json::json!({ "task": task })))
}
