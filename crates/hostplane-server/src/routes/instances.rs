//! Instance routes: create, query and lifecycle intents.
//!
//! Intents answer 202 with the queued task; the status changes when a
//! worker runs it.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use hostplane_core::{Error, InstanceStatus, NewInstance, TaskKind};

use super::{accepted, ApiResult};
use crate::state::AppState;

// ---------------------------------------------------------------
// Route builder
// ---------------------------------------------------------------

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/{id}", get(get_instance).delete(terminate_instance))
        .route("/instances/{id}/start", post(start_instance))
        .route("/instances/{id}/stop", post(stop_instance))
        .route("/instances/{id}/restart", post(restart_instance))
        .route("/instances/{id}/migrate", post(migrate_instance))
        .route("/instances/{id}/restore", post(restore_instance))
        .route("/instances/{id}/tasks", get(list_instance_tasks))
        .route("/instances/{id}/transitions", get(list_transitions))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TerminateQuery {
    #[serde(default)]
    retain_volume: bool,
}

#[derive(Debug, Deserialize)]
struct MigrateRequest {
    version: String,
}

#[derive(Debug, Deserialize)]
struct RestoreRequest {
    backup_name: String,
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    limit: Option<usize>,
}

// ---------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------

/// POST /api/instances: record an instance and queue provisioning.
async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewInstance>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let (instance, task) = state.ctx.dispatcher.create_instance(&req)?;
    Ok(accepted(serde_json::json!({
        "instance": instance,
        "task": task,
    })))
}

/// GET /api/instances: list, optionally by tenant and status.
async fn list_instances(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            InstanceStatus::parse(raw)
                .ok_or_else(|| Error::Validation(format!("unknown status: {}", raw)))?,
        ),
        None => None,
    };
    let instances = state
        .ctx
        .store
        .list_instances(query.tenant_id.as_deref(), status)?;
    Ok(Json(serde_json::json!({
        "total": instances.len(),
        "instances": instances,
    })))
}

/// GET /api/instances/{id}
async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let instance = state.ctx.store.require_instance(&id)?;
    Ok(Json(serde_json::to_value(instance).map_err(Error::from)?))
}

fn submit(state: &AppState, kind: TaskKind) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let task = state.ctx.dispatcher.submit(kind)?;
    Ok(accepted(serde_json::json!({ "task": task })))
}

/// POST /api/instances/{id}/start
async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    submit(&state, TaskKind::Start { instance_id: id })
}

/// POST /api/instances/{id}/stop
async fn stop_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    submit(&state, TaskKind::Stop { instance_id: id })
}

/// POST /api/instances/{id}/restart
async fn restart_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    submit(&state, TaskKind::Restart { instance_id: id })
}

/// POST /api/instances/{id}/migrate: `{ "version": "18.0" }`
async fn migrate_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    submit(
        &state,
        TaskKind::Migrate {
            instance_id: id,
            version: req.version,
        },
    )
}

/// POST /api/instances/{id}/restore: `{ "backup_name": "<id>_<timestamp>" }`
async fn restore_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RestoreRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    // Reject unknown or foreign backups before queueing.
    state.ctx.backups.get_backup(&id, &req.backup_name)?;
    submit(
        &state,
        TaskKind::Restore {
            instance_id: id,
            backup_name: req.backup_name,
        },
    )
}

/// DELETE /api/instances/{id}?retain_volume=true
async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TerminateQuery>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    submit(
        &state,
        TaskKind::Terminate {
            instance_id: id,
            retain_volume: query.retain_volume,
        },
    )
}

/// GET /api/instances/{id}/tasks: most recent first.
async fn list_instance_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state.ctx.store.require_instance(&id)?;
    let tasks = state
        .ctx
        .store
        .list_tasks_for_instance(&id, query.limit.unwrap_or(50).min(500))?;
    Ok(Json(serde_json::json!({
        "instance_id": id,
        "total": tasks.len(),
        "tasks": tasks,
    })))
}

/// GET /api/instances/{id}/transitions: status audit trail.
async fn list_transitions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.ctx.store.require_instance(&id)?;
    let transitions = state.ctx.store.list_transitions(&id)?;
    Ok(Json(serde_json::json!({
        "instance_id": id,
        "transitions": transitions,
    })))
}
