//! Task and queue inspection.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};

use hostplane_core::{Error, TaskRecord};
use hostplane_runtime::{routing_table, ROUTING_VERSION};

use super::ApiResult;
use crate::state::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks/{id}", get(get_task))
        .route("/queues", get(get_queues))
}

/// GET /api/tasks/{id}
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskRecord>> {
    let task = state
        .ctx
        .store
        .get_task(&id)?
        .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
    Ok(Json(task))
}

/// GET /api/queues: routing table with current depth per queue.
async fn get_queues(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let depths = state.ctx.store.queue_depths()?;
    let queues: Vec<serde_json::Value> = routing_table()
        .into_iter()
        .map(|(category, queue)| {
            let depth = depths.iter().find(|d| d.queue == queue);
            let policy = state.ctx.policies.get(category);
            serde_json::json!({
                "queue": queue,
                "category": category,
                "pending": depth.map(|d| d.pending).unwrap_or(0),
                "started": depth.map(|d| d.started).unwrap_or(0),
                "maxRetries": policy.retry.max_retries,
                "softLimitSecs": policy.limits.soft.as_secs(),
                "hardLimitSecs": policy.limits.hard.as_secs(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "routingVersion": ROUTING_VERSION,
        "queues": queues,
    })))
}
