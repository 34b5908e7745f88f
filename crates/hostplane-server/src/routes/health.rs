//! Liveness and cluster reachability.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use hostplane_runtime::ROUTING_VERSION;

use super::ApiResult;
use crate::state::AppState;

const CLUSTER_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// GET /api/health: process, store and cluster status.
async fn get_health(State(state): State<Arc<AppState>>) -> ApiResult<Json<serde_json::Value>> {
    let instances = state.ctx.store.count_instances()?;
    let cluster = match tokio::time::timeout(CLUSTER_PROBE_TIMEOUT, state.ctx.cluster.ping()).await {
        Ok(Ok(())) => serde_json::json!({ "reachable": true }),
        Ok(Err(e)) => serde_json::json!({ "reachable": false, "error": e.to_string() }),
        Err(_) => serde_json::json!({ "reachable": false, "error": "probe timed out" }),
    };

    Ok(Json(serde_json::json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "instances": instances,
        "namespace": state.ctx.config.cluster.namespace,
        "routingVersion": ROUTING_VERSION,
        "cluster": cluster,
    })))
}
