//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use hostplane_runtime::Context;

/// Shared application state accessible from all route handlers.
pub struct AppState {
    pub ctx: Arc<Context>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            started_at: Instant::now(),
        }
    }
}
