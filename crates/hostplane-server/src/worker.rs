//! Worker process: task pool, periodic scheduler and event reconciler.

use std::sync::Arc;

use tracing::info;

use hostplane_reconcile::{DockerEventSource, Reconciler};
use hostplane_runtime::{Context, ReadyHook, Scheduler, WorkerPool};

/// Run workers until ctrl-c.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let mut hooks: Vec<Arc<dyn ReadyHook>> = Vec::new();
    let reconciler = if ctx.config.events.enabled {
        let source = Arc::new(DockerEventSource::new(&ctx.config.events.docker_url));
        let reconciler = Arc::new(Reconciler::new(ctx.clone(), source, &ctx.config.events));
        hooks.push(reconciler.clone());
        Some(reconciler)
    } else {
        info!("Container event reconciliation disabled");
        None
    };

    let pool = WorkerPool::start(ctx.clone(), hooks);
    let scheduler = Scheduler::new(ctx.clone()).spawn(pool.subscribe_shutdown());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, draining workers");

    if let Some(reconciler) = &reconciler {
        reconciler.stop();
    }
    pool.shutdown().await;
    scheduler.await?;
    ctx.shutdown()?;
    Ok(())
}
