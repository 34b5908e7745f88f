//! Periodic task producer: health checks for running instances and the
//! purge of old task records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use hostplane_core::{InstanceStatus, Result, TaskKind};

use crate::context::Context;

pub struct Scheduler {
    ctx: Arc<Context>,
}

impl Scheduler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Queue one round of periodic work. Returns the number of tasks queued.
    /// Work already pending or running is not queued again.
    pub fn tick(&self) -> Result<usize> {
        let mut queued = 0;
        for instance in self
            .ctx
            .store
            .list_instances(None, Some(InstanceStatus::Running))?
        {
            let kind = TaskKind::HealthCheck {
                instance_id: instance.id,
            };
            if self.ctx.dispatcher.submit_unique(kind)?.is_some() {
                queued += 1;
            }
        }

        let purge = TaskKind::PurgeTaskRecords {
            retention_secs: self.ctx.config.worker.task_retention_secs,
        };
        if self.ctx.dispatcher.submit_unique(purge)?.is_some() {
            queued += 1;
        }
        Ok(queued)
    }

    /// Tick every `health_check_interval_secs` until `shutdown` flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = Duration::from_secs(self.ctx.config.worker.health_check_interval_secs.max(1));
        tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "Scheduler started");
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.tick() {
                            Ok(queued) if queued > 0 => info!(queued, "Periodic tasks queued"),
                            Ok(_) => {}
                            Err(e) => error!("Scheduler tick failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            info!("Scheduler stopped");
        })
    }
}
