//! Workers: claim one task at a time, run it under its time limits and
//! record the outcome.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use hostplane_core::{now_millis, Error, Instance, Result, TaskRecord};

use crate::context::Context;
use crate::state_machine::{plan_for, Gate};

/// How a delivery ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed(Value),
    Failed {
        error: String,
        /// Set when the task went back to its queue.
        retry_at: Option<i64>,
    },
}

enum Admission {
    Proceed(Option<Instance>),
    Skip(Value),
    Reject(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureCause {
    /// Refused by the gate before anything ran.
    Rejected,
    Failed,
    /// Killed at the hard time limit. Never retried.
    HardExpired,
}

/// Called once by every worker when it is ready to take tasks.
pub trait ReadyHook: Send + Sync {
    fn on_worker_ready(&self, worker_id: &str);
}

pub struct Worker {
    ctx: Arc<Context>,
    id: String,
}

impl Worker {
    pub fn new(ctx: Arc<Context>, id: impl Into<String>) -> Self {
        Self { ctx, id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run one task. `None` when nothing was deliverable.
    pub async fn run_once(&self) -> Result<Option<Settlement>> {
        let policies = self.ctx.policies.clone();
        let Some(task) = self.ctx.store.claim_next(
            &self.ctx.config.worker.queues,
            &self.id,
            |category| policies.lease_for(category),
        )?
        else {
            return Ok(None);
        };

        info!(
            worker = %self.id,
            task_id = %task.id,
            kind = task.kind.name(),
            attempt = task.attempts,
            instance_id = ?task.instance_id,
            "Task claimed"
        );

        let instance = match self.admit(&task) {
            Ok(Admission::Proceed(instance)) => instance,
            Ok(Admission::Skip(result)) => {
                self.ctx.store.complete(&task, result.clone())?;
                return Ok(Some(Settlement::Completed(result)));
            }
            Ok(Admission::Reject(error)) => {
                return Ok(Some(self.settle_failure(&task, error, FailureCause::Rejected)?));
            }
            Err(e) => return Ok(Some(self.settle_failure(&task, e, FailureCause::Failed)?)),
        };

        let limits = self.ctx.policies.limits(task.category);
        let (error, cause) = match timeout(limits.hard, self.execute(&task, instance, limits.soft)).await {
            Ok(Ok(result)) => {
                self.ctx.store.complete(&task, result.clone())?;
                info!(worker = %self.id, task_id = %task.id, kind = task.kind.name(), "Task succeeded");
                return Ok(Some(Settlement::Completed(result)));
            }
            Ok(Err(e)) => (e, FailureCause::Failed),
            Err(_) => (
                Error::Timeout(format!(
                    "hard time limit of {:?} exceeded",
                    limits.hard
                )),
                FailureCause::HardExpired,
            ),
        };

        Ok(Some(self.settle_failure(&task, error, cause)?))
    }

    /// Gate the task against the instance's recorded status.
    fn admit(&self, task: &TaskRecord) -> Result<Admission> {
        let Some(instance_id) = task.instance_id.as_deref() else {
            return Ok(Admission::Proceed(None));
        };
        let current = self.ctx.store.require_instance(instance_id)?;
        Ok(match plan_for(&task.kind).gate(current.status) {
            Gate::Proceed => Admission::Proceed(Some(current)),
            Gate::Skip => {
                debug!(task_id = %task.id, status = %current.status, "Task has nothing to do");
                Admission::Skip(json!({ "skipped": true, "status": current.status }))
            }
            Gate::Reject => Admission::Reject(Error::InvalidTransition(format!(
                "{} is not allowed while instance {} is {}",
                task.kind.name(),
                current.id,
                current.status
            ))),
        })
    }

    async fn execute(&self, task: &TaskRecord, mut instance: Option<Instance>, soft: Duration) -> Result<Value> {
        let plan = plan_for(&task.kind);
        if let Some(entering) = plan.entering {
            let pending = instance
                .as_ref()
                .filter(|current| current.status != entering)
                .map(|current| current.id.clone());
            if let Some(instance_id) = pending {
                instance = Some(self.ctx.store.apply_transition(
                    task,
                    &instance_id,
                    entering,
                    Default::default(),
                )?);
            }
        }

        let outcome = match timeout(soft, self.ctx.executor.execute(&task.kind, instance.as_ref())).await {
            Ok(outcome) => outcome?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "soft time limit of {:?} exceeded",
                    soft
                )))
            }
        };

        if let Some(current) = &instance {
            if let Some(to) = outcome.status.or(plan.on_success) {
                self.ctx
                    .store
                    .apply_transition(task, &current.id, to, outcome.patch)?;
            }
        }
        Ok(outcome.result)
    }

    fn settle_failure(&self, task: &TaskRecord, error: Error, cause: FailureCause) -> Result<Settlement> {
        let message = format!("{}: {}", error.kind(), error);

        if cause == FailureCause::Failed && error.is_retryable() && task.attempts <= task.max_retries {
            let delay = self.ctx.policies.retry_delay(task.category, task.attempts);
            let retry_at = now_millis() + delay.as_millis() as i64;
            warn!(
                worker = %self.id,
                task_id = %task.id,
                attempt = task.attempts,
                max_retries = task.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Task failed, retrying: {}",
                error
            );
            self.ctx.store.fail(task, &message, Some(retry_at))?;
            return Ok(Settlement::Failed {
                error: message,
                retry_at: Some(retry_at),
            });
        }

        // A rejected task never touched the instance.
        if cause != FailureCause::Rejected {
            self.record_failure_status(task);
        }
        error!(
            worker = %self.id,
            task_id = %task.id,
            kind = task.kind.name(),
            attempts = task.attempts,
            "Task failed: {}",
            error
        );
        self.ctx.store.fail(task, &message, None)?;
        Ok(Settlement::Failed {
            error: message,
            retry_at: None,
        })
    }

    fn record_failure_status(&self, task: &TaskRecord) {
        let (Some(instance_id), Some(to)) = (task.instance_id.as_deref(), plan_for(&task.kind).on_failure)
        else {
            return;
        };
        let current: Option<Instance> = match self.ctx.store.get_instance(instance_id) {
            Ok(current) => current,
            Err(e) => {
                error!(task_id = %task.id, "Failed to load instance for failure status: {}", e);
                return;
            }
        };
        let Some(current) = current else { return };
        if !task.kind.permits(current.status, to) {
            return;
        }
        if let Err(e) = self
            .ctx
            .store
            .apply_transition(task, instance_id, to, Default::default())
        {
            error!(task_id = %task.id, instance_id = %instance_id, "Failed to record failure status: {}", e);
        }
    }
}

/// A fixed set of workers consuming the configured queues.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(ctx: Arc<Context>, hooks: Vec<Arc<dyn ReadyHook>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = Duration::from_millis(ctx.config.worker.poll_interval_ms);
        let concurrency = ctx.config.worker.concurrency;

        let handles = (0..concurrency)
            .map(|n| {
                let worker = Worker::new(ctx.clone(), format!("worker-{}-{}", std::process::id(), n));
                let hooks = hooks.clone();
                let mut shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    for hook in &hooks {
                        hook.on_worker_ready(worker.id());
                    }
                    info!(worker = %worker.id(), "Worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match worker.run_once().await {
                            Ok(Some(_)) => continue,
                            Ok(None) => {}
                            Err(e) => error!(worker = %worker.id(), "Worker iteration failed: {}", e),
                        }
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = tokio::time::sleep(poll) => {}
                        }
                    }
                    info!(worker = %worker.id(), "Worker stopped");
                })
            })
            .collect();

        info!(concurrency, queues = ?ctx.config.worker.queues, "Worker pool started");
        Self { shutdown_tx, handles }
    }

    /// Receiver that flips when the pool shuts down, for companion loops.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop claiming and wait for in-flight tasks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::MemoryAlertSink;
    use crate::policy::PolicyTable;
    use hostplane_cluster::{ClusterManager, MemoryCluster};
    use hostplane_core::{ClusterMode, HostplaneConfig, InstanceStatus, NewInstance, ResourceSizing};
    use hostplane_store::SqliteStore;
    use tempfile::TempDir;

    fn test_context() -> (TempDir, Arc<Context>) {
        let dir = TempDir::new().unwrap();
        let mut config = HostplaneConfig::with_defaults(dir.path()).unwrap();
        config.cluster.mode = ClusterMode::Memory;
        let store = Arc::new(SqliteStore::open(&config.data_paths.db).unwrap());
        let manager = Arc::new(ClusterManager::in_memory(
            Arc::new(MemoryCluster::new()),
            &config.cluster,
        ));
        let ctx = Context::with_parts(
            config,
            store,
            manager,
            Arc::new(MemoryAlertSink::new()),
            PolicyTable::default(),
        );
        (dir, ctx)
    }

    /// A pending instance and its claimed provisioning task.
    fn claimed_provision(ctx: &Context) -> (String, TaskRecord) {
        let (instance, _) = ctx
            .dispatcher
            .create_instance(&NewInstance {
                tenant_id: "t-1".into(),
                name: "Shop".into(),
                version: "17.0".into(),
                sizing: ResourceSizing::default(),
            })
            .unwrap();
        let task = ctx
            .store
            .claim_next(&[], "test-worker", |_| Duration::from_secs(60))
            .unwrap()
            .unwrap();
        (instance.id, task)
    }

    #[test]
    fn test_refused_transition_after_entry_records_failure_status() {
        let (_dir, ctx) = test_context();
        let (id, task) = claimed_provision(&ctx);
        ctx.store
            .apply_transition(&task, &id, InstanceStatus::Provisioning, Default::default())
            .unwrap();

        let worker = Worker::new(ctx.clone(), "test-worker");
        let settled = worker
            .settle_failure(
                &task,
                Error::InvalidTransition("success status refused".into()),
                FailureCause::Failed,
            )
            .unwrap();

        assert!(matches!(settled, Settlement::Failed { retry_at: None, .. }));
        assert_eq!(ctx.store.require_instance(&id).unwrap().status, InstanceStatus::Error);
    }

    #[test]
    fn test_rejected_task_leaves_instance_untouched() {
        let (_dir, ctx) = test_context();
        let (id, task) = claimed_provision(&ctx);

        let worker = Worker::new(ctx.clone(), "test-worker");
        worker
            .settle_failure(
                &task,
                Error::InvalidTransition("not allowed".into()),
                FailureCause::Rejected,
            )
            .unwrap();

        assert_eq!(ctx.store.require_instance(&id).unwrap().status, InstanceStatus::Pending);
        let stored = ctx.store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, hostplane_core::TaskStatus::Failed);
    }

    #[test]
    fn test_hard_expiry_is_not_retried() {
        let (_dir, ctx) = test_context();
        let (id, task) = claimed_provision(&ctx);
        ctx.store
            .apply_transition(&task, &id, InstanceStatus::Provisioning, Default::default())
            .unwrap();

        // Retryable error, but the task was killed at the hard limit.
        let worker = Worker::new(ctx.clone(), "test-worker");
        let settled = worker
            .settle_failure(&task, Error::Timeout("killed".into()), FailureCause::HardExpired)
            .unwrap();
        assert!(matches!(settled, Settlement::Failed { retry_at: None, .. }));
        assert_eq!(ctx.store.require_instance(&id).unwrap().status, InstanceStatus::Error);
    }
}
