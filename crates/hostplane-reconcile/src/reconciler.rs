//! Reconcile loop: container destruction events become monitoring tasks.
//!
//! The reconciler never writes instance status itself. It queues a
//! `container_destroyed` task and the worker that runs it records the
//! error status and raises the alert, so the store keeps a single writer.
//!
//! Destruction is expected while the instance is stopped or being torn
//! down, and while a lifecycle task for it is open. Those events are
//! dropped here; the task body drops the rest if the workload already
//! replaced the container.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use hostplane_cluster::Backoff;
use hostplane_core::{EventSettings, InstanceStatus, Result, TaskKind, TaskRecord};
use hostplane_runtime::{Context, ReadyHook};

use crate::events::{ContainerEvent, EventSource};

const SEEN_CAPACITY: usize = 4096;

/// Container ids already handled, oldest evicted first.
struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
            capacity,
        }
    }

    /// Returns `false` if `id` was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    fn forget(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }
}

struct Inner {
    ctx: Arc<Context>,
    source: Arc<dyn EventSource>,
    backoff: Backoff,
    seen: Mutex<SeenSet>,
}

pub struct Reconciler {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>, source: Arc<dyn EventSource>, settings: &EventSettings) -> Self {
        let backoff = Backoff::new(Duration::from_millis(settings.reconnect_base_ms))
            .with_max(Duration::from_millis(settings.reconnect_max_ms));
        Self {
            inner: Arc::new(Inner {
                ctx,
                source,
                backoff,
                seen: Mutex::new(SeenSet::new(SEEN_CAPACITY)),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the subscription loop unless it is already running.
    /// Returns `true` if a new loop was spawned.
    pub fn ensure_started(&self) -> bool {
        let mut handle = self.handle.lock();
        if handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Reconciler already running");
            return false;
        }
        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move { inner.run().await }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Reconciler stopped");
        }
    }

    /// Handle one event. Returns the queued task, if any.
    pub fn handle_event(&self, event: &ContainerEvent) -> Result<Option<TaskRecord>> {
        self.inner.handle_event(event)
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

impl ReadyHook for Reconciler {
    fn on_worker_ready(&self, worker_id: &str) {
        if self.ensure_started() {
            info!(worker = %worker_id, "Reconciler started on worker ready");
        }
    }
}

impl Inner {
    async fn run(&self) {
        let target = self.source.describe();
        info!(source = %target, "Reconciler subscribing to container events");
        let mut failures: u32 = 0;
        loop {
            match self.source.subscribe().await {
                Ok(mut stream) => {
                    if failures > 0 {
                        info!(source = %target, "Container event stream reconnected");
                    }
                    failures = 0;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(event) => {
                                if let Err(e) = self.handle_event(&event) {
                                    warn!(container = %event.container_id, "Failed to reconcile event: {}", e);
                                }
                            }
                            Err(e) => {
                                warn!(source = %target, "Container event stream failed: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(source = %target, attempt = failures + 1, "Container event subscription failed: {}", e);
                }
            }
            let delay = self.backoff.delay_for(failures);
            failures = failures.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to container events");
            tokio::time::sleep(delay).await;
        }
    }

    fn handle_event(&self, event: &ContainerEvent) -> Result<Option<TaskRecord>> {
        if !event.is_destroy() {
            return Ok(None);
        }
        let Some(instance_id) = event.instance_id() else {
            debug!(container = %event.container_id, "Ignoring unlabelled container");
            return Ok(None);
        };
        if !self.seen.lock().insert(&event.container_id) {
            debug!(container = %event.container_id, "Duplicate destroy event");
            return Ok(None);
        }

        let instance = match self.ctx.store.get_instance(instance_id) {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                warn!(instance_id = %instance_id, container = %event.container_id, "Destroyed container belongs to no known instance");
                return Ok(None);
            }
            Err(e) => {
                self.seen.lock().forget(&event.container_id);
                return Err(e);
            }
        };
        if matches!(
            instance.status,
            InstanceStatus::Stopped | InstanceStatus::Terminating | InstanceStatus::Terminated
        ) {
            debug!(instance_id = %instance.id, status = %instance.status, "Container destroyed while scaled down");
            return Ok(None);
        }
        // Stop, restart and migrate replace containers themselves.
        match self.ctx.store.has_open_lifecycle_task(&instance.id) {
            Ok(true) => {
                debug!(instance_id = %instance.id, container = %event.container_id, "Container destroyed by a lifecycle task");
                return Ok(None);
            }
            Ok(false) => {}
            Err(e) => {
                self.seen.lock().forget(&event.container_id);
                return Err(e);
            }
        }

        let submitted = self.ctx.dispatcher.submit_unique(TaskKind::ContainerDestroyed {
            instance_id: instance.id.clone(),
            container_id: event.container_id.clone(),
        });
        match submitted {
            Ok(task) => {
                if task.is_some() {
                    warn!(
                        instance_id = %instance.id,
                        container = %event.container_id,
                        status = %instance.status,
                        "Container destroyed out of band"
                    );
                }
                Ok(task)
            }
            Err(e) => {
                self.seen.lock().forget(&event.container_id);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_set_evicts_oldest() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        // "a" was evicted.
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }

    #[test]
    fn test_seen_set_forget() {
        let mut seen = SeenSet::new(4);
        seen.insert("a");
        seen.forget("a");
        assert!(seen.insert("a"));
    }
}
