//! Turns intents into task records on the right queue.

use std::sync::Arc;

use tracing::{debug, info};

use hostplane_core::{
    validate_version_tag, Error, Instance, InstanceStatus, NewInstance, Result, TaskKind,
    TaskRecord,
};
use hostplane_store::SqliteStore;

use crate::policy::PolicyTable;
use crate::routing::queue_for;

pub struct Dispatcher {
    store: Arc<SqliteStore>,
    policies: Arc<PolicyTable>,
}

impl Dispatcher {
    pub fn new(store: Arc<SqliteStore>, policies: Arc<PolicyTable>) -> Self {
        Self { store, policies }
    }

    /// Record a new instance and queue its provisioning.
    pub fn create_instance(&self, req: &NewInstance) -> Result<(Instance, TaskRecord)> {
        let instance = self.store.create_instance(req)?;
        let task = self.submit(TaskKind::Provision {
            instance_id: instance.id.clone(),
        })?;
        Ok((instance, task))
    }

    /// Queue `kind`. The target instance must exist and not be terminated.
    pub fn submit(&self, kind: TaskKind) -> Result<TaskRecord> {
        if let Some(instance_id) = kind.instance_id() {
            let instance = self.store.require_instance(instance_id)?;
            if instance.status == InstanceStatus::Terminated {
                return Err(Error::InvalidTransition(format!(
                    "instance {} is terminated",
                    instance_id
                )));
            }
        }
        if let TaskKind::Migrate { version, .. } = &kind {
            validate_version_tag(version)?;
        }

        let category = kind.category();
        let task = self.store.enqueue(
            &kind,
            queue_for(category),
            self.policies.max_retries(category),
        )?;
        info!(
            task_id = %task.id,
            kind = kind.name(),
            queue = %task.queue,
            instance_id = ?task.instance_id,
            "Task submitted"
        );
        Ok(task)
    }

    /// Queue `kind` unless a task of the same kind for the same instance is
    /// still pending or running.
    pub fn submit_unique(&self, kind: TaskKind) -> Result<Option<TaskRecord>> {
        if self.store.has_open_task(kind.instance_id(), kind.name())? {
            debug!(kind = kind.name(), instance_id = ?kind.instance_id(), "Task already open");
            return Ok(None);
        }
        self.submit(kind).map(Some)
    }
}
