//! Task bodies: what each kind of task does against the cluster.
//!
//! Bodies never write instance status themselves. They return an
//! [`Outcome`] and the worker records it through the store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, warn};

use hostplane_backup::BackupController;
use hostplane_cluster::{instance_labels, ClusterManager, SecretSpec, ADMIN_PASSWORD_KEY};
use hostplane_core::{
    now_millis, validate_version_tag, Error, Instance, InstancePatch, InstanceStatus, Result,
    TaskKind,
};
use hostplane_store::SqliteStore;

use crate::alerts::{Alert, AlertSeverity, AlertSink};

const READY_POLL: Duration = Duration::from_secs(2);

/// What a task body produced.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Status to record instead of the plan's success status.
    pub status: Option<InstanceStatus>,
    pub patch: InstancePatch,
    pub result: Value,
}

impl Outcome {
    fn with_result(result: Value) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }
}

pub struct TaskExecutor {
    store: Arc<SqliteStore>,
    cluster: Arc<ClusterManager>,
    backups: Arc<BackupController>,
    alerts: Arc<dyn AlertSink>,
    ready_timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<SqliteStore>,
        cluster: Arc<ClusterManager>,
        backups: Arc<BackupController>,
        alerts: Arc<dyn AlertSink>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            store,
            cluster,
            backups,
            alerts,
            ready_timeout,
        }
    }

    /// Run the body of `kind`. `instance` is the record as loaded when the
    /// task was gated; it is `None` only for kinds without an instance.
    pub async fn execute(&self, kind: &TaskKind, instance: Option<&Instance>) -> Result<Outcome> {
        let instance = match (kind, instance) {
            (TaskKind::PurgeTaskRecords { retention_secs }, _) => return self.purge(*retention_secs),
            (_, Some(instance)) => instance,
            (_, None) => {
                return Err(Error::Internal(format!(
                    "{} task executed without an instance",
                    kind.name()
                )))
            }
        };

        match kind {
            TaskKind::Provision { .. } => self.provision(instance).await,
            TaskKind::Start { .. } => {
                self.cluster.scale_workload(instance, 1).await?;
                let health = self.wait_ready(instance).await?;
                Ok(Outcome::with_result(json!({ "health": health })))
            }
            TaskKind::Stop { .. } => {
                self.cluster.scale_workload(instance, 0).await?;
                Ok(Outcome::with_result(json!({ "replicas": 0 })))
            }
            TaskKind::Restart { .. } => {
                self.cluster.restart_workload(instance).await?;
                let health = self.wait_ready(instance).await?;
                Ok(Outcome::with_result(json!({ "health": health })))
            }
            TaskKind::Terminate { retain_volume, .. } => self.terminate(instance, *retain_volume).await,
            TaskKind::Migrate { version, .. } => self.migrate(instance, version).await,
            TaskKind::Backup { .. } => {
                let descriptor = self.backups.run_backup(instance).await?;
                Ok(Outcome::with_result(serde_json::to_value(descriptor)?))
            }
            TaskKind::Restore { backup_name, .. } => self.restore(instance, backup_name).await,
            TaskKind::HealthCheck { .. } => self.health_check(instance).await,
            TaskKind::ContainerDestroyed { container_id, .. } => {
                self.container_destroyed(instance, container_id).await
            }
            TaskKind::PurgeTaskRecords { retention_secs } => self.purge(*retention_secs),
        }
    }

    async fn wait_ready(&self, instance: &Instance) -> Result<hostplane_cluster::WorkloadHealth> {
        self.cluster
            .wait_ready(instance, self.ready_timeout, READY_POLL)
            .await
    }

    async fn provision(&self, instance: &Instance) -> Result<Outcome> {
        let secret = instance.resource_names().credentials_secret;
        let created_credentials = match self.cluster.resolve_secret(&secret, ADMIN_PASSWORD_KEY).await {
            Ok(_) => false,
            Err(Error::NotFound(_)) => {
                let mut data = std::collections::BTreeMap::new();
                data.insert(
                    ADMIN_PASSWORD_KEY.to_string(),
                    hostplane_credentials::generate_default(),
                );
                self.cluster
                    .upsert_secret(&SecretSpec {
                        name: secret.clone(),
                        labels: instance_labels(&instance.id, &instance.tenant_id),
                        data,
                    })
                    .await?;
                info!(instance_id = %instance.id, secret = %secret, "Credentials generated");
                true
            }
            Err(e) => return Err(e),
        };

        let workload = self.cluster.upsert_workload(instance).await?;
        let health = self.wait_ready(instance).await?;
        Ok(Outcome::with_result(json!({
            "workload": workload,
            "health": health,
            "credentials_secret": secret,
            "credentials_created": created_credentials,
        })))
    }

    async fn terminate(&self, instance: &Instance, retain_volume: bool) -> Result<Outcome> {
        let report = self.cluster.delete_workload(instance, retain_volume).await?;
        // Credentials stay with a retained volume so the data stays usable.
        let secret_deleted = if retain_volume {
            false
        } else {
            self.cluster
                .delete_secret(&instance.resource_names().credentials_secret)
                .await?
        };
        Ok(Outcome::with_result(json!({
            "teardown": report,
            "credentials_deleted": secret_deleted,
        })))
    }

    async fn migrate(&self, instance: &Instance, version: &str) -> Result<Outcome> {
        validate_version_tag(version)?;
        let mut target = instance.clone();
        target.version = version.to_string();

        let workload = self.cluster.upsert_workload(&target).await?;
        let health = self.wait_ready(&target).await?;
        info!(
            instance_id = %instance.id,
            from = %instance.version,
            to = %version,
            "Instance migrated"
        );
        Ok(Outcome {
            status: None,
            patch: InstancePatch {
                version: Some(version.to_string()),
                ..Default::default()
            },
            result: json!({
                "workload": workload,
                "health": health,
                "previous_version": instance.version,
                "version": version,
            }),
        })
    }

    async fn restore(&self, instance: &Instance, backup_name: &str) -> Result<Outcome> {
        self.cluster.scale_workload(instance, 0).await?;
        let descriptor = self.backups.run_restore(instance, backup_name).await?;
        self.cluster.scale_workload(instance, 1).await?;
        let health = self.wait_ready(instance).await?;
        Ok(Outcome::with_result(json!({
            "restored": descriptor,
            "health": health,
        })))
    }

    /// A destroyed container only marks the instance failed when the
    /// workload did not replace it: the deployment is gone or short of its
    /// desired replicas.
    async fn container_destroyed(&self, instance: &Instance, container_id: &str) -> Result<Outcome> {
        let detail = match self.cluster.workload_health(instance).await {
            Ok(health) if health.desired > 0 && health.is_ready() => {
                info!(
                    instance_id = %instance.id,
                    container = %container_id,
                    ready = health.ready,
                    "Destroyed container was replaced"
                );
                return Ok(Outcome::with_result(json!({
                    "container_id": container_id,
                    "replaced": true,
                    "health": health,
                })));
            }
            Ok(health) => format!(
                "container {} was destroyed and {}/{} replicas are ready",
                container_id, health.ready, health.desired
            ),
            Err(Error::NotFound(_)) => format!(
                "container {} was destroyed and deployment {} is missing",
                container_id, instance.deployment_name
            ),
            Err(e) => return Err(e),
        };

        self.alerts.raise(Alert {
            severity: AlertSeverity::Critical,
            instance_id: instance.id.clone(),
            title: format!("Container destroyed for instance {}", instance.name),
            detail,
        });
        Ok(Outcome {
            status: Some(InstanceStatus::Error),
            result: json!({ "container_id": container_id, "replaced": false }),
            ..Default::default()
        })
    }

    async fn health_check(&self, instance: &Instance) -> Result<Outcome> {
        let checked_at = now_millis();
        let patch = InstancePatch {
            last_health_check: Some(checked_at),
            ..Default::default()
        };
        match self.cluster.workload_health(instance).await {
            Ok(health) => {
                if !health.is_ready() {
                    warn!(
                        instance_id = %instance.id,
                        ready = health.ready,
                        desired = health.desired,
                        "Instance degraded"
                    );
                    self.alerts.raise(Alert {
                        severity: AlertSeverity::Warning,
                        instance_id: instance.id.clone(),
                        title: format!("Instance {} degraded", instance.name),
                        detail: format!("{}/{} replicas ready", health.ready, health.desired),
                    });
                }
                Ok(Outcome {
                    status: None,
                    patch,
                    result: json!({ "health": health, "checked_at": checked_at }),
                })
            }
            Err(Error::NotFound(_)) => {
                self.alerts.raise(Alert {
                    severity: AlertSeverity::Critical,
                    instance_id: instance.id.clone(),
                    title: format!("Instance {} has no workload", instance.name),
                    detail: format!("deployment {} is missing", instance.deployment_name),
                });
                Ok(Outcome {
                    status: Some(InstanceStatus::Error),
                    patch,
                    result: json!({ "missing": instance.deployment_name, "checked_at": checked_at }),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn purge(&self, retention_secs: u64) -> Result<Outcome> {
        let cutoff = now_millis() - (retention_secs as i64).saturating_mul(1000);
        let purged = self.store.purge_finished_tasks(cutoff)?;
        if purged > 0 {
            info!(purged, "Finished task records purged");
        }
        Ok(Outcome::with_result(json!({ "purged": purged })))
    }
}
