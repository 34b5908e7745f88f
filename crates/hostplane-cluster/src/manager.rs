//! Cluster resource manager facade.
//!
//! Composes the four capabilities into the operations the task executor
//! needs. Every operation is idempotent: re-running it after a partial
//! failure converges on the same cluster state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use hostplane_core::{ClusterMode, ClusterSettings, Error, Instance, Result};

use crate::backoff::Backoff;
use crate::connection::{ConnectionManager, ConnectionOps};
use crate::jobs::{ApiJobs, JobOps};
use crate::kube::KubeConnector;
use crate::memory::{MemoryCluster, StaticConnector};
use crate::types::{
    instance_labels, DeploymentSpec, JobPhase, JobSpec, SecretSpec, ServiceSpec,
    TeardownReport, VolumeClaimSpec, WorkloadHealth, WorkloadRef,
};
use crate::volumes::{ApiVolumes, VolumeOps};
use crate::workloads::{ApiWorkloads, WorkloadOps};

/// Workload shape shared by every instance.
#[derive(Debug, Clone)]
pub struct WorkloadTemplate {
    /// Image repository; the instance version is used as the tag.
    pub image: String,
    pub port: u16,
    pub storage_class: Option<String>,
}

impl WorkloadTemplate {
    pub fn from_settings(settings: &ClusterSettings) -> Self {
        Self {
            image: settings.workload_image.clone(),
            port: settings.workload_port,
            storage_class: settings.storage_class.clone(),
        }
    }

    pub fn image_for(&self, version: &str) -> String {
        format!("{}:{}", self.image, version)
    }
}

pub struct ClusterManager {
    connection: Arc<dyn ConnectionOps>,
    workloads: Arc<dyn WorkloadOps>,
    jobs: Arc<dyn JobOps>,
    volumes: Arc<dyn VolumeOps>,
    template: WorkloadTemplate,
}

impl ClusterManager {
    pub fn new(
        connection: Arc<dyn ConnectionOps>,
        workloads: Arc<dyn WorkloadOps>,
        jobs: Arc<dyn JobOps>,
        volumes: Arc<dyn VolumeOps>,
        template: WorkloadTemplate,
    ) -> Self {
        Self {
            connection,
            workloads,
            jobs,
            volumes,
            template,
        }
    }

    /// Build the default capabilities over one connection.
    pub fn with_connection(connection: Arc<dyn ConnectionOps>, template: WorkloadTemplate) -> Self {
        Self::new(
            connection.clone(),
            Arc::new(ApiWorkloads::new(connection.clone())),
            Arc::new(ApiJobs::new(connection.clone())),
            Arc::new(ApiVolumes::new(connection)),
            template,
        )
    }

    pub fn from_settings(settings: &ClusterSettings) -> Self {
        match settings.mode {
            ClusterMode::Kube => {
                let connector = Arc::new(KubeConnector::new(settings.clone()));
                let connection = Arc::new(ConnectionManager::from_settings(connector, settings));
                Self::with_connection(connection, WorkloadTemplate::from_settings(settings))
            }
            ClusterMode::Memory => Self::in_memory(Arc::new(MemoryCluster::new()), settings),
        }
    }

    pub fn in_memory(cluster: Arc<MemoryCluster>, settings: &ClusterSettings) -> Self {
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(StaticConnector::new(cluster)),
            Backoff::new(settings.base_delay()),
            settings.max_retries,
            settings.revalidate_interval(),
        ));
        Self::with_connection(connection, WorkloadTemplate::from_settings(settings))
    }

    pub fn template(&self) -> &WorkloadTemplate {
        &self.template
    }

    /// Establish (or revalidate) the cluster connection.
    pub async fn ping(&self) -> Result<()> {
        self.connection.api().await.map(|_| ())
    }

    // ---------------------------------------------------------------
    // Secrets
    // ---------------------------------------------------------------

    pub async fn resolve_secret(&self, name: &str, key: &str) -> Result<String> {
        self.connection.resolve_secret(name, key).await
    }

    pub async fn upsert_secret(&self, spec: &SecretSpec) -> Result<()> {
        self.connection.upsert_secret(spec).await
    }

    /// Delete a secret; returns `false` if it was already gone.
    pub async fn delete_secret(&self, name: &str) -> Result<bool> {
        absent_ok(self.connection.delete_secret(name).await)
    }

    // ---------------------------------------------------------------
    // Workloads
    // ---------------------------------------------------------------

    /// Ensure volume, deployment and service exist for `instance` at its
    /// recorded version with one replica.
    pub async fn upsert_workload(&self, instance: &Instance) -> Result<WorkloadRef> {
        let names = instance.resource_names();
        let labels = instance_labels(&instance.id, &instance.tenant_id);

        self.volumes
            .ensure(&VolumeClaimSpec {
                name: names.volume.clone(),
                labels: labels.clone(),
                storage_gb: instance.sizing.storage_gb,
                storage_class: self.template.storage_class.clone(),
            })
            .await?;

        self.workloads
            .apply_deployment(&DeploymentSpec {
                name: names.deployment.clone(),
                instance_id: instance.id.clone(),
                labels: labels.clone(),
                image: self.template.image_for(&instance.version),
                replicas: 1,
                port: self.template.port,
                cpu_millis: instance.sizing.cpu_millis,
                memory_mb: instance.sizing.memory_mb,
                volume_claim: names.volume.clone(),
                credentials_secret: names.credentials_secret.clone(),
            })
            .await?;

        self.workloads
            .apply_service(&ServiceSpec {
                name: names.service.clone(),
                instance_id: instance.id.clone(),
                labels,
                port: self.template.port,
            })
            .await?;

        info!(instance_id = %instance.id, version = %instance.version, "Workload applied");
        Ok(WorkloadRef {
            deployment: names.deployment,
            service: names.service,
            volume: names.volume,
        })
    }

    pub async fn scale_workload(&self, instance: &Instance, replicas: u32) -> Result<()> {
        self.workloads.scale(&instance.deployment_name, replicas).await?;
        info!(instance_id = %instance.id, replicas, "Workload scaled");
        Ok(())
    }

    pub async fn restart_workload(&self, instance: &Instance) -> Result<()> {
        self.workloads.restart(&instance.deployment_name).await?;
        info!(instance_id = %instance.id, "Workload restarted");
        Ok(())
    }

    pub async fn workload_health(&self, instance: &Instance) -> Result<WorkloadHealth> {
        self.workloads.health(&instance.deployment_name).await
    }

    /// Remove deployment, service and (unless retained) the volume.
    /// Objects that are already gone are not an error.
    pub async fn delete_workload(
        &self,
        instance: &Instance,
        retain_volume: bool,
    ) -> Result<TeardownReport> {
        let mut report = TeardownReport {
            deployment_deleted: absent_ok(
                self.workloads.delete_deployment(&instance.deployment_name).await,
            )?,
            service_deleted: absent_ok(self.workloads.delete_service(&instance.service_name).await)?,
            ..Default::default()
        };
        if retain_volume {
            report.volume_retained = true;
        } else {
            report.volume_deleted = absent_ok(self.volumes.delete(&instance.volume_name).await)?;
        }
        info!(
            instance_id = %instance.id,
            deployment = report.deployment_deleted,
            service = report.service_deleted,
            volume = report.volume_deleted,
            retained = report.volume_retained,
            "Workload torn down"
        );
        Ok(report)
    }

    /// Poll until every desired replica is ready.
    pub async fn wait_ready(
        &self,
        instance: &Instance,
        timeout: Duration,
        poll: Duration,
    ) -> Result<WorkloadHealth> {
        let deadline = Instant::now() + timeout;
        loop {
            let health = self.workload_health(instance).await?;
            if health.is_ready() {
                return Ok(health);
            }
            if Instant::now() + poll > deadline {
                warn!(instance_id = %instance.id, ready = health.ready, desired = health.desired, "Workload not ready in time");
                return Err(Error::Timeout(format!(
                    "{} not ready after {}s ({}/{} replicas)",
                    instance.deployment_name,
                    timeout.as_secs(),
                    health.ready,
                    health.desired
                )));
            }
            debug!(instance_id = %instance.id, ready = health.ready, "Waiting for workload");
            sleep(poll).await;
        }
    }

    // ---------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------

    pub async fn launch_job(&self, spec: &JobSpec) -> Result<()> {
        self.jobs.launch(spec).await?;
        info!(job = %spec.name, image = %spec.image, "Job launched");
        Ok(())
    }

    pub async fn job_phase(&self, name: &str) -> Result<JobPhase> {
        self.jobs.phase(name).await
    }

    /// Poll a job until it finishes.
    pub async fn wait_for_job(&self, name: &str, timeout: Duration, poll: Duration) -> Result<JobPhase> {
        let deadline = Instant::now() + timeout;
        loop {
            let phase = self.jobs.phase(name).await?;
            if phase.is_finished() {
                return Ok(phase);
            }
            if Instant::now() + poll > deadline {
                return Err(Error::Timeout(format!(
                    "job {} still running after {}s",
                    name,
                    timeout.as_secs()
                )));
            }
            sleep(poll).await;
        }
    }

    pub async fn delete_job(&self, name: &str) -> Result<bool> {
        absent_ok(self.jobs.delete(name).await)
    }
}

/// Map "already gone" to `Ok(false)`.
fn absent_ok(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(Error::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}
