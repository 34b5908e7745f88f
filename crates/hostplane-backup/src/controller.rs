//! Backup and restore job controller.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use hostplane_cluster::{instance_labels, ClusterManager, JobMount, JobPhase, JobSpec};
use hostplane_core::{BackupSettings, Error, Instance, Result};
use hostplane_store::SqliteStore;

use crate::catalog::BackupCatalog;
use crate::descriptor::{backup_id, BackupDescriptor, BackupStatus};

const DATABASE_ARTIFACT: &str = "database.sql.gz";
const FILES_ARTIFACT: &str = "files.tar.gz";
const INSTANCE_DATA_MOUNT: &str = "/instance-data";

/// Response of [`BackupController::list_backups`].
#[derive(Debug, Clone, Serialize)]
pub struct BackupListing {
    pub instance_id: String,
    pub instance_name: String,
    pub backups: Vec<BackupDescriptor>,
    pub total_backups: usize,
}

pub struct BackupController {
    store: Arc<SqliteStore>,
    cluster: Arc<ClusterManager>,
    catalog: BackupCatalog,
    settings: BackupSettings,
}

enum JobAction {
    Backup,
    Restore,
}

impl JobAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl BackupController {
    pub fn new(
        store: Arc<SqliteStore>,
        cluster: Arc<ClusterManager>,
        backup_dir: impl AsRef<Path>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            store,
            cluster,
            catalog: BackupCatalog::new(backup_dir),
            settings,
        }
    }

    pub fn catalog(&self) -> &BackupCatalog {
        &self.catalog
    }

    /// Backups of a known instance, newest first. Unknown instance is `NotFound`.
    pub fn list_backups(&self, instance_id: &str) -> Result<BackupListing> {
        let instance = self.store.require_instance(instance_id)?;
        let backups = self.catalog.list_for(instance_id)?;
        Ok(BackupListing {
            instance_id: instance.id,
            instance_name: instance.name,
            total_backups: backups.len(),
            backups,
        })
    }

    pub fn get_backup(&self, instance_id: &str, backup_name: &str) -> Result<BackupDescriptor> {
        self.store.require_instance(instance_id)?;
        match self.catalog.read(backup_name) {
            Some(d) if d.instance_id == instance_id => Ok(d),
            _ => Err(Error::NotFound(format!("backup {}", backup_name))),
        }
    }

    /// Dump an instance's database and files to the shared directory and
    /// record a descriptor once the job succeeds.
    pub async fn run_backup(&self, instance: &Instance) -> Result<BackupDescriptor> {
        let created_at = Utc::now();
        let backup_name = backup_id(&instance.id, created_at);

        self.run_job(instance, &backup_name, JobAction::Backup).await?;

        let artifacts = self.catalog.artifact_dir(&backup_name);
        let database_size = file_size(&artifacts.join(DATABASE_ARTIFACT));
        let data_size = file_size(&artifacts.join(FILES_ARTIFACT));
        let descriptor = BackupDescriptor {
            instance_id: instance.id.clone(),
            backup_name: backup_name.clone(),
            instance_name: instance.name.clone(),
            created_at,
            database_size,
            data_size,
            total_size: database_size + data_size,
            workload_version: instance.version.clone(),
            status: BackupStatus::Completed,
        };
        self.catalog.write(&descriptor)?;

        info!(
            instance_id = %instance.id,
            backup = %backup_name,
            total_size = descriptor.total_size,
            "Backup completed"
        );
        Ok(descriptor)
    }

    /// Restore an instance from one of its own backups. The caller stops
    /// the workload first.
    pub async fn run_restore(&self, instance: &Instance, backup_name: &str) -> Result<BackupDescriptor> {
        let descriptor = self
            .catalog
            .read(backup_name)
            .ok_or_else(|| Error::NotFound(format!("backup {}", backup_name)))?;
        if descriptor.instance_id != instance.id {
            return Err(Error::Validation(format!(
                "backup {} belongs to instance {}, not {}",
                backup_name, descriptor.instance_id, instance.id
            )));
        }
        if descriptor.status != BackupStatus::Completed {
            return Err(Error::Validation(format!("backup {} is not complete", backup_name)));
        }

        self.run_job(instance, backup_name, JobAction::Restore).await?;
        info!(instance_id = %instance.id, backup = %backup_name, "Restore completed");
        Ok(descriptor)
    }

    async fn run_job(&self, instance: &Instance, backup_name: &str, action: JobAction) -> Result<()> {
        let spec = self.job_spec(instance, backup_name, &action);
        let job_name = spec.name.clone();

        // A job left by an earlier delivery of the same task is replaced.
        if self.cluster.delete_job(&job_name).await? {
            warn!(job = %job_name, "Removed leftover job before relaunch");
        }
        self.cluster.launch_job(&spec).await?;

        let outcome = self
            .cluster
            .wait_for_job(
                &job_name,
                Duration::from_secs(self.settings.job_timeout_secs),
                Duration::from_millis(self.settings.poll_interval_ms),
            )
            .await;

        if let Err(e) = self.cluster.delete_job(&job_name).await {
            warn!(job = %job_name, error = %e, "Failed to clean up job");
        }

        match outcome? {
            JobPhase::Succeeded => Ok(()),
            phase => Err(Error::Internal(format!(
                "{} job {} ended {:?}",
                action.as_str(),
                job_name,
                phase
            ))),
        }
    }

    fn job_spec(&self, instance: &Instance, backup_name: &str, action: &JobAction) -> JobSpec {
        let mut labels = instance_labels(&instance.id, &instance.tenant_id);
        labels.insert("hostplane.io/job".into(), action.as_str().into());

        let mut env = BTreeMap::new();
        env.insert("INSTANCE_ID".into(), instance.id.clone());
        env.insert("BACKUP_NAME".into(), backup_name.to_string());
        env.insert(
            "BACKUP_DIR".into(),
            format!("{}/{}", self.settings.mount_path.trim_end_matches('/'), backup_name),
        );
        env.insert("DATA_DIR".into(), INSTANCE_DATA_MOUNT.into());
        env.insert("DB_HOST".into(), instance.service_name.clone());

        let writes_instance = matches!(action, JobAction::Restore);
        JobSpec {
            // Job names may not contain underscores.
            name: format!("{}-{}", action.as_str(), backup_name.replace('_', "-")),
            labels,
            image: self.settings.tools_image.clone(),
            command: vec!["hostplane-backup-tool".into(), action.as_str().into()],
            env,
            mounts: vec![
                JobMount {
                    claim: instance.volume_name.clone(),
                    mount_path: INSTANCE_DATA_MOUNT.into(),
                    read_only: !writes_instance,
                },
                JobMount {
                    claim: self.settings.shared_claim.clone(),
                    mount_path: self.settings.mount_path.clone(),
                    read_only: writes_instance,
                },
            ],
            deadline_secs: self.settings.job_timeout_secs,
        }
    }
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostplane_cluster::{MemoryCluster, ResourceKind};
    use hostplane_core::{ClusterSettings, NewInstance, ResourceSizing};

    struct Fixture {
        _dir: tempfile::TempDir,
        cluster: Arc<MemoryCluster>,
        store: Arc<SqliteStore>,
        controller: BackupController,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("db")).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let manager = Arc::new(ClusterManager::in_memory(cluster.clone(), &ClusterSettings::default()));
        let settings = BackupSettings { poll_interval_ms: 10, ..Default::default() };
        let controller =
            BackupController::new(store.clone(), manager, dir.path().join("backups"), settings);
        Fixture { _dir: dir, cluster, store, controller }
    }

    fn instance(store: &SqliteStore) -> Instance {
        store
            .create_instance(&NewInstance {
                tenant_id: "t".into(),
                name: "Shop".into(),
                version: "17.0".into(),
                sizing: ResourceSizing::default(),
            })
            .unwrap()
    }

    #[test]
    fn test_list_unknown_instance_is_not_found() {
        let fx = fixture();
        assert!(matches!(fx.controller.list_backups("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_list_empty() {
        let fx = fixture();
        let inst = instance(&fx.store);
        let listing = fx.controller.list_backups(&inst.id).unwrap();
        assert_eq!(listing.instance_name, "Shop");
        assert_eq!(listing.total_backups, 0);
        assert!(listing.backups.is_empty());
    }

    #[tokio::test]
    async fn test_backup_records_descriptor_and_cleans_up_job() {
        let fx = fixture();
        let inst = instance(&fx.store);
        let descriptor = fx.controller.run_backup(&inst).await.unwrap();
        assert_eq!(descriptor.status, BackupStatus::Completed);
        assert_eq!(descriptor.workload_version, "17.0");
        assert_eq!(descriptor.total_size, 0);
        assert_eq!(fx.cluster.count(ResourceKind::Job), 0);

        let listing = fx.controller.list_backups(&inst.id).unwrap();
        assert_eq!(listing.total_backups, 1);
        assert_eq!(listing.backups[0].backup_name, descriptor.backup_name);

        let restored = fx
            .controller
            .run_restore(&inst, &descriptor.backup_name)
            .await
            .unwrap();
        assert_eq!(restored, descriptor);
    }

    #[tokio::test]
    async fn test_failed_job_writes_no_descriptor() {
        let fx = fixture();
        let inst = instance(&fx.store);
        fx.cluster.set_job_outcome(JobPhase::Failed);
        assert!(matches!(fx.controller.run_backup(&inst).await, Err(Error::Internal(_))));
        assert_eq!(fx.controller.list_backups(&inst.id).unwrap().total_backups, 0);
        assert_eq!(fx.cluster.count(ResourceKind::Job), 0);
    }

    #[tokio::test]
    async fn test_restore_rejects_foreign_backup() {
        let fx = fixture();
        let a = instance(&fx.store);
        let b = instance(&fx.store);
        let descriptor = fx.controller.run_backup(&a).await.unwrap();
        assert!(matches!(
            fx.controller.run_restore(&b, &descriptor.backup_name).await,
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            fx.controller.run_restore(&a, "missing_1").await,
            Err(Error::NotFound(_))
        ));
    }
}
