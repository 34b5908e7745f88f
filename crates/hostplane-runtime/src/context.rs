//! Process-wide runtime context shared by workers, the scheduler and the
//! HTTP layer.

use std::sync::Arc;

use tracing::info;

use hostplane_backup::BackupController;
use hostplane_cluster::ClusterManager;
use hostplane_core::{HostplaneConfig, Result};
use hostplane_store::SqliteStore;

use crate::alerts::{AlertSink, LogAlertSink};
use crate::dispatcher::Dispatcher;
use crate::executor::TaskExecutor;
use crate::policy::PolicyTable;

pub struct Context {
    pub config: HostplaneConfig,
    pub store: Arc<SqliteStore>,
    pub cluster: Arc<ClusterManager>,
    pub backups: Arc<BackupController>,
    pub alerts: Arc<dyn AlertSink>,
    pub policies: Arc<PolicyTable>,
    pub dispatcher: Dispatcher,
    pub executor: TaskExecutor,
}

impl Context {
    /// Open the state store and build cluster access from `config`.
    pub fn startup(config: HostplaneConfig) -> Result<Arc<Self>> {
        let store = Arc::new(SqliteStore::open(&config.data_paths.db)?);
        let cluster = Arc::new(ClusterManager::from_settings(&config.cluster));
        let ctx = Self::with_parts(
            config,
            store,
            cluster,
            Arc::new(LogAlertSink),
            PolicyTable::default(),
        );
        info!(
            namespace = %ctx.config.cluster.namespace,
            db = %ctx.store.db_path().display(),
            backups = %ctx.config.data_paths.backups.display(),
            "Runtime context ready"
        );
        Ok(ctx)
    }

    /// Assemble a context from pre-built parts.
    pub fn with_parts(
        config: HostplaneConfig,
        store: Arc<SqliteStore>,
        cluster: Arc<ClusterManager>,
        alerts: Arc<dyn AlertSink>,
        policies: PolicyTable,
    ) -> Arc<Self> {
        let policies = Arc::new(policies);
        let backups = Arc::new(BackupController::new(
            store.clone(),
            cluster.clone(),
            &config.data_paths.backups,
            config.backup.clone(),
        ));
        let dispatcher = Dispatcher::new(store.clone(), policies.clone());
        let executor = TaskExecutor::new(
            store.clone(),
            cluster.clone(),
            backups.clone(),
            alerts.clone(),
            config.cluster.ready_timeout(),
        );
        Arc::new(Self {
            config,
            store,
            cluster,
            backups,
            alerts,
            policies,
            dispatcher,
            executor,
        })
    }

    /// Flush the store before the process exits.
    pub fn shutdown(&self) -> Result<()> {
        self.store.checkpoint()?;
        info!("Runtime context shut down");
        Ok(())
    }
}
