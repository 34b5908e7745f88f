//! End-to-end lifecycle tests over the in-memory cluster.

use std::sync::Arc;
use std::time::Duration;

use hostplane_cluster::{ClusterManager, JobPhase, MemoryCluster, ResourceKind};
use hostplane_core::{
    ClusterMode, Error, HostplaneConfig, InstancePatch, InstanceStatus, NewInstance,
    ResourceSizing, TaskCategory, TaskKind, TaskStatus,
};
use hostplane_runtime::{Context, MemoryAlertSink, PolicyTable, Settlement, TimeLimits, Worker};
use hostplane_store::SqliteStore;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    cluster: Arc<MemoryCluster>,
    alerts: Arc<MemoryAlertSink>,
    ctx: Arc<Context>,
    worker: Worker,
}

impl Harness {
    fn new(policies: PolicyTable) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = HostplaneConfig::with_defaults(dir.path()).unwrap();
        config.cluster.mode = ClusterMode::Memory;
        config.cluster.base_delay_ms = 1;
        let store = Arc::new(SqliteStore::open(&config.data_paths.db).unwrap());
        let cluster = Arc::new(MemoryCluster::new());
        let manager = Arc::new(ClusterManager::in_memory(cluster.clone(), &config.cluster));
        let alerts = Arc::new(MemoryAlertSink::new());
        let ctx = Context::with_parts(config, store, manager, alerts.clone(), policies);
        let worker = Worker::new(ctx.clone(), "test-worker");
        Self {
            _dir: dir,
            cluster,
            alerts,
            ctx,
            worker,
        }
    }

    /// Run tasks until nothing is deliverable.
    async fn drain(&self) -> Vec<Settlement> {
        let mut settled = Vec::new();
        while let Some(settlement) = self.worker.run_once().await.unwrap() {
            settled.push(settlement);
        }
        settled
    }

    async fn running_instance(&self) -> String {
        let (instance, _) = self
            .ctx
            .dispatcher
            .create_instance(&NewInstance {
                tenant_id: "t-1".into(),
                name: "Shop".into(),
                version: "17.0".into(),
                sizing: ResourceSizing::default(),
            })
            .unwrap();
        self.drain().await;
        assert_eq!(self.status(&instance.id), InstanceStatus::Running);
        instance.id
    }

    fn status(&self, id: &str) -> InstanceStatus {
        self.ctx.store.require_instance(id).unwrap().status
    }
}

#[tokio::test]
async fn test_provision_creates_workload_and_credentials() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;
    let instance = h.ctx.store.require_instance(&id).unwrap();
    let names = instance.resource_names();

    assert!(h.cluster.contains(ResourceKind::Deployment, &names.deployment));
    assert!(h.cluster.contains(ResourceKind::Service, &names.service));
    assert!(h.cluster.contains(ResourceKind::VolumeClaim, &names.volume));
    assert!(h.cluster.contains(ResourceKind::Secret, &names.credentials_secret));

    let path: Vec<_> = h
        .ctx
        .store
        .list_transitions(&id)
        .unwrap()
        .into_iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        path,
        vec![
            (InstanceStatus::Pending, InstanceStatus::Provisioning),
            (InstanceStatus::Provisioning, InstanceStatus::Running),
        ]
    );
}

#[tokio::test]
async fn test_failed_provision_is_not_retried() {
    let h = Harness::new(PolicyTable::default());
    h.cluster.fail_next(1);
    let (instance, task) = h
        .ctx
        .dispatcher
        .create_instance(&NewInstance {
            tenant_id: "t-1".into(),
            name: "Shop".into(),
            version: "17.0".into(),
            sizing: ResourceSizing::default(),
        })
        .unwrap();

    let settled = h.drain().await;
    assert_eq!(settled.len(), 1);
    assert!(matches!(settled[0], Settlement::Failed { retry_at: None, .. }));

    let task = h.ctx.store.get_task(&task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 1);
    assert!(task.error.unwrap().starts_with("connectivity"));
    assert_eq!(h.status(&instance.id), InstanceStatus::Error);

    // Provisioning again from error succeeds.
    h.ctx
        .dispatcher
        .submit(TaskKind::Provision { instance_id: instance.id.clone() })
        .unwrap();
    h.drain().await;
    assert_eq!(h.status(&instance.id), InstanceStatus::Running);
}

#[tokio::test]
async fn test_monitoring_retries_then_fails() {
    let h = Harness::new(PolicyTable::default().with_retry_base(Duration::ZERO));
    let id = h.running_instance().await;

    h.cluster.fail_next(100);
    let task = h
        .ctx
        .dispatcher
        .submit(TaskKind::HealthCheck { instance_id: id.clone() })
        .unwrap();
    assert_eq!(task.max_retries, 3);

    let settled = h.drain().await;
    assert_eq!(settled.len(), 4);
    assert!(settled[..3]
        .iter()
        .all(|s| matches!(s, Settlement::Failed { retry_at: Some(_), .. })));
    assert!(matches!(settled[3], Settlement::Failed { retry_at: None, .. }));

    let task = h.ctx.store.get_task(&task.id).unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 4);
    // Monitoring failures leave the recorded status alone.
    assert_eq!(h.status(&id), InstanceStatus::Running);
}

#[tokio::test]
async fn test_stop_start_and_noop() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;
    let deployment = h.ctx.store.require_instance(&id).unwrap().deployment_name;

    h.ctx.dispatcher.submit(TaskKind::Stop { instance_id: id.clone() }).unwrap();
    h.drain().await;
    assert_eq!(h.status(&id), InstanceStatus::Stopped);
    let obj = h.cluster.object(ResourceKind::Deployment, &deployment).unwrap();
    assert_eq!(obj["spec"]["replicas"], 0);

    // Stopping a stopped instance is a no-op, not an error.
    h.ctx.dispatcher.submit(TaskKind::Stop { instance_id: id.clone() }).unwrap();
    let settled = h.drain().await;
    match &settled[0] {
        Settlement::Completed(result) => assert_eq!(result["skipped"], true),
        other => panic!("unexpected {:?}", other),
    }

    h.ctx.dispatcher.submit(TaskKind::Start { instance_id: id.clone() }).unwrap();
    h.drain().await;
    assert_eq!(h.status(&id), InstanceStatus::Running);
}

#[tokio::test]
async fn test_start_from_pending_is_rejected() {
    let h = Harness::new(PolicyTable::default());
    let instance = h
        .ctx
        .store
        .create_instance(&NewInstance {
            tenant_id: "t-1".into(),
            name: "Shop".into(),
            version: "17.0".into(),
            sizing: ResourceSizing::default(),
        })
        .unwrap();
    h.ctx.dispatcher.submit(TaskKind::Start { instance_id: instance.id.clone() }).unwrap();
    let settled = h.drain().await;
    match &settled[0] {
        Settlement::Failed { error, retry_at } => {
            assert!(error.starts_with("invalid_transition"));
            assert!(retry_at.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.status(&instance.id), InstanceStatus::Pending);
}

#[tokio::test]
async fn test_status_change_requires_started_task() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;
    let pending = h
        .ctx
        .dispatcher
        .submit(TaskKind::Stop { instance_id: id.clone() })
        .unwrap();

    let err = h
        .ctx
        .store
        .apply_transition(&pending, &id, InstanceStatus::Stopped, InstancePatch::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
    assert_eq!(h.status(&id), InstanceStatus::Running);
}

#[tokio::test]
async fn test_migrate_records_version() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;
    h.ctx
        .dispatcher
        .submit(TaskKind::Migrate { instance_id: id.clone(), version: "18.0".into() })
        .unwrap();
    h.drain().await;

    let instance = h.ctx.store.require_instance(&id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.version, "18.0");
    let obj = h.cluster.object(ResourceKind::Deployment, &instance.deployment_name).unwrap();
    assert!(obj.to_string().contains(":18.0"));
}

#[tokio::test]
async fn test_soft_limit_fails_provisioning() {
    let policies = PolicyTable::default().with_limits(
        TaskCategory::Provisioning,
        TimeLimits {
            soft: Duration::from_millis(50),
            hard: Duration::from_secs(5),
        },
    );
    let h = Harness::new(policies);
    let (instance, _) = h
        .ctx
        .dispatcher
        .create_instance(&NewInstance {
            tenant_id: "t-1".into(),
            name: "Slow".into(),
            version: "17.0".into(),
            sizing: ResourceSizing::default(),
        })
        .unwrap();
    h.cluster.stall_deployment(&instance.deployment_name);

    let settled = h.drain().await;
    match &settled[0] {
        Settlement::Failed { error, retry_at } => {
            assert!(error.contains("soft time limit"), "{}", error);
            assert!(retry_at.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.status(&instance.id), InstanceStatus::Error);
}

#[tokio::test]
async fn test_hard_limit_kills_provisioning() {
    let policies = PolicyTable::default().with_limits(
        TaskCategory::Provisioning,
        TimeLimits {
            soft: Duration::from_secs(30),
            hard: Duration::from_millis(100),
        },
    );
    let h = Harness::new(policies);
    let (instance, task) = h
        .ctx
        .dispatcher
        .create_instance(&NewInstance {
            tenant_id: "t-1".into(),
            name: "Stuck".into(),
            version: "17.0".into(),
            sizing: ResourceSizing::default(),
        })
        .unwrap();
    h.cluster.stall_deployment(&instance.deployment_name);

    let settled = h.drain().await;
    assert_eq!(settled.len(), 1);
    match &settled[0] {
        Settlement::Failed { error, retry_at } => {
            assert!(error.contains("hard time limit"), "{}", error);
            assert!(retry_at.is_none());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(h.status(&instance.id), InstanceStatus::Error);
    let stored = h.ctx.store.get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn test_hard_limit_is_terminal_for_retrying_category() {
    let policies = PolicyTable::default().with_limits(
        TaskCategory::Maintenance,
        TimeLimits {
            soft: Duration::from_secs(30),
            hard: Duration::from_millis(100),
        },
    );
    let h = Harness::new(policies);
    let id = h.running_instance().await;
    h.cluster.set_job_outcome(JobPhase::Active);

    let task = h
        .ctx
        .dispatcher
        .submit(TaskKind::Backup { instance_id: id.clone() })
        .unwrap();
    assert!(task.max_retries > 0);

    let settled = h.drain().await;
    assert_eq!(settled.len(), 1);
    assert!(matches!(settled[0], Settlement::Failed { retry_at: None, .. }));

    let stored = h.ctx.store.get_task(&task.id).unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert!(stored.error.unwrap().contains("hard time limit"));
    // Backups do not change the instance.
    assert_eq!(h.status(&id), InstanceStatus::Running);
}

#[tokio::test]
async fn test_terminate_passes_through_terminating() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;
    let names = h.ctx.store.require_instance(&id).unwrap().resource_names();

    h.ctx
        .dispatcher
        .submit(TaskKind::Terminate { instance_id: id.clone(), retain_volume: true })
        .unwrap();
    h.drain().await;
    assert_eq!(h.status(&id), InstanceStatus::Terminated);

    let tail: Vec<_> = h
        .ctx
        .store
        .list_transitions(&id)
        .unwrap()
        .into_iter()
        .rev()
        .take(2)
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        tail,
        vec![
            (InstanceStatus::Terminating, InstanceStatus::Terminated),
            (InstanceStatus::Running, InstanceStatus::Terminating),
        ]
    );

    assert!(!h.cluster.contains(ResourceKind::Deployment, &names.deployment));
    assert!(!h.cluster.contains(ResourceKind::Service, &names.service));
    assert!(h.cluster.contains(ResourceKind::VolumeClaim, &names.volume));
    assert!(h.cluster.contains(ResourceKind::Secret, &names.credentials_secret));

    // Nothing more can be queued for a terminated instance.
    let err = h.ctx.dispatcher.submit(TaskKind::Start { instance_id: id }).unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
}

#[tokio::test]
async fn test_missing_workload_marks_error() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;
    let deployment = h.ctx.store.require_instance(&id).unwrap().deployment_name;
    h.cluster.remove(ResourceKind::Deployment, &deployment);

    h.ctx.dispatcher.submit(TaskKind::HealthCheck { instance_id: id.clone() }).unwrap();
    h.drain().await;

    let instance = h.ctx.store.require_instance(&id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Error);
    assert!(instance.last_health_check.is_some());
    assert_eq!(h.alerts.count_for(&id), 1);
}

#[tokio::test]
async fn test_backup_then_restore() {
    let h = Harness::new(PolicyTable::default());
    let id = h.running_instance().await;

    h.ctx.dispatcher.submit(TaskKind::Backup { instance_id: id.clone() }).unwrap();
    let settled = h.drain().await;
    let backup_name = match &settled[0] {
        Settlement::Completed(result) => result["backup_name"].as_str().unwrap().to_string(),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(h.ctx.backups.list_backups(&id).unwrap().total_backups, 1);

    h.ctx
        .dispatcher
        .submit(TaskKind::Restore { instance_id: id.clone(), backup_name })
        .unwrap();
    let settled = h.drain().await;
    assert!(matches!(settled[0], Settlement::Completed(_)));
    assert_eq!(h.status(&id), InstanceStatus::Running);
    assert_eq!(h.cluster.count(ResourceKind::Job), 0);
}

#[tokio::test]
async fn test_scheduler_queues_unique_health_checks() {
    let h = Harness::new(PolicyTable::default());
    let _id = h.running_instance().await;
    let scheduler = hostplane_runtime::Scheduler::new(h.ctx.clone());

    // One health check plus the purge.
    assert_eq!(scheduler.tick().unwrap(), 2);
    assert_eq!(scheduler.tick().unwrap(), 0);
    h.drain().await;
    assert_eq!(scheduler.tick().unwrap(), 2);
}
