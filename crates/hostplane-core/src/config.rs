//! Configuration and data directory management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// Paths to all Hostplane data directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPaths {
    /// Root data directory (e.g., `data/`).
    pub root: PathBuf,
    /// SQLite state store directory (`data/db/`).
    pub db: PathBuf,
    /// Shared, network-backed backup directory (`data/backups/` unless overridden).
    pub backups: PathBuf,
    /// Optional settings file (`data/hostplane.json`).
    pub settings_file: PathBuf,
}

impl DataPaths {
    /// Create data paths from a root directory. Creates directories if needed.
    pub fn new(root: impl AsRef<Path>) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let paths = Self {
            db: root.join("db"),
            backups: root.join("backups"),
            settings_file: root.join("hostplane.json"),
            root,
        };
        paths.ensure_dirs()?;
        Ok(paths)
    }

    /// Point backups at a shared mount outside the data root.
    pub fn with_backups(mut self, dir: impl AsRef<Path>) -> std::io::Result<Self> {
        self.backups = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&self.backups)?;
        Ok(self)
    }

    fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.db)?;
        std::fs::create_dir_all(&self.backups)?;
        Ok(())
    }
}

/// Which cluster transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Talk to the orchestration platform's REST API.
    Kube,
    /// Keep resources in process memory (local development).
    Memory,
}

/// Cluster connection and workload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_mode")]
    pub mode: ClusterMode,
    /// Connection attempts before giving up with a connectivity error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Minimum spacing between connectivity probes.
    #[serde(default = "default_revalidate_secs")]
    pub revalidate_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Local connection profile used outside the cluster.
    #[serde(default)]
    pub profile_path: Option<PathBuf>,
    /// Workload image repository; the instance version is the tag.
    #[serde(default = "default_workload_image")]
    pub workload_image: String,
    #[serde(default = "default_workload_port")]
    pub workload_port: u16,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

fn default_namespace() -> String {
    "hostplane-instances".into()
}
fn default_mode() -> ClusterMode {
    ClusterMode::Kube
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_revalidate_secs() -> u64 {
    30
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_workload_image() -> String {
    "registry.hostplane.local/tenant-app".into()
}
fn default_workload_port() -> u16 {
    8069
}
fn default_ready_timeout_secs() -> u64 {
    300
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            mode: default_mode(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            revalidate_secs: default_revalidate_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            profile_path: None,
            workload_image: default_workload_image(),
            workload_port: default_workload_port(),
            storage_class: None,
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl ClusterSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn revalidate_interval(&self) -> Duration {
        Duration::from_secs(self.revalidate_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }
}

/// Backup/restore job settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Volume claim backing the shared backup directory inside jobs.
    #[serde(default = "default_shared_claim")]
    pub shared_claim: String,
    /// Mount point of the shared claim inside job containers.
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default = "default_tools_image")]
    pub tools_image: String,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_shared_claim() -> String {
    "hostplane-backups".into()
}
fn default_mount_path() -> String {
    "/backups".into()
}
fn default_tools_image() -> String {
    "registry.hostplane.local/backup-tools:1".into()
}
fn default_job_timeout_secs() -> u64 {
    3300
}
fn default_poll_interval_ms() -> u64 {
    2000
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            shared_claim: default_shared_claim(),
            mount_path: default_mount_path(),
            tools_image: default_tools_image(),
            job_timeout_secs: default_job_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Number of single-task workers in this process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queues to consume; empty means all.
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default = "default_worker_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
    /// How long finished task records are kept.
    #[serde(default = "default_task_retention_secs")]
    pub task_retention_secs: u64,
}

fn default_concurrency() -> usize {
    2
}
fn default_worker_poll_ms() -> u64 {
    500
}
fn default_health_interval_secs() -> u64 {
    300
}
fn default_task_retention_secs() -> u64 {
    86_400
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queues: Vec::new(),
            poll_interval_ms: default_worker_poll_ms(),
            health_check_interval_secs: default_health_interval_secs(),
            task_retention_secs: default_task_retention_secs(),
        }
    }
}

/// Container runtime event subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_docker_url")]
    pub docker_url: String,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_docker_url() -> String {
    "http://127.0.0.1:2375".into()
}
fn default_reconnect_base_ms() -> u64 {
    1000
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            docker_url: default_docker_url(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

/// Contents of the optional `hostplane.json` settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    cluster: ClusterSettings,
    #[serde(default)]
    backup: BackupSettings,
    #[serde(default)]
    worker: WorkerSettings,
    #[serde(default)]
    events: EventSettings,
}

/// Top-level Hostplane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostplaneConfig {
    /// HTTP server port.
    pub port: u16,
    pub data_paths: DataPaths,
    pub cluster: ClusterSettings,
    pub backup: BackupSettings,
    pub worker: WorkerSettings,
    pub events: EventSettings,
}

impl HostplaneConfig {
    /// Load `hostplane.json` from the data directory (if present), then apply
    /// environment overrides.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self> {
        let mut data_paths = DataPaths::new(data_dir)?;

        let file: SettingsFile = match std::fs::read_to_string(&data_paths.settings_file) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!(
                    "{}: {}",
                    data_paths.settings_file.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SettingsFile::default(),
            Err(e) => return Err(e.into()),
        };

        let mut config = Self {
            port: file.port.unwrap_or(8080),
            data_paths: data_paths.clone(),
            cluster: file.cluster,
            backup: file.backup,
            worker: file.worker,
            events: file.events,
        };

        if let Ok(port) = std::env::var("PORT") {
            config.port = port
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a port number: {}", port)))?;
        }
        if let Ok(ns) = std::env::var("HOSTPLANE_NAMESPACE") {
            config.cluster.namespace = ns;
        }
        if let Ok(mode) = std::env::var("HOSTPLANE_CLUSTER_MODE") {
            config.cluster.mode = match mode.as_str() {
                "kube" => ClusterMode::Kube,
                "memory" => ClusterMode::Memory,
                other => {
                    return Err(Error::Config(format!("unknown cluster mode: {}", other)));
                }
            };
        }
        if let Ok(url) = std::env::var("HOSTPLANE_DOCKER_URL") {
            config.events.docker_url = url;
        }
        if let Ok(workers) = std::env::var("HOSTPLANE_WORKERS") {
            config.worker.concurrency = workers
                .parse()
                .map_err(|_| Error::Config(format!("HOSTPLANE_WORKERS: {}", workers)))?;
        }
        if let Ok(dir) = std::env::var("HOSTPLANE_BACKUP_DIR") {
            data_paths = data_paths.with_backups(dir)?;
            config.data_paths = data_paths;
        }

        config.validate()?;
        info!(
            namespace = %config.cluster.namespace,
            mode = ?config.cluster.mode,
            workers = config.worker.concurrency,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Configuration with defaults rooted at `data_dir`, ignoring file and env.
    pub fn with_defaults(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        Ok(Self {
            port: 8080,
            data_paths: DataPaths::new(data_dir)?,
            cluster: ClusterSettings::default(),
            backup: BackupSettings::default(),
            worker: WorkerSettings::default(),
            events: EventSettings::default(),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.max_retries == 0 {
            return Err(Error::Config("cluster.max_retries must be at least 1".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(Error::Config("worker.concurrency must be at least 1".into()));
        }
        if self.cluster.namespace.is_empty() {
            return Err(Error::Config("cluster.namespace must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostplaneConfig::with_defaults(dir.path()).unwrap();
        assert_eq!(config.cluster.max_retries, 3);
        assert_eq!(config.cluster.base_delay(), Duration::from_secs(1));
        assert_eq!(config.cluster.revalidate_interval(), Duration::from_secs(30));
        assert!(config.data_paths.db.exists());
        assert!(config.data_paths.backups.exists());
    }

    #[test]
    fn test_settings_file_partial() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hostplane.json"),
            r#"{"cluster": {"namespace": "tenants", "mode": "memory"}, "worker": {"concurrency": 4}}"#,
        )
        .unwrap();
        let config = HostplaneConfig::load(dir.path()).unwrap();
        assert_eq!(config.cluster.namespace, "tenants");
        assert_eq!(config.cluster.mode, ClusterMode::Memory);
        assert_eq!(config.cluster.max_retries, 3);
        assert_eq!(config.worker.concurrency, 4);
        assert_eq!(config.backup.mount_path, "/backups");
    }

    #[test]
    fn test_settings_file_malformed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hostplane.json"), "{not json").unwrap();
        assert!(matches!(
            HostplaneConfig::load(dir.path()),
            Err(Error::Config(_))
        ));
    }
}
