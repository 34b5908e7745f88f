//! Hostplane Core: error taxonomy, configuration, instance and task model.

pub mod config;
pub mod error;
pub mod instance;
pub mod task;

pub use config::{
    BackupSettings, ClusterMode, ClusterSettings, DataPaths, EventSettings, HostplaneConfig,
    WorkerSettings,
};
pub use error::{Error, Result};
pub use instance::{
    validate_version_tag, Instance, InstancePatch, InstanceStatus, NewInstance, ResourceNames,
    ResourceSizing,
};
pub use task::{TaskCategory, TaskKind, TaskRecord, TaskStatus};

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
