//! Task records: what a worker executes and what it is allowed to change.

use serde::{Deserialize, Serialize};

use crate::instance::InstanceStatus;

/// Task category. Determines the queue, retry policy and time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Provisioning,
    LifecycleOperation,
    Maintenance,
    Monitoring,
    Migration,
}

impl TaskCategory {
    pub fn all() -> &'static [TaskCategory] {
        &[
            Self::Provisioning,
            Self::LifecycleOperation,
            Self::Maintenance,
            Self::Monitoring,
            Self::Migration,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::LifecycleOperation => "lifecycle_operation",
            Self::Maintenance => "maintenance",
            Self::Monitoring => "monitoring",
            Self::Migration => "migration",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::all().iter().copied().find(|c| c.as_str() == s)
    }

    /// Categories whose tasks mutate instance lifecycle.
    pub fn is_instance_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::Provisioning | Self::LifecycleOperation | Self::Migration
        )
    }
}

/// Work a task performs. Serialized as the task payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Provision {
        instance_id: String,
    },
    Start {
        instance_id: String,
    },
    Stop {
        instance_id: String,
    },
    Restart {
        instance_id: String,
    },
    Terminate {
        instance_id: String,
        #[serde(default)]
        retain_volume: bool,
    },
    Migrate {
        instance_id: String,
        version: String,
    },
    Backup {
        instance_id: String,
    },
    Restore {
        instance_id: String,
        backup_name: String,
    },
    HealthCheck {
        instance_id: String,
    },
    ContainerDestroyed {
        instance_id: String,
        container_id: String,
    },
    PurgeTaskRecords {
        retention_secs: u64,
    },
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Provision { .. } => "provision",
            Self::Start { .. } => "start",
            Self::Stop { .. } => "stop",
            Self::Restart { .. } => "restart",
            Self::Terminate { .. } => "terminate",
            Self::Migrate { .. } => "migrate",
            Self::Backup { .. } => "backup",
            Self::Restore { .. } => "restore",
            Self::HealthCheck { .. } => "health_check",
            Self::ContainerDestroyed { .. } => "container_destroyed",
            Self::PurgeTaskRecords { .. } => "purge_task_records",
        }
    }

    pub fn category(&self) -> TaskCategory {
        match self {
            Self::Provision { .. } => TaskCategory::Provisioning,
            Self::Start { .. }
            | Self::Stop { .. }
            | Self::Restart { .. }
            | Self::Terminate { .. }
            | Self::Restore { .. } => TaskCategory::LifecycleOperation,
            Self::Migrate { .. } => TaskCategory::Migration,
            Self::Backup { .. } | Self::PurgeTaskRecords { .. } => TaskCategory::Maintenance,
            Self::HealthCheck { .. } | Self::ContainerDestroyed { .. } => TaskCategory::Monitoring,
        }
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Self::Provision { instance_id }
            | Self::Start { instance_id }
            | Self::Stop { instance_id }
            | Self::Restart { instance_id }
            | Self::Terminate { instance_id, .. }
            | Self::Migrate { instance_id, .. }
            | Self::Backup { instance_id }
            | Self::Restore { instance_id, .. }
            | Self::HealthCheck { instance_id }
            | Self::ContainerDestroyed { instance_id, .. } => Some(instance_id),
            Self::PurgeTaskRecords { .. } => None,
        }
    }

    /// Statuses this kind of task may write.
    fn targets(&self) -> &'static [InstanceStatus] {
        use InstanceStatus::*;
        match self {
            Self::Provision { .. } => &[Provisioning, Running, Error],
            Self::Start { .. } | Self::Restart { .. } | Self::Migrate { .. } => &[Running, Error],
            Self::Restore { .. } | Self::HealthCheck { .. } => &[Running, Error],
            Self::Stop { .. } => &[Stopped, Error],
            Self::Terminate { .. } => &[Terminating, Terminated, Error],
            Self::ContainerDestroyed { .. } => &[Error],
            Self::Backup { .. } | Self::PurgeTaskRecords { .. } => &[],
        }
    }

    /// Whether this task may move an instance from `from` to `to`.
    pub fn permits(&self, from: InstanceStatus, to: InstanceStatus) -> bool {
        self.targets().contains(&to) && from.can_transition_to(to)
    }
}

/// Delivery status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "started" => Self::Started,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// A task row from the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub category: TaskCategory,
    pub queue: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub status: TaskStatus,
    /// Deliveries so far, including redeliveries after a lost lease.
    pub attempts: u32,
    /// Automatic retries allowed after a failure; 0 for lifecycle operations.
    pub max_retries: u32,
    pub scheduled_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    /// Lease token held by the executing worker.
    #[serde(skip)]
    pub lease_token: Option<String>,
}
