//! Instance records, lifecycle status and deterministic resource naming.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Container image tag grammar.
static VERSION_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("valid regex"));

/// Recorded lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Error,
    Terminating,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "provisioning" => Self::Provisioning,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "error" => Self::Error,
            "terminating" => Self::Terminating,
            "terminated" => Self::Terminated,
            _ => return None,
        })
    }

    /// Lifecycle table. Which task may take an edge is decided by
    /// [`TaskKind::permits`](crate::TaskKind::permits).
    ///
    /// Self-edges exist for states a redelivered or in-place task re-enters.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminating) => true,
            (Terminating, Terminated) | (Terminating, Error) => true,
            (_, Terminated) => false,
            (Pending, Provisioning) | (Error, Provisioning) | (Provisioning, Provisioning) => true,
            (Provisioning, Running) | (Provisioning, Error) => true,
            (Running, Stopped) | (Stopped, Running) | (Running, Running) => true,
            (Running, Error) | (Stopped, Error) => true,
            _ => false,
        }
    }

    /// Whether the instance still has (or is acquiring) cluster resources.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU / memory / storage requested for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSizing {
    #[serde(default = "default_cpu")]
    pub cpu_millis: u32,
    #[serde(default = "default_memory")]
    pub memory_mb: u32,
    #[serde(default = "default_storage")]
    pub storage_gb: u32,
}

fn default_cpu() -> u32 {
    500
}
fn default_memory() -> u32 {
    1024
}
fn default_storage() -> u32 {
    10
}

impl Default for ResourceSizing {
    fn default() -> Self {
        Self {
            cpu_millis: default_cpu(),
            memory_mb: default_memory(),
            storage_gb: default_storage(),
        }
    }
}

impl ResourceSizing {
    pub fn validate(&self) -> Result<()> {
        if self.cpu_millis < 100 || self.cpu_millis > 16_000 {
            return Err(Error::Validation(format!(
                "cpu_millis out of range (100..=16000): {}",
                self.cpu_millis
            )));
        }
        if self.memory_mb < 256 || self.memory_mb > 65_536 {
            return Err(Error::Validation(format!(
                "memory_mb out of range (256..=65536): {}",
                self.memory_mb
            )));
        }
        if self.storage_gb == 0 || self.storage_gb > 2048 {
            return Err(Error::Validation(format!(
                "storage_gb out of range (1..=2048): {}",
                self.storage_gb
            )));
        }
        Ok(())
    }
}

/// Cluster resource names bound to an instance, derived only from its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceNames {
    pub deployment: String,
    pub service: String,
    pub volume: String,
    pub credentials_secret: String,
}

impl ResourceNames {
    pub fn for_instance(instance_id: &str) -> Self {
        let base = format!("inst-{}", instance_id.to_ascii_lowercase());
        Self {
            service: format!("{}-svc", base),
            volume: format!("{}-data", base),
            credentials_secret: format!("{}-credentials", base),
            deployment: base,
        }
    }
}

/// Validate a workload version tag.
pub fn validate_version_tag(version: &str) -> Result<()> {
    if VERSION_TAG.is_match(version) {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid version tag: {:?}", version)))
    }
}

/// An instance row from the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: InstanceStatus,
    pub version: String,
    pub sizing: ResourceSizing,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<i64>,
    pub deployment_name: String,
    pub service_name: String,
    pub volume_name: String,
}

impl Instance {
    pub fn resource_names(&self) -> ResourceNames {
        ResourceNames::for_instance(&self.id)
    }
}

/// Request to create an instance record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInstance {
    pub tenant_id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub sizing: ResourceSizing,
}

impl NewInstance {
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::Validation("tenant_id is required".into()));
        }
        let name = self.name.trim();
        if name.is_empty() || name.len() > 128 {
            return Err(Error::Validation(
                "name must be between 1 and 128 characters".into(),
            ));
        }
        validate_version_tag(&self.version)?;
        self.sizing.validate()
    }
}

/// Non-status fields a transition may update together with the status.
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    pub version: Option<String>,
    pub last_health_check: Option<i64>,
}
