//! Resource specifications and the manifests they render to.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Label marking objects owned by hostplane.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "hostplane";
/// Label carrying the owning instance id; also propagated to containers.
pub const INSTANCE_LABEL: &str = "hostplane.io/instance-id";
pub const TENANT_LABEL: &str = "hostplane.io/tenant-id";
pub const RESTARTED_AT_ANNOTATION: &str = "hostplane.io/restarted-at";

/// Key of the admin credential inside an instance credentials secret.
pub const ADMIN_PASSWORD_KEY: &str = "admin-password";

/// Kinds of namespaced objects the manager touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Deployment,
    Service,
    VolumeClaim,
    Job,
    Secret,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Deployment => "deployment",
            Self::Service => "service",
            Self::VolumeClaim => "persistentvolumeclaim",
            Self::Job => "job",
            Self::Secret => "secret",
        };
        f.write_str(s)
    }
}

/// Read the `metadata.name` of a manifest.
pub fn manifest_name(manifest: &Value) -> Option<&str> {
    manifest.pointer("/metadata/name").and_then(|v| v.as_str())
}

pub fn instance_labels(instance_id: &str, tenant_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(INSTANCE_LABEL.to_string(), instance_id.to_string());
    labels.insert(TENANT_LABEL.to_string(), tenant_id.to_string());
    labels
}

/// Long-running workload bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentSpec {
    pub name: String,
    pub instance_id: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub replicas: u32,
    pub port: u16,
    pub cpu_millis: u32,
    pub memory_mb: u32,
    pub volume_claim: String,
    pub credentials_secret: String,
}

impl DeploymentSpec {
    pub fn to_manifest(&self) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": self.name, "labels": self.labels },
            "spec": {
                "replicas": self.replicas,
                // A single RWO volume cannot be shared by old and new pods.
                "strategy": { "type": "Recreate" },
                "selector": { "matchLabels": { INSTANCE_LABEL: self.instance_id } },
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": {
                        "containers": [{
                            "name": "app",
                            "image": self.image,
                            "ports": [{ "containerPort": self.port }],
                            "env": [{
                                "name": "ADMIN_PASSWORD",
                                "valueFrom": { "secretKeyRef": {
                                    "name": self.credentials_secret,
                                    "key": ADMIN_PASSWORD_KEY,
                                }},
                            }],
                            "resources": {
                                "requests": {
                                    "cpu": format!("{}m", self.cpu_millis),
                                    "memory": format!("{}Mi", self.memory_mb),
                                },
                                "limits": {
                                    "cpu": format!("{}m", self.cpu_millis * 2),
                                    "memory": format!("{}Mi", self.memory_mb),
                                },
                            },
                            "volumeMounts": [{ "name": "data", "mountPath": "/var/lib/app" }],
                            "readinessProbe": {
                                "tcpSocket": { "port": self.port },
                                "initialDelaySeconds": 10,
                                "periodSeconds": 10,
                            },
                        }],
                        "volumes": [{
                            "name": "data",
                            "persistentVolumeClaim": { "claimName": self.volume_claim },
                        }],
                    },
                },
            },
        })
    }
}

/// Network service in front of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub instance_id: String,
    pub labels: BTreeMap<String, String>,
    pub port: u16,
}

impl ServiceSpec {
    pub fn to_manifest(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": self.name, "labels": self.labels },
            "spec": {
                "type": "ClusterIP",
                "selector": { INSTANCE_LABEL: self.instance_id },
                "ports": [{ "name": "http", "port": self.port, "targetPort": self.port }],
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeClaimSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub storage_gb: u32,
    pub storage_class: Option<String>,
}

impl VolumeClaimSpec {
    pub fn to_manifest(&self) -> Value {
        let mut spec = json!({
            "accessModes": ["ReadWriteOnce"],
            "resources": { "requests": { "storage": format!("{}Gi", self.storage_gb) } },
        });
        if let Some(class) = &self.storage_class {
            spec["storageClassName"] = json!(class);
        }
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": { "name": self.name, "labels": self.labels },
            "spec": spec,
        })
    }
}

/// A volume mounted into a job container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMount {
    pub claim: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// One-shot job (backup, restore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<JobMount>,
    pub deadline_secs: u64,
}

impl JobSpec {
    pub fn to_manifest(&self) -> Value {
        let env: Vec<Value> = self
            .env
            .iter()
            .map(|(k, v)| json!({ "name": k, "value": v }))
            .collect();
        let volume_mounts: Vec<Value> = self
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| {
                json!({ "name": format!("vol{}", i), "mountPath": m.mount_path, "readOnly": m.read_only })
            })
            .collect();
        let volumes: Vec<Value> = self
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| {
                json!({ "name": format!("vol{}", i), "persistentVolumeClaim": { "claimName": m.claim } })
            })
            .collect();

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": self.name, "labels": self.labels },
            "spec": {
                // Jobs are re-run by resubmitting the task, never by the platform.
                "backoffLimit": 0,
                "activeDeadlineSeconds": self.deadline_secs,
                "ttlSecondsAfterFinished": 3600,
                "template": {
                    "metadata": { "labels": self.labels },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": "job",
                            "image": self.image,
                            "command": self.command,
                            "env": env,
                            "volumeMounts": volume_mounts,
                        }],
                        "volumes": volumes,
                    },
                },
            },
        })
    }
}

/// Opaque secret; values are base64-encoded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, String>,
}

impl SecretSpec {
    pub fn to_manifest(&self) -> Value {
        let data: BTreeMap<&String, String> = self
            .data
            .iter()
            .map(|(k, v)| (k, STANDARD.encode(v.as_bytes())))
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": { "name": self.name, "labels": self.labels },
            "data": data,
        })
    }
}

/// Observed phase of a one-shot job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Active,
    Succeeded,
    Failed,
}

impl JobPhase {
    /// Derive the phase from a job object's `status`.
    pub fn from_job(job: &Value) -> Self {
        let status = &job["status"];
        if let Some(conditions) = status["conditions"].as_array() {
            for cond in conditions {
                if cond["status"] != "True" {
                    continue;
                }
                match cond["type"].as_str() {
                    Some("Complete") => return Self::Succeeded,
                    Some("Failed") => return Self::Failed,
                    _ => {}
                }
            }
        }
        if status["succeeded"].as_u64().unwrap_or(0) > 0 {
            Self::Succeeded
        } else if status["failed"].as_u64().unwrap_or(0) > 0 {
            Self::Failed
        } else {
            Self::Active
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// Replica readiness of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkloadHealth {
    pub desired: u32,
    pub ready: u32,
}

impl WorkloadHealth {
    pub fn from_deployment(deployment: &Value) -> Self {
        Self {
            desired: deployment["spec"]["replicas"].as_u64().unwrap_or(0) as u32,
            ready: deployment["status"]["readyReplicas"].as_u64().unwrap_or(0) as u32,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready >= self.desired
    }
}

/// Names of the objects bound to an instance after an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadRef {
    pub deployment: String,
    pub service: String,
    pub volume: String,
}

/// What a teardown actually removed. `false` means it was already gone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub deployment_deleted: bool,
    pub service_deleted: bool,
    pub volume_deleted: bool,
    pub volume_retained: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_manifest_encodes_values() {
        let mut data = BTreeMap::new();
        data.insert(ADMIN_PASSWORD_KEY.to_string(), "s3cret!".to_string());
        let spec = SecretSpec { name: "s".into(), labels: BTreeMap::new(), data };
        let manifest = spec.to_manifest();
        assert_eq!(manifest["data"][ADMIN_PASSWORD_KEY], STANDARD.encode("s3cret!"));
    }

    #[test]
    fn test_job_phase_from_status() {
        assert_eq!(JobPhase::from_job(&json!({"status": {"active": 1}})), JobPhase::Active);
        assert_eq!(JobPhase::from_job(&json!({"status": {"succeeded": 1}})), JobPhase::Succeeded);
        assert_eq!(JobPhase::from_job(&json!({"status": {"failed": 1}})), JobPhase::Failed);
        let failed = json!({"status": {"conditions": [{"type": "Failed", "status": "True"}]}});
        assert_eq!(JobPhase::from_job(&failed), JobPhase::Failed);
        assert_eq!(JobPhase::from_job(&json!({})), JobPhase::Active);
    }

    #[test]
    fn test_volume_claim_storage_class() {
        let spec = VolumeClaimSpec {
            name: "v".into(),
            labels: BTreeMap::new(),
            storage_gb: 20,
            storage_class: Some("fast".into()),
        };
        let manifest = spec.to_manifest();
        assert_eq!(manifest["spec"]["resources"]["requests"]["storage"], "20Gi");
        assert_eq!(manifest["spec"]["storageClassName"], "fast");
    }

    #[test]
    fn test_deployment_selector_uses_instance_label() {
        let spec = DeploymentSpec {
            name: "inst-a".into(),
            instance_id: "a".into(),
            labels: instance_labels("a", "t"),
            image: "img:1".into(),
            replicas: 1,
            port: 8069,
            cpu_millis: 500,
            memory_mb: 1024,
            volume_claim: "inst-a-data".into(),
            credentials_secret: "inst-a-credentials".into(),
        };
        let manifest = spec.to_manifest();
        assert_eq!(manifest["spec"]["selector"]["matchLabels"][INSTANCE_LABEL], "a");
        assert_eq!(manifest_name(&manifest), Some("inst-a"));
        assert_eq!(
            manifest["spec"]["template"]["spec"]["containers"][0]["resources"]["requests"]["cpu"],
            "500m"
        );
    }
}
