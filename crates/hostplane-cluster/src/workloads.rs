//! Deployments and services.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use hostplane_core::{Error, Result};

use crate::connection::ConnectionOps;
use crate::types::{
    DeploymentSpec, ResourceKind, ServiceSpec, WorkloadHealth, RESTARTED_AT_ANNOTATION,
};

#[async_trait]
pub trait WorkloadOps: Send + Sync {
    /// Create the deployment, or bring an existing one to `spec`.
    async fn apply_deployment(&self, spec: &DeploymentSpec) -> Result<()>;

    async fn apply_service(&self, spec: &ServiceSpec) -> Result<()>;

    async fn scale(&self, deployment: &str, replicas: u32) -> Result<()>;

    /// Roll the pods of a deployment in place.
    async fn restart(&self, deployment: &str) -> Result<()>;

    async fn delete_deployment(&self, name: &str) -> Result<()>;

    async fn delete_service(&self, name: &str) -> Result<()>;

    async fn health(&self, deployment: &str) -> Result<WorkloadHealth>;
}

pub struct ApiWorkloads {
    connection: Arc<dyn ConnectionOps>,
}

impl ApiWorkloads {
    pub fn new(connection: Arc<dyn ConnectionOps>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl WorkloadOps for ApiWorkloads {
    async fn apply_deployment(&self, spec: &DeploymentSpec) -> Result<()> {
        let api = self.connection.api().await?;
        let manifest = spec.to_manifest();
        match api.create(ResourceKind::Deployment, manifest.clone()).await {
            Err(Error::Conflict(_)) => {
                debug!(deployment = %spec.name, "Deployment exists, patching");
                api.patch(
                    ResourceKind::Deployment,
                    &spec.name,
                    json!({ "metadata": manifest["metadata"], "spec": manifest["spec"] }),
                )
                .await
            }
            other => other,
        }
    }

    async fn apply_service(&self, spec: &ServiceSpec) -> Result<()> {
        let api = self.connection.api().await?;
        let manifest = spec.to_manifest();
        match api.create(ResourceKind::Service, manifest.clone()).await {
            Err(Error::Conflict(_)) => {
                api.patch(
                    ResourceKind::Service,
                    &spec.name,
                    json!({ "metadata": { "labels": manifest["metadata"]["labels"] } }),
                )
                .await
            }
            other => other,
        }
    }

    async fn scale(&self, deployment: &str, replicas: u32) -> Result<()> {
        self.connection
            .api()
            .await?
            .patch(
                ResourceKind::Deployment,
                deployment,
                json!({ "spec": { "replicas": replicas } }),
            )
            .await
    }

    async fn restart(&self, deployment: &str) -> Result<()> {
        let stamp = chrono::Utc::now().to_rfc3339();
        self.connection
            .api()
            .await?
            .patch(
                ResourceKind::Deployment,
                deployment,
                json!({
                    "spec": { "template": { "metadata": { "annotations": {
                        RESTARTED_AT_ANNOTATION: stamp,
                    } } } }
                }),
            )
            .await
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        self.connection.api().await?.delete(ResourceKind::Deployment, name).await
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        self.connection.api().await?.delete(ResourceKind::Service, name).await
    }

    async fn health(&self, deployment: &str) -> Result<WorkloadHealth> {
        let obj = self
            .connection
            .api()
            .await?
            .get(ResourceKind::Deployment, deployment)
            .await?;
        Ok(WorkloadHealth::from_deployment(&obj))
    }
}
