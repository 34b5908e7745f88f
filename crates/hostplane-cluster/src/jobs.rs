//! One-shot jobs (backup and restore runs).

use std::sync::Arc;

use async_trait::async_trait;

use hostplane_core::Result;

use crate::connection::ConnectionOps;
use crate::types::{JobPhase, JobSpec, ResourceKind};

#[async_trait]
pub trait JobOps: Send + Sync {
    async fn launch(&self, spec: &JobSpec) -> Result<()>;

    async fn phase(&self, name: &str) -> Result<JobPhase>;

    async fn delete(&self, name: &str) -> Result<()>;
}

pub struct ApiJobs {
    connection: Arc<dyn ConnectionOps>,
}

impl ApiJobs {
    pub fn new(connection: Arc<dyn ConnectionOps>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl JobOps for ApiJobs {
    async fn launch(&self, spec: &JobSpec) -> Result<()> {
        self.connection
            .api()
            .await?
            .create(ResourceKind::Job, spec.to_manifest())
            .await
    }

    async fn phase(&self, name: &str) -> Result<JobPhase> {
        let job = self.connection.api().await?.get(ResourceKind::Job, name).await?;
        Ok(JobPhase::from_job(&job))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.connection.api().await?.delete(ResourceKind::Job, name).await
    }
}
