//! Persistent volume claims.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use hostplane_core::{Error, Result};

use crate::connection::ConnectionOps;
use crate::types::{ResourceKind, VolumeClaimSpec};

#[async_trait]
pub trait VolumeOps: Send + Sync {
    /// Create the claim unless it exists. Existing claims are never resized.
    async fn ensure(&self, spec: &VolumeClaimSpec) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;
}

pub struct ApiVolumes {
    connection: Arc<dyn ConnectionOps>,
}

impl ApiVolumes {
    pub fn new(connection: Arc<dyn ConnectionOps>) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl VolumeOps for ApiVolumes {
    async fn ensure(&self, spec: &VolumeClaimSpec) -> Result<()> {
        let api = self.connection.api().await?;
        match api.create(ResourceKind::VolumeClaim, spec.to_manifest()).await {
            Err(Error::Conflict(_)) => {
                debug!(claim = %spec.name, "Volume claim already present");
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.connection.api().await?.delete(ResourceKind::VolumeClaim, name).await
    }
}
