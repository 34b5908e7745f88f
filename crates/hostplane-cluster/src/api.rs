//! Transport seam between the capability implementations and a cluster.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use hostplane_core::Result;

use crate::types::ResourceKind;

/// Namespaced object CRUD against the orchestration platform.
///
/// Implementations report an existing object on create as `Error::Conflict`
/// and a missing object as `Error::NotFound`; neither is retried.
/// Transient transport faults surface as `Error::Connectivity` only after
/// the transport's own retries are exhausted.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create(&self, kind: ResourceKind, manifest: Value) -> Result<()>;

    /// JSON merge patch (RFC 7386).
    async fn patch(&self, kind: ResourceKind, name: &str, patch: Value) -> Result<()>;

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()>;

    /// Bounded list; `limit` keeps connectivity probes cheap.
    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>>;
}

/// Establishes a [`ClusterApi`] handle. A single call is one attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>>;

    fn describe(&self) -> String;
}
