//! Connection lifecycle and secret access.
//!
//! The cluster handle is established lazily on first use and cached. A
//! cached handle is revalidated with a cheap probe at most once per
//! `revalidate_every`; a failed probe drops the handle and re-establishes it
//! under the same bounded retry policy as the first connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use hostplane_core::{ClusterSettings, Error, Result};

use crate::api::{ClusterApi, Connector};
use crate::backoff::Backoff;
use crate::types::{ResourceKind, SecretSpec};

/// Connection lifecycle plus secret resolution.
#[async_trait]
pub trait ConnectionOps: Send + Sync {
    /// A validated cluster handle.
    async fn api(&self) -> Result<Arc<dyn ClusterApi>>;

    /// Decoded value of `key` in secret `name`.
    async fn resolve_secret(&self, name: &str, key: &str) -> Result<String>;

    /// Create the secret, or replace its data if it exists.
    async fn upsert_secret(&self, spec: &SecretSpec) -> Result<()>;

    async fn delete_secret(&self, name: &str) -> Result<()>;
}

struct Established {
    api: Arc<dyn ClusterApi>,
    validated_at: Instant,
}

/// Lazily established, periodically revalidated cluster connection.
///
/// The connection slot stays locked while a connection is being
/// established, backoff sleeps included, so concurrent callers wait behind
/// a single reconnect of up to `base * (2^(max_retries - 1) - 1)` rather than
/// racing their own.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    max_retries: u32,
    revalidate_every: Duration,
    state: Mutex<Option<Established>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        backoff: Backoff,
        max_retries: u32,
        revalidate_every: Duration,
    ) -> Self {
        Self {
            connector,
            backoff,
            max_retries: max_retries.max(1),
            revalidate_every,
            state: Mutex::new(None),
        }
    }

    pub fn from_settings(connector: Arc<dyn Connector>, settings: &ClusterSettings) -> Self {
        Self::new(
            connector,
            Backoff::new(settings.base_delay()),
            settings.max_retries,
            settings.revalidate_interval(),
        )
    }

    /// Attempt the connector up to `max_retries` times, sleeping
    /// `base * 2^attempt` between attempts.
    async fn establish(&self) -> Result<Arc<dyn ClusterApi>> {
        let target = self.connector.describe();
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            match self.connector.connect().await {
                Ok(api) => {
                    info!(target = %target, attempt = attempt + 1, "Cluster connection established");
                    return Ok(api);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < self.max_retries {
                        let delay = self.backoff.delay_for(attempt);
                        warn!(
                            target = %target,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Cluster connection failed, retrying"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(Error::Connectivity(format!(
            "{} unreachable after {} attempts: {}",
            target, self.max_retries, last_error
        )))
    }

    /// Drop the cached handle; the next call re-establishes.
    pub async fn reset(&self) {
        *self.state.lock().await = None;
    }
}

#[async_trait]
impl ConnectionOps for ConnectionManager {
    async fn api(&self) -> Result<Arc<dyn ClusterApi>> {
        let mut state = self.state.lock().await;

        if let Some(current) = state.as_mut() {
            if current.validated_at.elapsed() < self.revalidate_every {
                return Ok(current.api.clone());
            }
            match current.api.list(ResourceKind::Deployment, None, 1).await {
                Ok(_) => {
                    debug!("Cluster connection revalidated");
                    current.validated_at = Instant::now();
                    return Ok(current.api.clone());
                }
                Err(e) => {
                    warn!(error = %e, "Cluster connection probe failed, reconnecting");
                    *state = None;
                }
            }
        }

        let api = self.establish().await?;
        *state = Some(Established {
            api: api.clone(),
            validated_at: Instant::now(),
        });
        Ok(api)
    }

    async fn resolve_secret(&self, name: &str, key: &str) -> Result<String> {
        let secret = self.api().await?.get(ResourceKind::Secret, name).await?;
        let encoded = secret["data"][key]
            .as_str()
            .ok_or_else(|| Error::NotFound(format!("key {} in secret {}", key, name)))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Internal(format!("secret {} key {}: {}", name, key, e)))?;
        String::from_utf8(bytes)
            .map_err(|e| Error::Internal(format!("secret {} key {}: {}", name, key, e)))
    }

    async fn upsert_secret(&self, spec: &SecretSpec) -> Result<()> {
        let api = self.api().await?;
        let manifest = spec.to_manifest();
        match api.create(ResourceKind::Secret, manifest.clone()).await {
            Err(Error::Conflict(_)) => {
                api.patch(
                    ResourceKind::Secret,
                    &spec.name,
                    serde_json::json!({ "data": manifest["data"] }),
                )
                .await
            }
            other => other,
        }
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.api().await?.delete(ResourceKind::Secret, name).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::memory::{MemoryCluster, StaticConnector};
    use crate::types::ADMIN_PASSWORD_KEY;

    struct Unreachable {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Connectivity("connection refused".into()))
        }

        fn describe(&self) -> String {
            "unreachable".into()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_with_exponential_delay() {
        let connector = Arc::new(Unreachable { attempts: AtomicU32::new(0) });
        let manager = ConnectionManager::new(
            connector.clone(),
            Backoff::new(Duration::from_secs(1)),
            3,
            Duration::from_secs(30),
        );

        let started = Instant::now();
        let err = manager.api().await.err().unwrap();
        assert!(matches!(err, Error::Connectivity(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        // 1s after the first attempt, 2s after the second, none after the last.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_reconnects() {
        let cluster = Arc::new(MemoryCluster::new());
        let connector = Arc::new(StaticConnector::new(cluster.clone()));
        let manager = ConnectionManager::new(
            connector.clone(),
            Backoff::new(Duration::from_millis(10)),
            3,
            Duration::from_secs(30),
        );

        manager.api().await.unwrap();
        assert_eq!(connector.connects(), 1);

        // Within the revalidation window the cached handle is reused.
        manager.api().await.unwrap();
        assert_eq!(connector.connects(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        cluster.fail_next(1);
        manager.api().await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_secret_roundtrip() {
        let cluster = Arc::new(MemoryCluster::new());
        let manager = ConnectionManager::new(
            Arc::new(StaticConnector::new(cluster)),
            Backoff::new(Duration::from_millis(1)),
            1,
            Duration::from_secs(30),
        );

        let mut data = BTreeMap::new();
        data.insert(ADMIN_PASSWORD_KEY.to_string(), "first".to_string());
        let mut spec = SecretSpec { name: "creds".into(), labels: BTreeMap::new(), data };
        manager.upsert_secret(&spec).await.unwrap();
        assert_eq!(manager.resolve_secret("creds", ADMIN_PASSWORD_KEY).await.unwrap(), "first");

        spec.data.insert(ADMIN_PASSWORD_KEY.to_string(), "second".to_string());
        manager.upsert_secret(&spec).await.unwrap();
        assert_eq!(manager.resolve_secret("creds", ADMIN_PASSWORD_KEY).await.unwrap(), "second");

        assert!(matches!(
            manager.resolve_secret("creds", "missing").await,
            Err(Error::NotFound(_))
        ));
        manager.delete_secret("creds").await.unwrap();
        assert!(matches!(
            manager.resolve_secret("creds", ADMIN_PASSWORD_KEY).await,
            Err(Error::NotFound(_))
        ));
    }
}
