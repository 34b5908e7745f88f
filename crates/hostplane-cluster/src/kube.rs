//! REST transport for the orchestration platform.
//!
//! Inside a cluster the service-account token and CA bundle are used; outside
//! it a JSON connection profile names the API server and credentials.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use hostplane_core::{ClusterSettings, Error, Result};

use crate::api::{ClusterApi, Connector};
use crate::backoff::Backoff;
use crate::types::ResourceKind;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const PROFILE_ENV: &str = "HOSTPLANE_CLUSTER_PROFILE";

/// Out-of-cluster connection profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterProfile {
    /// API server base URL, e.g. `https://10.0.0.1:6443`.
    pub server: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,
    /// Overrides the configured namespace.
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ClusterProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

/// API server URL from the in-cluster service environment.
fn in_cluster_server(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

fn collection_path(kind: ResourceKind, namespace: &str) -> String {
    match kind {
        ResourceKind::Deployment => format!("/apis/apps/v1/namespaces/{}/deployments", namespace),
        ResourceKind::Service => format!("/api/v1/namespaces/{}/services", namespace),
        ResourceKind::VolumeClaim => {
            format!("/api/v1/namespaces/{}/persistentvolumeclaims", namespace)
        }
        ResourceKind::Secret => format!("/api/v1/namespaces/{}/secrets", namespace),
        ResourceKind::Job => format!("/apis/batch/v1/namespaces/{}/jobs", namespace),
    }
}

#[derive(Clone, Copy)]
enum Body<'a> {
    None,
    Json(&'a Value),
    MergePatch(&'a Value),
}

pub struct KubeRestApi {
    client: reqwest::Client,
    server: String,
    namespace: String,
    token: Option<String>,
    backoff: Backoff,
    max_retries: u32,
}

impl KubeRestApi {
    pub fn new(profile: &ClusterProfile, settings: &ClusterSettings) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .danger_accept_invalid_certs(profile.insecure_skip_tls_verify);
        if let Some(ca) = &profile.ca_cert_path {
            let pem = std::fs::read(ca)
                .map_err(|e| Error::Config(format!("{}: {}", ca.display(), e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("{}: {}", ca.display(), e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            server: profile.server.trim_end_matches('/').to_string(),
            namespace: profile
                .namespace
                .clone()
                .unwrap_or_else(|| settings.namespace.clone()),
            token: profile.token.clone(),
            backoff: Backoff::new(settings.base_delay()),
            max_retries: settings.max_retries.max(1),
        })
    }

    fn url(&self, kind: ResourceKind, name: Option<&str>) -> String {
        let collection = collection_path(kind, &self.namespace);
        match name {
            Some(name) => format!("{}{}/{}", self.server, collection, name),
            None => format!("{}{}", self.server, collection),
        }
    }

    /// Issue a request, retrying transport faults and 5xx responses with
    /// exponential backoff.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Body<'_>,
    ) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            let mut request = self.client.request(method.clone(), url).query(query);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            request = match body {
                Body::None => request,
                Body::Json(value) => request.json(value),
                Body::MergePatch(value) => request
                    .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
                    .body(serde_json::to_vec(value)?),
            };

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = response
                            .bytes()
                            .await
                            .map_err(|e| Error::Http(format!("{} {}: {}", method, url, e)))?;
                        if bytes.is_empty() {
                            return Ok(Value::Null);
                        }
                        return Ok(serde_json::from_slice(&bytes)?);
                    }
                    let text = response.text().await.unwrap_or_default();
                    match status {
                        StatusCode::NOT_FOUND => {
                            return Err(Error::NotFound(format!("{} {}", method, url)));
                        }
                        StatusCode::CONFLICT => {
                            return Err(Error::Conflict(format!("{} {}: {}", method, url, text)));
                        }
                        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                            last_error = format!("{} {}", status, text);
                        }
                        _ => {
                            return Err(Error::Http(format!(
                                "{} {}: {} {}",
                                method, url, status, text
                            )));
                        }
                    }
                }
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(Error::Http(format!("{} {}: {}", method, url, e))),
            }

            if attempt + 1 < self.max_retries {
                let delay = self.backoff.delay_for(attempt);
                warn!(
                    method = %method,
                    url = %url,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Cluster request failed, retrying"
                );
                sleep(delay).await;
            }
        }

        Err(Error::Connectivity(format!(
            "{} {} failed after {} attempts: {}",
            method, url, self.max_retries, last_error
        )))
    }
}

#[async_trait]
impl ClusterApi for KubeRestApi {
    async fn create(&self, kind: ResourceKind, manifest: Value) -> Result<()> {
        let url = self.url(kind, None);
        self.send(Method::POST, &url, &[], Body::Json(&manifest)).await?;
        Ok(())
    }

    async fn patch(&self, kind: ResourceKind, name: &str, patch: Value) -> Result<()> {
        let url = self.url(kind, Some(name));
        self.send(Method::PATCH, &url, &[], Body::MergePatch(&patch)).await?;
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value> {
        let url = self.url(kind, Some(name));
        self.send(Method::GET, &url, &[], Body::None).await
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        let url = self.url(kind, Some(name));
        // Without background propagation a deleted job leaves its pods behind.
        let query = match kind {
            ResourceKind::Job => vec![("propagationPolicy", "Background".to_string())],
            _ => Vec::new(),
        };
        self.send(Method::DELETE, &url, &query, Body::None).await?;
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let url = self.url(kind, None);
        let mut query = vec![("limit", limit.to_string())];
        if let Some(selector) = label_selector {
            query.push(("labelSelector", selector.to_string()));
        }
        let response = self.send(Method::GET, &url, &query, Body::None).await?;
        Ok(response["items"].as_array().cloned().unwrap_or_default())
    }
}

/// Discovers how to reach the API server and opens a [`KubeRestApi`].
pub struct KubeConnector {
    settings: ClusterSettings,
}

impl KubeConnector {
    pub fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    async fn discover(&self) -> Result<ClusterProfile> {
        if let (Ok(host), Ok(port)) = (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            let dir = Path::new(SERVICE_ACCOUNT_DIR);
            let token = tokio::fs::read_to_string(dir.join("token"))
                .await
                .map_err(|e| Error::Config(format!("service account token: {}", e)))?;
            debug!(host = %host, "Using in-cluster configuration");
            return Ok(ClusterProfile {
                server: in_cluster_server(&host, &port),
                token: Some(token.trim().to_string()),
                ca_cert_path: Some(dir.join("ca.crt")),
                insecure_skip_tls_verify: false,
                namespace: None,
            });
        }

        let path = self
            .settings
            .profile_path
            .clone()
            .or_else(|| std::env::var(PROFILE_ENV).ok().map(PathBuf::from))
            .ok_or_else(|| {
                Error::Config(format!(
                    "not running in a cluster and no connection profile (set cluster.profile_path or {})",
                    PROFILE_ENV
                ))
            })?;
        debug!(profile = %path.display(), "Using local connection profile");
        ClusterProfile::load(&path)
    }
}

#[async_trait]
impl Connector for KubeConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
        let profile = self.discover().await?;
        let api = KubeRestApi::new(&profile, &self.settings)?;
        api.list(ResourceKind::Deployment, None, 1).await?;
        Ok(Arc::new(api))
    }

    fn describe(&self) -> String {
        format!("cluster namespace {}", self.settings.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_cluster_server_brackets_ipv6() {
        assert_eq!(in_cluster_server("10.0.0.1", "443"), "https://10.0.0.1:443");
        assert_eq!(in_cluster_server("fd00::1", "443"), "https://[fd00::1]:443");
    }

    #[test]
    fn test_collection_paths() {
        assert_eq!(
            collection_path(ResourceKind::Deployment, "ns"),
            "/apis/apps/v1/namespaces/ns/deployments"
        );
        assert_eq!(
            collection_path(ResourceKind::VolumeClaim, "ns"),
            "/api/v1/namespaces/ns/persistentvolumeclaims"
        );
        assert_eq!(collection_path(ResourceKind::Job, "ns"), "/apis/batch/v1/namespaces/ns/jobs");
    }

    #[test]
    fn test_profile_namespace_overrides_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(
            &path,
            r#"{"server": "https://api.example:6443/", "token": "t", "namespace": "staging"}"#,
        )
        .unwrap();
        let profile = ClusterProfile::load(&path).unwrap();
        let api = KubeRestApi::new(&profile, &ClusterSettings::default()).unwrap();
        assert_eq!(
            api.url(ResourceKind::Service, Some("web")),
            "https://api.example:6443/api/v1/namespaces/staging/services/web"
        );
    }

    #[test]
    fn test_missing_profile_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ClusterProfile::load(&dir.path().join("nope.json")),
            Err(Error::Config(_))
        ));
    }
}
