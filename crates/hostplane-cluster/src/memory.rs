//! In-process cluster for local development and tests.
//!
//! Objects live in a map keyed by kind and name. Deployments report every
//! desired replica ready unless stalled; jobs finish immediately with the
//! configured outcome.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use hostplane_core::{Error, Result};

use crate::api::{ClusterApi, Connector};
use crate::types::{manifest_name, JobPhase, ResourceKind};

#[derive(Debug, Clone, Copy)]
enum Fault {
    Connectivity,
    Timeout,
}

struct Inner {
    objects: BTreeMap<(ResourceKind, String), Value>,
    pending_faults: Vec<Fault>,
    stalled: HashSet<String>,
    job_outcome: JobPhase,
}

pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                pending_faults: Vec::new(),
                stalled: HashSet::new(),
                job_outcome: JobPhase::Succeeded,
            }),
        }
    }

    /// Fail the next `n` calls with a connectivity error.
    pub fn fail_next(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.pending_faults.extend(std::iter::repeat(Fault::Connectivity).take(n));
    }

    /// Fail the next `n` calls with a timeout.
    pub fn time_out_next(&self, n: usize) {
        let mut inner = self.inner.lock();
        inner.pending_faults.extend(std::iter::repeat(Fault::Timeout).take(n));
    }

    /// Keep a deployment's ready replicas at zero.
    pub fn stall_deployment(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.stalled.insert(name.to_string());
        if let Some(obj) = inner.objects.get_mut(&(ResourceKind::Deployment, name.to_string())) {
            obj["status"] = json!({ "readyReplicas": 0 });
        }
    }

    /// Outcome of jobs created from now on.
    pub fn set_job_outcome(&self, phase: JobPhase) {
        self.inner.lock().job_outcome = phase;
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.inner.lock().objects.contains_key(&(kind, name.to_string()))
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<Value> {
        self.inner.lock().objects.get(&(kind, name.to_string())).cloned()
    }

    pub fn count(&self, kind: ResourceKind) -> usize {
        self.inner.lock().objects.keys().filter(|(k, _)| *k == kind).count()
    }

    /// Remove an object behind the manager's back, as an operator or the
    /// platform itself would.
    pub fn remove(&self, kind: ResourceKind, name: &str) -> Option<Value> {
        self.inner.lock().objects.remove(&(kind, name.to_string()))
    }

    fn take_fault(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.pending_faults.is_empty() {
            return Ok(());
        }
        match inner.pending_faults.remove(0) {
            Fault::Connectivity => Err(Error::Connectivity("injected: connection reset".into())),
            Fault::Timeout => Err(Error::Timeout("injected: request timed out".into())),
        }
    }
}

fn refresh_status(inner: &Inner, kind: ResourceKind, name: &str, obj: &mut Value) {
    match kind {
        ResourceKind::Deployment => {
            let replicas = obj["spec"]["replicas"].as_u64().unwrap_or(1);
            let ready = if inner.stalled.contains(name) { 0 } else { replicas };
            obj["status"] = json!({ "replicas": replicas, "readyReplicas": ready });
        }
        ResourceKind::Job => {
            if obj.get("status").map(|s| s.is_null()).unwrap_or(true) {
                obj["status"] = match inner.job_outcome {
                    JobPhase::Succeeded => json!({
                        "succeeded": 1,
                        "conditions": [{ "type": "Complete", "status": "True" }],
                    }),
                    JobPhase::Failed => json!({
                        "failed": 1,
                        "conditions": [{ "type": "Failed", "status": "True" }],
                    }),
                    JobPhase::Active => json!({ "active": 1 }),
                };
            }
        }
        _ => {}
    }
}

/// JSON merge patch (RFC 7386): objects merge recursively, `null` removes.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Some(target_map) = target.as_object_mut() {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn matches_selector(obj: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => obj["metadata"]["labels"][key] == value,
            None => !obj["metadata"]["labels"][term].is_null(),
        })
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn create(&self, kind: ResourceKind, mut manifest: Value) -> Result<()> {
        self.take_fault()?;
        let name = manifest_name(&manifest)
            .ok_or_else(|| Error::Validation(format!("{} manifest without a name", kind)))?
            .to_string();
        let mut inner = self.inner.lock();
        let key = (kind, name.clone());
        if inner.objects.contains_key(&key) {
            return Err(Error::Conflict(format!("{} {} already exists", kind, name)));
        }
        refresh_status(&inner, kind, &name, &mut manifest);
        inner.objects.insert(key, manifest);
        Ok(())
    }

    async fn patch(&self, kind: ResourceKind, name: &str, patch: Value) -> Result<()> {
        self.take_fault()?;
        let mut inner = self.inner.lock();
        let key = (kind, name.to_string());
        let mut obj = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, name)))?;
        merge_patch(&mut obj, &patch);
        refresh_status(&inner, kind, name, &mut obj);
        inner.objects.insert(key, obj);
        Ok(())
    }

    async fn get(&self, kind: ResourceKind, name: &str) -> Result<Value> {
        self.take_fault()?;
        self.object(kind, name)
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, name)))
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<()> {
        self.take_fault()?;
        self.remove(kind, name)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("{} {}", kind, name)))
    }

    async fn list(
        &self,
        kind: ResourceKind,
        label_selector: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Value>> {
        self.take_fault()?;
        let inner = self.inner.lock();
        Ok(inner
            .objects
            .iter()
            .filter(|((k, _), obj)| {
                *k == kind && label_selector.map(|s| matches_selector(obj, s)).unwrap_or(true)
            })
            .map(|(_, obj)| obj.clone())
            .take(limit)
            .collect())
    }
}

/// Connector that always hands out the same handle.
pub struct StaticConnector {
    api: Arc<dyn ClusterApi>,
    connects: AtomicU32,
}

impl StaticConnector {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self {
            api,
            connects: AtomicU32::new(0),
        }
    }

    /// Number of successful `connect` calls.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(&self) -> Result<Arc<dyn ClusterApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.api.clone())
    }

    fn describe(&self) -> String {
        "in-memory cluster".into()
    }
}
