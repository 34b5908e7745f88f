//! Hostplane Cluster: resource manager over the orchestration platform.
//!
//! `ClusterManager` is a facade over four injected capabilities:
//! [`ConnectionOps`] (connection lifecycle and secrets), [`WorkloadOps`]
//! (deployments and services), [`JobOps`] (one-shot jobs) and
//! [`VolumeOps`] (persistent volume claims). Each capability talks to a
//! [`ClusterApi`] transport: `KubeRestApi` for a real cluster or
//! `MemoryCluster` for local development and tests.

pub mod api;
pub mod backoff;
pub mod connection;
pub mod jobs;
pub mod kube;
pub mod manager;
pub mod memory;
pub mod types;
pub mod volumes;
pub mod workloads;

pub use api::{ClusterApi, Connector};
pub use backoff::Backoff;
pub use connection::{ConnectionManager, ConnectionOps};
pub use jobs::{ApiJobs, JobOps};
pub use kube::{ClusterProfile, KubeConnector, KubeRestApi};
pub use manager::{ClusterManager, WorkloadTemplate};
pub use memory::{MemoryCluster, StaticConnector};
pub use types::*;
pub use volumes::{ApiVolumes, VolumeOps};
pub use workloads::{ApiWorkloads, WorkloadOps};
