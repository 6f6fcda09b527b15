//! Cluster collaborator interfaces and an in-memory implementation.
//!
//! The reconcilers only read the cluster through these traits:
//! - Instance list queries (route resolution, metrics ownership)
//! - Removal signal queries (crash suppression)
//! - Workload group label patching (digest sync)
//! - Pod usage samples (metrics collection)
//!
//! `InMemoryCluster` backs tests and local development.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bridge_events::{Instance, LabelSelector, RemovalSignal, WatchEvent, WorkloadGroup};
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::metrics::PodMetrics;

/// A lazy, infinite, non-restartable sequence of watch events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = WatchEvent<T>> + Send>>;

/// Errors returned by cluster collaborators.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The cluster API client failed: transport, API status or decode.
    #[error("cluster api: {0}")]
    Kube(#[from] kube::Error),

    /// The collaborator answered with a non-success status.
    #[error("api returned status {status}: {body}")]
    Api { status: u16, body: String },

    /// The response body could not be decoded.
    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The collaborator is not reachable right now.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Lists instances matching a selector.
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn list_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Instance>, ClusterError>;
}

/// Lists cluster event records about an instance.
#[async_trait]
pub trait RemovalSignalSource: Send + Sync {
    async fn removal_signals(
        &self,
        namespace: &str,
        instance_name: &str,
    ) -> Result<Vec<RemovalSignal>, ClusterError>;
}

/// Finds and patches workload groups by label.
#[async_trait]
pub trait WorkloadGroupPatcher: Send + Sync {
    /// Names of groups whose `label` is not `value`.
    async fn list_stale_groups(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<Vec<String>, ClusterError>;

    /// Set `label` to `value` on the group and its instance template.
    async fn patch_group_label(
        &self,
        namespace: &str,
        group: &str,
        label: &str,
        value: &str,
    ) -> Result<(), ClusterError>;
}

/// Lists raw per-container usage samples.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn list_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>, ClusterError>;
}

/// In-memory cluster for testing and development.
#[derive(Default)]
pub struct InMemoryCluster {
    instances: RwLock<BTreeMap<String, Instance>>,
    groups: RwLock<BTreeMap<String, WorkloadGroup>>,
    signals: RwLock<Vec<RemovalSignal>>,
    metrics: RwLock<Vec<PodMetrics>>,
    patches: RwLock<Vec<(String, String, String)>>,
    fail_lists: AtomicBool,
    fail_signals: AtomicBool,
    fail_patches: AtomicBool,
    list_calls: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_instance(&self, instance: Instance) {
        self.instances
            .write()
            .await
            .insert(instance.name.clone(), instance);
    }

    pub async fn remove_instance(&self, name: &str) -> Option<Instance> {
        self.instances.write().await.remove(name)
    }

    pub async fn put_group(&self, group: WorkloadGroup) {
        self.groups.write().await.insert(group.name.clone(), group);
    }

    pub async fn push_signal(&self, signal: RemovalSignal) {
        self.signals.write().await.push(signal);
    }

    pub async fn set_metrics(&self, metrics: Vec<PodMetrics>) {
        *self.metrics.write().await = metrics;
    }

    /// Patches applied so far as `(group, label, value)`.
    pub async fn patches(&self) -> Vec<(String, String, String)> {
        self.patches.read().await.clone()
    }

    /// Make every list query fail.
    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Make every removal signal query fail.
    pub fn fail_signals(&self, fail: bool) {
        self.fail_signals.store(fail, Ordering::SeqCst);
    }

    /// Make every patch fail.
    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    /// Number of instance list queries served or failed.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceLister for InMemoryCluster {
    async fn list_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Instance>, ClusterError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("instance list refused".to_string()));
        }

        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.namespace == namespace && selector.matches(&i.labels))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RemovalSignalSource for InMemoryCluster {
    async fn removal_signals(
        &self,
        namespace: &str,
        instance_name: &str,
    ) -> Result<Vec<RemovalSignal>, ClusterError> {
        if self.fail_signals.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("event list refused".to_string()));
        }

        let signals = self.signals.read().await;
        Ok(signals
            .iter()
            .filter(|s| s.namespace == namespace && s.instance_name == instance_name)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl WorkloadGroupPatcher for InMemoryCluster {
    async fn list_stale_groups(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<Vec<String>, ClusterError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("group list refused".to_string()));
        }

        let groups = self.groups.read().await;
        Ok(groups
            .values()
            .filter(|g| g.namespace == namespace)
            .filter(|g| g.labels.get(label).map(String::as_str) != Some(value))
            .map(|g| g.name.clone())
            .collect())
    }

    async fn patch_group_label(
        &self,
        namespace: &str,
        group: &str,
        label: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("patch refused".to_string()));
        }

        let mut groups = self.groups.write().await;
        let Some(existing) = groups
            .get_mut(group)
            .filter(|g| g.namespace == namespace)
        else {
            return Err(ClusterError::Api {
                status: 404,
                body: format!("workload group {group} not found"),
            });
        };
        existing.labels.insert(label.to_string(), value.to_string());

        self.patches
            .write()
            .await
            .push((group.to_string(), label.to_string(), value.to_string()));
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for InMemoryCluster {
    async fn list_pod_metrics(&self, _namespace: &str) -> Result<Vec<PodMetrics>, ClusterError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable("metrics list refused".to_string()));
        }
        Ok(self.metrics.read().await.clone())
    }
}
