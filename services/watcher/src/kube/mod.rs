//! Cluster API client.
//!
//! Implements the collaborator traits on top of `kube::Client`:
//! - Pods as instances (`InstanceLister`, watch)
//! - Event records as removal signals (`RemovalSignalSource`)
//! - StatefulSets as workload groups (`WorkloadGroupPatcher`, watch)
//! - `metrics.k8s.io` pod metrics (`MetricsSource`)

mod convert;
mod watch;

use anyhow::Context;
use async_trait::async_trait;
use bridge_events::{Instance, LabelSelector, RemovalSignal, WorkloadGroup};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::cluster::{
    ClusterError, EventStream, InstanceLister, MetricsSource, RemovalSignalSource,
    WorkloadGroupPatcher,
};
use crate::config::Config;
use crate::metrics::PodMetrics;

/// Cluster API client shared by the reconcilers and loops.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to `config.api_url` when set, otherwise to whatever the
    /// environment provides (in-cluster service account or kubeconfig).
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let kube_config = match &config.api_url {
            Some(url) => {
                let url = url
                    .parse()
                    .with_context(|| format!("Invalid cluster API URL {url}"))?;
                kube::Config::new(url)
            }
            None => kube::Config::infer()
                .await
                .context("Failed to infer cluster configuration")?,
        };

        info!(cluster_url = %kube_config.cluster_url, "Connecting to cluster API");
        let client = Client::try_from(kube_config).context("Failed to build cluster client")?;
        Ok(Self::new(client))
    }

    /// Watch workload groups in `namespace`.
    pub fn watch_groups(&self, namespace: &str) -> EventStream<WorkloadGroup> {
        watch::watch_objects(
            Api::<StatefulSet>::namespaced(self.client.clone(), namespace),
            "statefulsets",
            convert::workload_group,
        )
    }

    /// Watch instances in `namespace`.
    pub fn watch_instances(&self, namespace: &str) -> EventStream<Instance> {
        watch::watch_objects(
            Api::<Pod>::namespaced(self.client.clone(), namespace),
            "pods",
            convert::instance,
        )
    }
}

#[async_trait]
impl InstanceLister for KubeClient {
    async fn list_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Instance>, ClusterError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }

        let pods = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .list(&params)
            .await?;
        Ok(pods.items.into_iter().map(convert::instance).collect())
    }
}

#[async_trait]
impl RemovalSignalSource for KubeClient {
    async fn removal_signals(
        &self,
        namespace: &str,
        instance_name: &str,
    ) -> Result<Vec<RemovalSignal>, ClusterError> {
        let params = ListParams::default().fields(&format!("involvedObject.name={instance_name}"));
        let events = Api::<Event>::namespaced(self.client.clone(), namespace)
            .list(&params)
            .await?;
        Ok(events.items.into_iter().map(convert::removal_signal).collect())
    }
}

#[async_trait]
impl WorkloadGroupPatcher for KubeClient {
    async fn list_stale_groups(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let params = ListParams::default().labels(&format!("{label} notin ({value})"));
        let sets = Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
            .list(&params)
            .await?;
        Ok(sets.items.iter().map(ResourceExt::name_any).collect())
    }

    async fn patch_group_label(
        &self,
        namespace: &str,
        group: &str,
        label: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        // Merge patches create missing label maps on the way.
        let patch = json!({
            "metadata": {"labels": {label: value}},
            "spec": {"template": {"metadata": {"labels": {label: value}}}}
        });
        debug!(group, label, value, "Patching workload group");

        Api::<StatefulSet>::namespaced(self.client.clone(), namespace)
            .patch(group, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetricsSource for KubeClient {
    async fn list_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetrics>, ClusterError> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        let api = Api::<DynamicObject>::namespaced_with(self.client.clone(), namespace, &resource);
        let samples = api.list(&ListParams::default()).await?;

        let metrics = samples
            .items
            .into_iter()
            .map(convert::pod_metrics)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(metrics)
    }
}
