//! Resolves the member instances of a workload group.

use std::sync::Arc;

use bridge_events::{Instance, WorkloadGroup};
use tracing::debug;

use crate::cluster::{ClusterError, InstanceLister};

/// Resolves a workload group's current instances via a list query.
#[derive(Clone)]
pub struct InstanceResolver {
    lister: Arc<dyn InstanceLister>,
}

impl InstanceResolver {
    pub fn new(lister: Arc<dyn InstanceLister>) -> Self {
        Self { lister }
    }

    /// List the group's instances.
    ///
    /// Instances matched by the selector but owned by a different group are
    /// dropped. A group without a selector resolves to no instances.
    pub async fn resolve(&self, group: &WorkloadGroup) -> Result<Vec<Instance>, ClusterError> {
        if group.selector.is_empty() {
            debug!(group = %group.name, "Workload group has no selector");
            return Ok(Vec::new());
        }

        let instances = self
            .lister
            .list_instances(&group.namespace, &group.selector)
            .await?;

        Ok(instances
            .into_iter()
            .filter(|i| i.workload_group().is_none_or(|owner| owner == group.name))
            .collect())
    }
}
