//! Route diff reconciler.
//!
//! Keeps downstream route registration in step with each workload group's
//! desired routes and each instance's readiness and address. For every
//! workload group event it:
//! - Resolves the group's instances (add/modify) or sweeps what was announced
//!   for it (delete)
//! - Diffs the desired hostnames per port against what each ready instance
//!   last announced
//! - Emits one `RouteMessage` per changed (instance, port)
//!
//! Not-ready instances are frozen: their announced routes are neither
//! extended nor withdrawn until they become ready again or the group goes away.

use async_trait::async_trait;
use bridge_events::{RouteMessage, WatchEvent, WorkloadGroup};
use bridge_reconcile::{Announcements, PortChange};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::resolver::InstanceResolver;
use crate::worker::{ReconcileError, Reconciler};

/// Route reconciler.
pub struct RouteReconciler {
    /// Resolves group members.
    resolver: InstanceResolver,

    /// What has been announced downstream. Owned by this reconciler only.
    announcements: Announcements,

    /// Outbound route messages.
    routes_tx: mpsc::Sender<RouteMessage>,
}

impl RouteReconciler {
    pub fn new(resolver: InstanceResolver, routes_tx: mpsc::Sender<RouteMessage>) -> Self {
        Self {
            resolver,
            announcements: Announcements::new(),
            routes_tx,
        }
    }

    /// Bring every ready instance of `group` to its desired routes.
    async fn sync_group(&mut self, group: &WorkloadGroup) -> Result<(), ReconcileError> {
        let desired = group.desired_routes().by_port();

        let instances = match self.resolver.resolve(group).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(
                    group = %group.name,
                    error = %e,
                    "Failed to resolve instances; skipping cycle"
                );
                return Err(e.into());
            }
        };

        for instance in instances {
            let Some(address) = instance.address.as_deref().filter(|_| instance.is_routable())
            else {
                debug!(
                    group = %group.name,
                    instance_id = %instance.name,
                    "Instance not ready; leaving announced routes as they are"
                );
                continue;
            };

            let changes = self.announcements.plan(&instance.name, address, &desired);
            for change in changes {
                self.deliver(&instance.name, &group.name, change).await?;
            }
        }

        Ok(())
    }

    /// Withdraw everything announced for a deleted group.
    async fn sweep_group(&mut self, group: &WorkloadGroup) -> Result<(), ReconcileError> {
        let instance_ids = self.announcements.instances_of(&group.name);
        info!(
            group = %group.name,
            instance_count = instance_ids.len(),
            "Workload group deleted; unregistering routes"
        );

        for instance_id in instance_ids {
            for change in self.announcements.plan_withdrawal(&instance_id) {
                self.deliver(&instance_id, &group.name, change).await?;
            }
        }

        Ok(())
    }

    /// Send one change downstream, then record it as announced.
    async fn deliver(
        &mut self,
        instance_id: &str,
        group: &str,
        change: PortChange,
    ) -> Result<(), ReconcileError> {
        let message = RouteMessage {
            instance_id: instance_id.to_string(),
            address: change.address.clone(),
            port: change.port,
            tls_port: 0,
            routes: change.delta.to_register.clone(),
            unregistered_routes: change.delta.to_unregister.clone(),
        };

        self.routes_tx
            .send(message)
            .await
            .map_err(|_| ReconcileError::ChannelClosed)?;

        debug!(
            group,
            instance_id,
            address = %change.address,
            port = change.port,
            registered = change.delta.to_register.len(),
            unregistered = change.delta.to_unregister.len(),
            "Route message sent"
        );

        self.announcements.apply(instance_id, group, &change);
        Ok(())
    }
}

#[async_trait]
impl Reconciler for RouteReconciler {
    type Object = WorkloadGroup;

    fn name(&self) -> &'static str {
        "route"
    }

    async fn handle(&mut self, event: WatchEvent<WorkloadGroup>) -> Result<(), ReconcileError> {
        match event {
            WatchEvent::Deleted(group) => self.sweep_group(&group).await,
            WatchEvent::Added(group) | WatchEvent::Modified(group) => self.sync_group(&group).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    use bridge_events::{annotations, Instance, LabelSelector};

    use super::*;
    use crate::cluster::InMemoryCluster;

    fn group(routes: &str) -> WorkloadGroup {
        WorkloadGroup {
            name: "app".to_string(),
            namespace: "ns".to_string(),
            annotations: BTreeMap::from([(annotations::ROUTES.to_string(), routes.to_string())]),
            selector: LabelSelector::new([("name", "app")]),
            ..Default::default()
        }
    }

    fn ready(name: &str, ip: &str) -> Instance {
        Instance {
            name: name.to_string(),
            namespace: "ns".to_string(),
            labels: BTreeMap::from([("name".to_string(), "app".to_string())]),
            address: Some(ip.to_string()),
            ready: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_same_port_routes_share_one_message() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_instance(ready("app-0", "10.0.0.1")).await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut reconciler = RouteReconciler::new(InstanceResolver::new(cluster), tx);

        reconciler
            .handle(WatchEvent::Added(group(
                r#"[{"hostname": "a", "port": 8080}, {"hostname": "b", "port": 8080}]"#,
            )))
            .await
            .unwrap();

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.port, 8080);
        assert_eq!(msg.tls_port, 0);
        assert_eq!(
            msg.routes,
            BTreeSet::from(["a".to_string(), "b".to_string()])
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_instance_without_address_is_skipped() {
        let cluster = Arc::new(InMemoryCluster::new());
        let mut pending = ready("app-0", "");
        pending.address = None;
        cluster.put_instance(pending).await;
        let (tx, mut rx) = mpsc::channel(8);
        let mut reconciler = RouteReconciler::new(InstanceResolver::new(cluster), tx);

        reconciler
            .handle(WatchEvent::Added(group(r#"[{"hostname": "a", "port": 8080}]"#)))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
