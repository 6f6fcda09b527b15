//! Per-instance, per-port memory of announced hostnames.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::delta::HostnameDelta;

/// What has been announced downstream for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedInstance {
    /// Workload group the routes were announced for.
    pub group: String,

    /// Address the routes were announced at.
    pub address: String,

    /// Registered hostnames by port. Never holds an empty set.
    pub ports: BTreeMap<u32, BTreeSet<String>>,
}

/// A planned change for one instance on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortChange {
    pub address: String,
    pub port: u32,
    pub delta: HostnameDelta,

    /// Hostnames announced on the port once the change is delivered.
    pub announced: BTreeSet<String>,
}

/// Announcement state for every instance the route reconciler has acted on.
///
/// The union of all entries equals what has been sent downstream, provided
/// every delivered [`PortChange`] is passed to [`Announcements::apply`].
#[derive(Debug, Default)]
pub struct Announcements {
    instances: HashMap<String, AnnouncedInstance>,
}

impl Announcements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: &str) -> Option<&AnnouncedInstance> {
        self.instances.get(instance_id)
    }

    /// Number of instances with at least one announced port.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instances announced for `group`, sorted by id.
    pub fn instances_of(&self, group: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, announced)| announced.group == group)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Plan the changes that bring `instance_id` to `desired` at `address`.
    ///
    /// Ports present in `desired` are diffed against what was announced;
    /// announced ports missing from `desired` are withdrawn. If the instance
    /// moved to a new address, everything is withdrawn from the old address
    /// and `desired` is registered from scratch at the new one.
    pub fn plan(
        &self,
        instance_id: &str,
        address: &str,
        desired: &BTreeMap<u32, BTreeSet<String>>,
    ) -> Vec<PortChange> {
        let mut changes = Vec::new();
        let empty = BTreeMap::new();

        let announced_ports = match self.instances.get(instance_id) {
            Some(announced) if announced.address != address => {
                changes.extend(Self::withdraw_all(announced));
                &empty
            }
            Some(announced) => &announced.ports,
            None => &empty,
        };

        let none = BTreeSet::new();
        for (port, hostnames) in desired {
            let last = announced_ports.get(port).unwrap_or(&none);
            let delta = HostnameDelta::between(last, hostnames);
            if delta.is_empty() {
                continue;
            }
            changes.push(PortChange {
                address: address.to_string(),
                port: *port,
                delta,
                announced: hostnames.clone(),
            });
        }

        for (port, last) in announced_ports {
            if desired.contains_key(port) || last.is_empty() {
                continue;
            }
            changes.push(PortChange {
                address: address.to_string(),
                port: *port,
                delta: HostnameDelta::withdraw(last),
                announced: BTreeSet::new(),
            });
        }

        changes
    }

    /// Plan the withdrawal of everything announced for `instance_id`.
    pub fn plan_withdrawal(&self, instance_id: &str) -> Vec<PortChange> {
        self.instances
            .get(instance_id)
            .map(Self::withdraw_all)
            .unwrap_or_default()
    }

    fn withdraw_all(announced: &AnnouncedInstance) -> Vec<PortChange> {
        announced
            .ports
            .iter()
            .map(|(port, hostnames)| PortChange {
                address: announced.address.clone(),
                port: *port,
                delta: HostnameDelta::withdraw(hostnames),
                announced: BTreeSet::new(),
            })
            .collect()
    }

    /// Record a delivered change.
    pub fn apply(&mut self, instance_id: &str, group: &str, change: &PortChange) {
        if change.announced.is_empty() {
            let Some(announced) = self.instances.get_mut(instance_id) else {
                return;
            };
            if announced.address == change.address {
                announced.ports.remove(&change.port);
            }
            if announced.ports.is_empty() {
                self.instances.remove(instance_id);
            }
            return;
        }

        let announced = self
            .instances
            .entry(instance_id.to_string())
            .or_insert_with(|| AnnouncedInstance {
                group: group.to_string(),
                address: change.address.clone(),
                ports: BTreeMap::new(),
            });

        if announced.address != change.address {
            announced.address = change.address.clone();
            announced.ports.clear();
        }
        announced.group = group.to_string();
        announced
            .ports
            .insert(change.port, change.announced.clone());
    }
}
