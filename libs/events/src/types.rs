//! Cluster object model observed by the reconcilers.
//!
//! These are the reduced shapes of the orchestration objects the bridge
//! watches: workload groups (stateful sets) and their instances (pods).
//! Only the fields the reconcilers read are carried.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexError;

// =============================================================================
// Well-known keys
// =============================================================================

/// Annotation keys read from cluster objects.
pub mod annotations {
    /// JSON array of `{"hostname", "port"}` objects on a workload group.
    pub const ROUTES: &str = "routes";

    /// Process GUID of the application an instance runs.
    pub const PROCESS_GUID: &str = "process_guid";
}

/// Label keys read from cluster objects.
pub mod labels {
    /// Application GUID.
    pub const GUID: &str = "guid";

    /// Root filesystem digest stamped onto workload group pod templates.
    pub const ROOTFS_DIGEST: &str = "eirinifs-digest";
}

/// Owner kind of instances that belong to a workload group.
pub const WORKLOAD_GROUP_KIND: &str = "StatefulSet";

// =============================================================================
// Workload groups
// =============================================================================

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns true if every selector label is present with the same value.
    ///
    /// An empty selector matches everything.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Render as a `key=value,...` selector string.
    pub fn to_query(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

/// A named, versioned logical application (a stateful set).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadGroup {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub selector: LabelSelector,
}

impl WorkloadGroup {
    /// Desired routes from the `routes` annotation.
    ///
    /// Absent or malformed annotations yield no routes.
    pub fn desired_routes(&self) -> DesiredRoutes {
        DesiredRoutes::from_annotation(self.annotations.get(annotations::ROUTES).map(String::as_str))
    }
}

// =============================================================================
// Desired routes
// =============================================================================

/// A single desired route entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    pub hostname: String,
    pub port: u32,
}

impl RouteSpec {
    pub fn new(hostname: impl Into<String>, port: u32) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }
}

/// Ordered desired route specification, unique by hostname and port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredRoutes(Vec<RouteSpec>);

impl DesiredRoutes {
    /// Empty specification (a deleted group).
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build from entries, dropping duplicates while keeping first-seen order.
    pub fn new(routes: impl IntoIterator<Item = RouteSpec>) -> Self {
        let mut seen = BTreeSet::new();
        let unique = routes
            .into_iter()
            .filter(|route| seen.insert(route.clone()))
            .collect();
        Self(unique)
    }

    /// Parse the annotation value.
    pub fn from_annotation(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::empty();
        };
        match serde_json::from_str::<Vec<RouteSpec>>(raw) {
            Ok(routes) => Self::new(routes),
            Err(_) => Self::empty(),
        }
    }

    pub fn routes(&self) -> &[RouteSpec] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hostnames grouped by port.
    pub fn by_port(&self) -> BTreeMap<u32, BTreeSet<String>> {
        let mut grouped: BTreeMap<u32, BTreeSet<String>> = BTreeMap::new();
        for route in &self.0 {
            grouped
                .entry(route.port)
                .or_default()
                .insert(route.hostname.clone());
        }
        grouped
    }
}

// =============================================================================
// Instances
// =============================================================================

/// Back-reference from an instance to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

/// Kind of a container state, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Unknown,
    Running,
    Waiting,
    Terminated,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StateKind::Unknown => "unknown",
            StateKind::Running => "running",
            StateKind::Waiting => "waiting",
            StateKind::Terminated => "terminated",
        };
        write!(f, "{}", s)
    }
}

/// Record of a container termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationRecord {
    pub exit_code: i32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

/// Current state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// The platform has not reported a state yet.
    #[default]
    Unknown,
    Running {
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    Waiting {
        #[serde(default)]
        reason: Option<String>,
    },
    Terminated(TerminationRecord),
}

impl ContainerState {
    pub fn kind(&self) -> StateKind {
        match self {
            ContainerState::Unknown => StateKind::Unknown,
            ContainerState::Running { .. } => StateKind::Running,
            ContainerState::Waiting { .. } => StateKind::Waiting,
            ContainerState::Terminated(_) => StateKind::Terminated,
        }
    }
}

/// Observed status of one container in an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub state: ContainerState,
    /// Termination that preceded the current state, if any.
    #[serde(default)]
    pub last_termination: Option<TerminationRecord>,
}

/// One running replica of a workload group (a pod).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Cluster-assigned identity. Differs between incarnations that share a
    /// name.
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub owner: Option<OwnerReference>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl Instance {
    /// Key that tells incarnations of the same name apart.
    ///
    /// Falls back to the name when the cluster assigned no uid.
    pub fn incarnation(&self) -> &str {
        self.uid.as_deref().unwrap_or(&self.name)
    }

    /// Ordinal index parsed from the name suffix.
    pub fn index(&self) -> Result<u32, IndexError> {
        parse_instance_index(&self.name)
    }

    pub fn process_guid(&self) -> Option<&str> {
        self.annotations
            .get(annotations::PROCESS_GUID)
            .map(String::as_str)
    }

    pub fn app_guid(&self) -> Option<&str> {
        self.labels.get(labels::GUID).map(String::as_str)
    }

    /// Name of the owning workload group, if owned by one.
    pub fn workload_group(&self) -> Option<&str> {
        self.owner
            .as_ref()
            .filter(|owner| owner.kind == WORKLOAD_GROUP_KIND)
            .map(|owner| owner.name.as_str())
    }

    /// Ready with a routable address.
    pub fn is_routable(&self) -> bool {
        self.ready && self.address.as_deref().is_some_and(|a| !a.is_empty())
    }
}

/// Parse the ordinal index from an instance name such as `my-app-3`.
pub fn parse_instance_index(name: &str) -> Result<u32, IndexError> {
    let (_, suffix) = name
        .rsplit_once('-')
        .ok_or_else(|| IndexError::MissingSeparator(name.to_string()))?;

    suffix.parse::<u32>().map_err(|_| IndexError::NotANumber {
        name: name.to_string(),
        suffix: suffix.to_string(),
    })
}

// =============================================================================
// Removal signals
// =============================================================================

/// Reason recorded by the platform when it deliberately stops a container.
pub const DELIBERATE_REMOVAL_REASON: &str = "Killing";

/// A cluster event record about an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalSignal {
    pub instance_name: String,
    pub namespace: String,
    pub reason: String,
}

impl RemovalSignal {
    pub fn killing(instance_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            namespace: namespace.into(),
            reason: DELIBERATE_REMOVAL_REASON.to_string(),
        }
    }

    pub fn is_deliberate_removal(&self) -> bool {
        self.reason == DELIBERATE_REMOVAL_REASON
    }
}
