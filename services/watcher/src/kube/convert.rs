//! Conversion of cluster API objects into domain types.
//!
//! Only the fields the reconcilers read are carried over; everything else on
//! the API object is dropped.

use bridge_events::{
    ContainerState, ContainerStatus, Instance, LabelSelector, OwnerReference, RemovalSignal,
    TerminationRecord, WorkloadGroup,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{self as corev1, Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;
use kube::core::DynamicObject;

use crate::metrics::{ContainerMetrics, PodMetrics};

// =============================================================================
// Pods
// =============================================================================

pub fn instance(pod: Pod) -> Instance {
    let status = pod.status.unwrap_or_default();
    let ready = status
        .conditions
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    Instance {
        name: pod.metadata.name.unwrap_or_default(),
        namespace: pod.metadata.namespace.unwrap_or_default(),
        uid: pod.metadata.uid,
        labels: pod.metadata.labels.unwrap_or_default(),
        annotations: pod.metadata.annotations.unwrap_or_default(),
        owner: owner_of(pod.metadata.owner_references.unwrap_or_default()),
        address: status.pod_ip.filter(|ip| !ip.is_empty()),
        ready,
        container_statuses: status
            .container_statuses
            .unwrap_or_default()
            .into_iter()
            .map(container_status)
            .collect(),
    }
}

/// The controlling owner, or the first owner when none is marked.
fn owner_of(refs: Vec<meta::OwnerReference>) -> Option<OwnerReference> {
    let index = refs
        .iter()
        .position(|r| r.controller == Some(true))
        .unwrap_or(0);

    refs.into_iter().nth(index).map(|r| OwnerReference {
        kind: r.kind,
        name: r.name,
    })
}

fn container_status(status: corev1::ContainerStatus) -> ContainerStatus {
    ContainerStatus {
        name: status.name,
        restart_count: u32::try_from(status.restart_count).unwrap_or_default(),
        state: status.state.map(container_state).unwrap_or_default(),
        last_termination: status
            .last_state
            .and_then(|last| last.terminated)
            .map(termination),
    }
}

fn container_state(state: corev1::ContainerState) -> ContainerState {
    if let Some(terminated) = state.terminated {
        return ContainerState::Terminated(termination(terminated));
    }
    if let Some(waiting) = state.waiting {
        return ContainerState::Waiting {
            reason: waiting.reason,
        };
    }
    if let Some(running) = state.running {
        return ContainerState::Running {
            started_at: running.started_at.map(|t| t.0),
        };
    }
    ContainerState::Unknown
}

fn termination(terminated: corev1::ContainerStateTerminated) -> TerminationRecord {
    TerminationRecord {
        exit_code: terminated.exit_code,
        reason: terminated.reason,
        message: terminated.message,
        started_at: terminated.started_at.map(|t| t.0),
    }
}

// =============================================================================
// StatefulSets
// =============================================================================

pub fn workload_group(set: StatefulSet) -> WorkloadGroup {
    let match_labels = set
        .spec
        .and_then(|spec| spec.selector.match_labels)
        .unwrap_or_default();

    WorkloadGroup {
        name: set.metadata.name.unwrap_or_default(),
        namespace: set.metadata.namespace.unwrap_or_default(),
        labels: set.metadata.labels.unwrap_or_default(),
        annotations: set.metadata.annotations.unwrap_or_default(),
        selector: LabelSelector { match_labels },
    }
}

// =============================================================================
// Events and pod metrics
// =============================================================================

pub fn removal_signal(event: Event) -> RemovalSignal {
    RemovalSignal {
        instance_name: event.involved_object.name.unwrap_or_default(),
        namespace: event.involved_object.namespace.unwrap_or_default(),
        reason: event.reason.unwrap_or_default(),
    }
}

/// A `metrics.k8s.io` pod sample. The API is not part of the typed object
/// model, so the container list is read from the untyped body.
pub fn pod_metrics(object: DynamicObject) -> Result<PodMetrics, serde_json::Error> {
    let containers: Vec<ContainerMetrics> = match object.data.get("containers") {
        Some(raw) => serde_json::from_value(raw.clone())?,
        None => Vec::new(),
    };

    Ok(PodMetrics {
        name: object.metadata.name.unwrap_or_default(),
        containers,
    })
}
