//! Crash detection reconciler.
//!
//! Watches instance status and reports crashed containers upstream exactly
//! once per transition. A container counts as crashed when it is either:
//! - Waiting in `CrashLoopBackOff` (reported with its last termination), or
//! - Terminated with a non-zero exit code.
//!
//! Graceful exits (code 0) are never reported. Crashes of instances the
//! platform is deliberately stopping (a `Killing` event recorded for the
//! instance) are suppressed.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_events::{
    ContainerState, ContainerStatus, CrashReport, Instance, TerminationRecord, WatchEvent,
};
use bridge_reconcile::{ContainerKey, Fingerprint, ReportLedger, TransitionKey};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::RemovalSignalSource;
use crate::worker::{ReconcileError, Reconciler};

/// Waiting reason the platform uses for automatic back-off restarts.
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

/// A crash found in one status snapshot, not yet reported.
#[derive(Debug, Clone)]
struct Candidate {
    key: ContainerKey,
    transition: TransitionKey,
    report: CrashReport,
}

/// Identity fields every report carries.
struct Reportable<'a> {
    process_guid: &'a str,
    instance: &'a str,
    index: u32,
}

/// Crash reconciler.
pub struct CrashReconciler {
    /// Deliberate removal signals.
    removals: Arc<dyn RemovalSignalSource>,

    /// Fingerprints and reported transitions. Owned by this reconciler only.
    ledger: ReportLedger,

    /// Outbound crash reports.
    crash_tx: mpsc::Sender<CrashReport>,
}

impl CrashReconciler {
    pub fn new(removals: Arc<dyn RemovalSignalSource>, crash_tx: mpsc::Sender<CrashReport>) -> Self {
        Self {
            removals,
            ledger: ReportLedger::new(),
            crash_tx,
        }
    }

    async fn observe_instance(&mut self, instance: &Instance) -> Result<(), ReconcileError> {
        let candidates = self.evaluate(instance);
        if candidates.is_empty() {
            return Ok(());
        }

        let signals = match self
            .removals
            .removal_signals(&instance.namespace, &instance.name)
            .await
        {
            Ok(signals) => signals,
            Err(e) => {
                warn!(
                    instance = %instance.name,
                    error = %e,
                    "Failed to list removal signals; skipping cycle"
                );
                return Err(e.into());
            }
        };
        let deliberate = signals.iter().any(|s| s.is_deliberate_removal());

        for candidate in candidates {
            if deliberate {
                info!(
                    instance = %instance.name,
                    container = %candidate.key.container,
                    "Instance is being removed deliberately; not reporting crash"
                );
                self.ledger.mark_reported(&candidate.key, candidate.transition);
                continue;
            }

            let report = candidate.report;
            info!(
                process_guid = %report.process_guid,
                instance = %report.instance,
                index = report.index,
                reason = %report.reason,
                exit_status = report.exit_status,
                crash_count = report.crash_count,
                "Reporting crash"
            );

            self.crash_tx
                .send(report)
                .await
                .map_err(|_| ReconcileError::ChannelClosed)?;
            self.ledger.mark_reported(&candidate.key, candidate.transition);
        }

        Ok(())
    }

    /// Record fingerprints and collect unreported crashes.
    fn evaluate(&mut self, instance: &Instance) -> Vec<Candidate> {
        if instance.container_statuses.is_empty() {
            return Vec::new();
        }

        if instance.workload_group().is_none() {
            return Vec::new();
        }

        let Some(process_guid) = instance.process_guid() else {
            debug!(instance = %instance.name, "Instance has no process guid");
            return Vec::new();
        };

        let index = match instance.index() {
            Ok(index) => index,
            Err(e) => {
                debug!(instance = %instance.name, error = %e, "Instance has no ordinal");
                return Vec::new();
            }
        };

        let identity = Reportable {
            process_guid,
            instance: &instance.name,
            index,
        };

        let mut candidates = Vec::new();
        for status in &instance.container_statuses {
            let key = ContainerKey::new(instance.incarnation(), status.name.as_str());
            let fingerprint = Fingerprint::of(status);
            let current = fingerprint.kind;

            if let Some(previous) = self.ledger.observe(&key, fingerprint) {
                if previous.kind != current {
                    debug!(
                        container = %key,
                        from = %previous.kind,
                        to = %current,
                        restart_count = status.restart_count,
                        "Container state changed"
                    );
                }
            }

            let Some((transition, report)) = crash_of(status, &identity) else {
                continue;
            };
            if self.ledger.is_reported(&key, &transition) {
                continue;
            }

            candidates.push(Candidate {
                key,
                transition,
                report,
            });
        }

        candidates
    }
}

/// The crash a container status describes, if any.
fn crash_of(status: &ContainerStatus, identity: &Reportable<'_>) -> Option<(TransitionKey, CrashReport)> {
    match &status.state {
        ContainerState::Waiting {
            reason: Some(reason),
        } if reason == CRASH_LOOP_BACK_OFF => {
            let last = status.last_termination.as_ref()?;
            let transition = TransitionKey::BackOff {
                reason: reason.clone(),
                restart_count: status.restart_count,
            };
            Some((transition, report(identity, reason, last, status.restart_count)))
        }
        ContainerState::Terminated(record) if record.exit_code != 0 => {
            let transition = TransitionKey::Failed {
                exit_code: record.exit_code,
                restart_count: status.restart_count,
            };
            let reason = record.reason.clone().unwrap_or_default();
            Some((transition, report(identity, &reason, record, status.restart_count)))
        }
        _ => None,
    }
}

fn report(
    identity: &Reportable<'_>,
    reason: &str,
    termination: &TerminationRecord,
    restart_count: u32,
) -> CrashReport {
    let exit_description = termination
        .reason
        .clone()
        .or_else(|| termination.message.clone())
        .unwrap_or_default();

    CrashReport {
        process_guid: identity.process_guid.to_string(),
        reason: reason.to_string(),
        instance: identity.instance.to_string(),
        index: identity.index,
        exit_status: termination.exit_code,
        exit_description,
        crash_count: restart_count,
        crash_timestamp: termination
            .started_at
            .unwrap_or_else(Utc::now)
            .timestamp(),
    }
}

#[async_trait]
impl Reconciler for CrashReconciler {
    type Object = Instance;

    fn name(&self) -> &'static str {
        "crash"
    }

    async fn handle(&mut self, event: WatchEvent<Instance>) -> Result<(), ReconcileError> {
        match event {
            WatchEvent::Added(instance) | WatchEvent::Modified(instance) => {
                self.observe_instance(&instance).await
            }
            WatchEvent::Deleted(instance) => {
                let dropped = self.ledger.forget_instance(instance.incarnation());
                debug!(
                    instance = %instance.name,
                    dropped,
                    tracked = self.ledger.len(),
                    "Instance deleted; dropped its crash records"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bridge_events::{annotations, OwnerReference, WORKLOAD_GROUP_KIND};
    use chrono::TimeZone;

    use super::*;
    use crate::cluster::InMemoryCluster;

    fn instance(statuses: Vec<ContainerStatus>) -> Instance {
        Instance {
            name: "brain-pod-0".to_string(),
            namespace: "ns".to_string(),
            annotations: BTreeMap::from([(
                annotations::PROCESS_GUID.to_string(),
                "brain-pod-anno".to_string(),
            )]),
            owner: Some(OwnerReference {
                kind: WORKLOAD_GROUP_KIND.to_string(),
                name: "brain-pod".to_string(),
            }),
            container_statuses: statuses,
            ..Default::default()
        }
    }

    fn terminated(exit_code: i32, restart_count: u32) -> ContainerStatus {
        ContainerStatus {
            name: "app".to_string(),
            restart_count,
            state: ContainerState::Terminated(TerminationRecord {
                exit_code,
                reason: Some("Error".to_string()),
                message: Some("segfault".to_string()),
                started_at: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
            }),
            last_termination: None,
        }
    }

    fn reconciler() -> (CrashReconciler, mpsc::Receiver<CrashReport>) {
        let (tx, rx) = mpsc::channel(8);
        (CrashReconciler::new(Arc::new(InMemoryCluster::new()), tx), rx)
    }

    #[tokio::test]
    async fn test_terminated_report_fields() {
        let (mut reconciler, mut rx) = reconciler();

        reconciler
            .handle(WatchEvent::Modified(instance(vec![terminated(2, 1)])))
            .await
            .unwrap();

        let report = rx.try_recv().unwrap();
        assert_eq!(report.reason, "Error");
        assert_eq!(report.exit_description, "Error");
        assert_eq!(report.exit_status, 2);
        assert_eq!(report.crash_count, 1);
        assert_eq!(
            report.crash_timestamp,
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap().timestamp()
        );
    }

    #[tokio::test]
    async fn test_description_falls_back_to_message() {
        let (mut reconciler, mut rx) = reconciler();
        let mut status = terminated(1, 0);
        if let ContainerState::Terminated(record) = &mut status.state {
            record.reason = None;
        }

        reconciler
            .handle(WatchEvent::Modified(instance(vec![status])))
            .await
            .unwrap();

        let report = rx.try_recv().unwrap();
        assert_eq!(report.reason, "");
        assert_eq!(report.exit_description, "segfault");
    }

    #[tokio::test]
    async fn test_unowned_instance_is_ignored() {
        let (mut reconciler, mut rx) = reconciler();
        let mut stateless = instance(vec![terminated(1, 0)]);
        stateless.owner = None;

        reconciler.handle(WatchEvent::Modified(stateless)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_instance_without_ordinal_is_ignored() {
        let (mut reconciler, mut rx) = reconciler();
        let mut odd = instance(vec![terminated(1, 0)]);
        odd.name = "bandito".to_string();

        reconciler.handle(WatchEvent::Modified(odd)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_back_off_without_last_termination_is_ignored() {
        let (mut reconciler, mut rx) = reconciler();
        let status = ContainerStatus {
            name: "app".to_string(),
            restart_count: 3,
            state: ContainerState::Waiting {
                reason: Some(CRASH_LOOP_BACK_OFF.to_string()),
            },
            last_termination: None,
        };

        reconciler
            .handle(WatchEvent::Modified(instance(vec![status])))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_instance_is_not_reported() {
        let (mut reconciler, mut rx) = reconciler();
        reconciler
            .handle(WatchEvent::Deleted(instance(vec![terminated(1, 0)])))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_new_uid_under_same_name_starts_clean() {
        let (mut reconciler, mut rx) = reconciler();
        let mut first = instance(vec![terminated(1, 0)]);
        first.uid = Some("uid-1".to_string());
        let mut second = first.clone();
        second.uid = Some("uid-2".to_string());

        reconciler.handle(WatchEvent::Modified(first.clone())).await.unwrap();
        assert!(rx.try_recv().is_ok());

        // The old incarnation's delete was never observed.
        reconciler.handle(WatchEvent::Modified(second)).await.unwrap();
        assert!(rx.try_recv().is_ok());

        reconciler.handle(WatchEvent::Modified(first)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_each_container_is_tracked_separately() {
        let (mut reconciler, mut rx) = reconciler();
        let mut sidecar = terminated(1, 0);
        sidecar.name = "sidecar".to_string();

        reconciler
            .handle(WatchEvent::Modified(instance(vec![terminated(1, 0), sidecar])))
            .await
            .unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
