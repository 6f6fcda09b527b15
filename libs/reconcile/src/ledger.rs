//! Per-container fingerprints and the set of transitions already reported.

use std::collections::{HashMap, HashSet};

use bridge_events::{ContainerState, ContainerStatus, StateKind};

/// Identity of a container within one incarnation of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerKey {
    /// Instance uid, or its name when the cluster assigned none.
    pub instance: String,
    pub container: String,
}

impl ContainerKey {
    pub fn new(instance: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            container: container.into(),
        }
    }
}

impl std::fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.instance, self.container)
    }
}

/// Last observed status of a container, reduced to what transitions depend on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub kind: StateKind,
    pub restart_count: u32,
    pub reason: Option<String>,
    pub exit_code: Option<i32>,
    /// Unix seconds.
    pub started_at: Option<i64>,
}

impl Fingerprint {
    pub fn of(status: &ContainerStatus) -> Self {
        let (reason, exit_code, started_at) = match &status.state {
            ContainerState::Unknown => (None, None, None),
            ContainerState::Running { started_at } => {
                (None, None, started_at.map(|t| t.timestamp()))
            }
            ContainerState::Waiting { reason } => (reason.clone(), None, None),
            ContainerState::Terminated(record) => (
                record.reason.clone(),
                Some(record.exit_code),
                record.started_at.map(|t| t.timestamp()),
            ),
        };

        Self {
            kind: status.state.kind(),
            restart_count: status.restart_count,
            reason,
            exit_code,
            started_at,
        }
    }
}

/// A reportable container transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransitionKey {
    /// Waiting in automatic back-off.
    BackOff { reason: String, restart_count: u32 },

    /// Terminated with a non-zero exit code.
    Failed { exit_code: i32, restart_count: u32 },
}

#[derive(Debug, Default)]
struct ContainerRecord {
    last: Option<Fingerprint>,
    reported: HashSet<TransitionKey>,
}

/// Dedup memory for crash reporting.
///
/// Entries live until their instance is deleted. Keys carry the instance uid,
/// so a recreated instance with a reused name starts from a clean record
/// even when its deletion was never observed.
#[derive(Debug, Default)]
pub struct ReportLedger {
    containers: HashMap<ContainerKey, ContainerRecord>,
}

impl ReportLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest fingerprint, returning the previous one.
    pub fn observe(&mut self, key: &ContainerKey, fingerprint: Fingerprint) -> Option<Fingerprint> {
        self.containers
            .entry(key.clone())
            .or_default()
            .last
            .replace(fingerprint)
    }

    pub fn is_reported(&self, key: &ContainerKey, transition: &TransitionKey) -> bool {
        self.containers
            .get(key)
            .is_some_and(|record| record.reported.contains(transition))
    }

    /// Mark a transition as handled. Returns false if it already was.
    pub fn mark_reported(&mut self, key: &ContainerKey, transition: TransitionKey) -> bool {
        self.containers
            .entry(key.clone())
            .or_default()
            .reported
            .insert(transition)
    }

    /// Drop every record of one instance. Returns how many were dropped.
    pub fn forget_instance(&mut self, instance: &str) -> usize {
        let before = self.containers.len();
        self.containers.retain(|key, _| key.instance != instance);
        before - self.containers.len()
    }

    /// Number of tracked containers.
    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_events::TerminationRecord;

    fn back_off(restart_count: u32) -> TransitionKey {
        TransitionKey::BackOff {
            reason: "CrashLoopBackOff".to_string(),
            restart_count,
        }
    }

    #[test]
    fn test_mark_reported_is_idempotent() {
        let mut ledger = ReportLedger::new();
        let key = ContainerKey::new("app-0", "main");

        assert!(!ledger.is_reported(&key, &back_off(3)));
        assert!(ledger.mark_reported(&key, back_off(3)));
        assert!(!ledger.mark_reported(&key, back_off(3)));
        assert!(ledger.is_reported(&key, &back_off(3)));
        assert!(!ledger.is_reported(&key, &back_off(4)));
    }

    #[test]
    fn test_reported_is_per_container() {
        let mut ledger = ReportLedger::new();
        ledger.mark_reported(&ContainerKey::new("app-0", "main"), back_off(1));

        assert!(!ledger.is_reported(&ContainerKey::new("app-0", "sidecar"), &back_off(1)));
        assert!(!ledger.is_reported(&ContainerKey::new("app-1", "main"), &back_off(1)));
    }

    #[test]
    fn test_observe_returns_previous_fingerprint() {
        let mut ledger = ReportLedger::new();
        let key = ContainerKey::new("app-0", "main");

        let running = ContainerStatus {
            name: "main".to_string(),
            state: ContainerState::Running { started_at: None },
            ..Default::default()
        };
        assert!(ledger.observe(&key, Fingerprint::of(&running)).is_none());

        let terminated = ContainerStatus {
            name: "main".to_string(),
            restart_count: 2,
            state: ContainerState::Terminated(TerminationRecord {
                exit_code: 137,
                reason: Some("Error".to_string()),
                message: None,
                started_at: None,
            }),
            last_termination: None,
        };
        let previous = ledger.observe(&key, Fingerprint::of(&terminated)).unwrap();
        assert_eq!(previous.kind, StateKind::Running);
        assert_eq!(previous.exit_code, None);

        let again = ledger.observe(&key, Fingerprint::of(&terminated)).unwrap();
        assert_eq!(again.kind, StateKind::Terminated);
        assert_eq!(again.exit_code, Some(137));
        assert_eq!(again.restart_count, 2);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_forget_instance_drops_only_that_instance() {
        let mut ledger = ReportLedger::new();
        let main = ContainerKey::new("uid-a", "main");
        let sidecar = ContainerKey::new("uid-a", "sidecar");
        let other = ContainerKey::new("uid-b", "main");
        ledger.mark_reported(&main, back_off(1));
        ledger.mark_reported(&sidecar, back_off(1));
        ledger.mark_reported(&other, back_off(1));

        assert_eq!(ledger.forget_instance("uid-a"), 2);
        assert!(!ledger.is_reported(&main, &back_off(1)));
        assert!(!ledger.is_reported(&sidecar, &back_off(1)));
        assert!(ledger.is_reported(&other, &back_off(1)));
        assert_eq!(ledger.len(), 1);

        assert_eq!(ledger.forget_instance("uid-a"), 0);
    }
}
