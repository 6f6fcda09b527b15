//! Watch event envelope - the common wrapper for every observed change.

use serde::{Deserialize, Serialize};

/// Kind of change reported by a watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Added => write!(f, "added"),
            EventKind::Modified => write!(f, "modified"),
            EventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single change to an object of kind `T`.
///
/// Watch delivery is at-least-once: the same snapshot may arrive more than
/// once, and consumers must treat repeated snapshots as no-ops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn kind(&self) -> EventKind {
        match self {
            WatchEvent::Added(_) => EventKind::Added,
            WatchEvent::Modified(_) => EventKind::Modified,
            WatchEvent::Deleted(_) => EventKind::Deleted,
        }
    }
}
