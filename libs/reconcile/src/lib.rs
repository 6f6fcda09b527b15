//! Reconciliation state primitives.
//!
//! This library provides the memory the bridge reconcilers diff against.
//! The watch stream only delivers snapshots, so every derived change is the
//! difference between the snapshot and what was last acted upon:
//!
//! - **Announcements**: hostnames last registered per instance and port.
//! - **Report ledger**: container transitions already reported as crashes.
//!
//! # Invariants
//!
//! - Planning never mutates state; state changes only when a change is applied
//! - Applying a planned change twice is a no-op
//! - Re-planning against unchanged input yields no changes

mod announcements;
mod delta;
mod ledger;

pub use announcements::{AnnouncedInstance, Announcements, PortChange};
pub use delta::HostnameDelta;
pub use ledger::{ContainerKey, Fingerprint, ReportLedger, TransitionKey};
