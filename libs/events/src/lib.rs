//! # bridge-events
//!
//! Object model and message types shared by the bridge reconcilers.
//!
//! ## Design Principles
//!
//! - Cluster objects are observed, never owned: the reconcilers only read them
//! - Watch events are raw snapshots; deriving changes is the consumer's job
//! - Outbound messages are immutable once emitted
//!
//! ## Types
//!
//! - Watch envelope (`WatchEvent`, `EventKind`)
//! - Workload groups and their desired routes (`WorkloadGroup`, `DesiredRoutes`)
//! - Instances and container status (`Instance`, `ContainerStatus`)
//! - Outbound messages (`RouteMessage`, `CrashReport`, `MetricsMessage`)

mod envelope;
mod error;
mod messages;
mod types;

pub use envelope::*;
pub use error::IndexError;
pub use messages::*;
pub use types::*;
