//! bridge watcher
//!
//! Watches workload groups and instances in one namespace and turns what it
//! observes into messages for the routing and crash handling layers.
//!
//! ## Architecture
//!
//! ```text
//! watch(StatefulSet) ──> RouteReconciler ──> RouteMessage  ──> sink
//!                              │
//!                        InstanceResolver (pod list)
//!
//! watch(Pod) ──────────> CrashReconciler ──> CrashReport   ──> sink
//!                              │
//!                        removal signals (event list)
//!
//! MetricsCollector (tick) ─────────────────> MetricsMessage ─> sink
//! DigestSync (tick) ──> patch StatefulSet labels
//! ```
//!
//! Each reconciler owns its memory and runs as one task over its own stream
//! (`worker::run_worker`). All of them stop on the shared shutdown signal.
//!
//! ## Modules
//!
//! - `cluster`: collaborator traits and `InMemoryCluster`
//! - `kube`: cluster API client and watch streams
//! - `route`, `crash`: the two reconcilers
//! - `metrics`, `digest`: periodic loops

pub mod cluster;
pub mod config;
pub mod crash;
pub mod digest;
pub mod kube;
pub mod metrics;
pub mod resolver;
pub mod route;
pub mod sink;
pub mod worker;

pub use cluster::{ClusterError, EventStream, InMemoryCluster};
pub use crash::CrashReconciler;
pub use resolver::InstanceResolver;
pub use route::RouteReconciler;
pub use worker::{run_worker, ReconcileError, Reconciler, StopReason, WorkerStats};
