//! Outbound messages produced by the reconcilers.
//!
//! Every message is a self-contained, point-in-time instruction. Consumers
//! apply them idempotently; nothing here is mutated after it is emitted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Register/unregister instruction for one instance on one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMessage {
    pub instance_id: String,
    pub address: String,
    pub port: u32,
    pub tls_port: u32,
    /// Hostnames to register.
    pub routes: BTreeSet<String>,
    /// Hostnames to unregister.
    pub unregistered_routes: BTreeSet<String>,
}

/// A crashed instance, reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashReport {
    pub process_guid: String,
    pub reason: String,
    /// Instance name.
    pub instance: String,
    pub index: u32,
    pub exit_status: i32,
    pub exit_description: String,
    /// Cumulative restart count of the crashed container.
    pub crash_count: u32,
    /// Unix seconds.
    pub crash_timestamp: i64,
}

/// Normalized resource usage of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsMessage {
    pub app_id: String,
    pub index_id: String,
    /// CPU usage in cores.
    pub cpu: f64,
    /// Memory usage in bytes.
    pub memory: f64,
    pub memory_quota: f64,
    pub disk: f64,
    pub disk_quota: f64,
}
