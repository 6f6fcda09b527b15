//! Configuration for the watcher.

use std::time::Duration;

use anyhow::{Context, Result};

/// Watcher configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace holding workload groups and instances.
    pub namespace: String,

    /// Cluster API URL, e.g. a local `kubectl proxy`. When unset the
    /// in-cluster service account or the local kubeconfig is used.
    pub api_url: Option<String>,

    /// Capacity of each outbound channel.
    pub channel_capacity: usize,

    /// Blobstore URL serving the rootfs digest. Digest sync is off when unset.
    pub bits_url: Option<String>,

    /// Interval between digest polls.
    pub digest_poll_interval: Duration,

    /// Interval between metrics collections. `None` disables the collector.
    pub metrics_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let namespace = std::env::var("BRIDGE_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let api_url = std::env::var("BRIDGE_API_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let channel_capacity: usize = std::env::var("BRIDGE_CHANNEL_CAPACITY")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BRIDGE_CHANNEL_CAPACITY must be a positive integer.")?
            .unwrap_or(64)
            .max(1);

        let bits_url = std::env::var("BRIDGE_BITS_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let digest_poll_secs: u64 = std::env::var("BRIDGE_DIGEST_POLL_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BRIDGE_DIGEST_POLL_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(30);

        let metrics_secs: u64 = std::env::var("BRIDGE_METRICS_INTERVAL_SECS")
            .ok()
            .map(|v| v.parse())
            .transpose()
            .context("BRIDGE_METRICS_INTERVAL_SECS must be an integer (seconds).")?
            .unwrap_or(0);

        let log_level = std::env::var("BRIDGE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            namespace,
            api_url,
            channel_capacity,
            bits_url,
            digest_poll_interval: Duration::from_secs(digest_poll_secs.max(1)),
            metrics_interval: (metrics_secs > 0).then(|| Duration::from_secs(metrics_secs)),
            log_level,
        })
    }
}
