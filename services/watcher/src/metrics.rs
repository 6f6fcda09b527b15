//! Usage sample normalization and the periodic metrics collector.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bridge_events::{IndexError, LabelSelector, MetricsMessage, parse_instance_index};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, InstanceLister, MetricsSource};

/// Usage sample of one container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerMetrics {
    pub name: String,
    /// Resource name (`cpu`, `memory`) to quantity string.
    #[serde(default)]
    pub usage: BTreeMap<String, String>,
}

/// Usage samples of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodMetrics {
    pub name: String,
    pub containers: Vec<ContainerMetrics>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid quantity {0:?}")]
pub struct QuantityError(pub String);

#[derive(Debug, Error)]
pub enum MetricsError {
    /// A usage value was not a quantity.
    #[error("instance {instance}: {source}")]
    Quantity {
        instance: String,
        source: QuantityError,
    },

    /// An instance name had no ordinal.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// A sample named an instance that could not be resolved.
    #[error("no instance found for sample {0}")]
    UnknownInstance(String),

    /// Listing samples or instances failed.
    #[error(transparent)]
    Source(#[from] ClusterError),
}

// =============================================================================
// Quantities
// =============================================================================

const BINARY_SUFFIXES: [(&str, i32); 6] = [
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: [(char, i32); 9] = [
    ('n', -9),
    ('u', -6),
    ('m', -3),
    ('k', 3),
    ('M', 6),
    ('G', 9),
    ('T', 12),
    ('P', 15),
    ('E', 18),
];

/// Parse a resource quantity such as `250m`, `42Ki`, `1.5Gi` or `1e3`.
pub fn parse_quantity(raw: &str) -> Result<f64, QuantityError> {
    let err = || QuantityError(raw.to_string());
    let s = raw.trim();
    if s.is_empty() {
        return Err(err());
    }

    if let Some((number, shift)) = BINARY_SUFFIXES
        .iter()
        .find_map(|(suffix, shift)| s.strip_suffix(suffix).map(|n| (n, *shift)))
    {
        return Ok(parse_number(number).ok_or_else(err)? * 2f64.powi(shift));
    }

    if let Some((number, exp)) = DECIMAL_SUFFIXES
        .iter()
        .find_map(|(suffix, exp)| s.strip_suffix(*suffix).map(|n| (n, *exp)))
    {
        return Ok(scale(parse_number(number).ok_or_else(err)?, exp));
    }

    if let Some((number, exp)) = s.split_once(['e', 'E']) {
        let exp: i32 = exp.parse().map_err(|_| err())?;
        return Ok(scale(parse_number(number).ok_or_else(err)?, exp));
    }

    parse_number(s).ok_or_else(err)
}

fn scale(value: f64, exp: i32) -> f64 {
    if exp < 0 {
        value / 10f64.powi(-exp)
    } else {
        value * 10f64.powi(exp)
    }
}

/// Signed decimal without exponent or suffix.
fn parse_number(s: &str) -> Option<f64> {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    if digits.is_empty()
        || !digits.chars().all(|c| c.is_ascii_digit() || c == '.')
        || !digits.chars().any(|c| c.is_ascii_digit())
    {
        return None;
    }
    s.parse().ok()
}

// =============================================================================
// Normalization
// =============================================================================

/// Convert a batch of samples into metrics messages.
///
/// `app_ids` maps instance names to application ids. Only the first container
/// of each sample is used; samples without containers are skipped. Any
/// failure rejects the whole batch.
pub fn normalize_batch(
    samples: &[PodMetrics],
    app_ids: &BTreeMap<String, String>,
) -> Result<Vec<MetricsMessage>, MetricsError> {
    let mut messages = Vec::with_capacity(samples.len());

    for sample in samples {
        let Some(container) = sample.containers.first() else {
            debug!(instance = %sample.name, "Sample has no containers");
            continue;
        };

        let app_id = app_ids
            .get(&sample.name)
            .ok_or_else(|| MetricsError::UnknownInstance(sample.name.clone()))?;
        let index = parse_instance_index(&sample.name)?;

        let usage = |resource: &str| -> Result<f64, MetricsError> {
            container
                .usage
                .get(resource)
                .map(String::as_str)
                .map(parse_quantity)
                .transpose()
                .map(Option::unwrap_or_default)
                .map_err(|source| MetricsError::Quantity {
                    instance: sample.name.clone(),
                    source,
                })
        };

        messages.push(MetricsMessage {
            app_id: app_id.clone(),
            index_id: index.to_string(),
            cpu: usage("cpu")?,
            memory: usage("memory")?,
            memory_quota: 0.0,
            disk: 0.0,
            disk_quota: 0.0,
        });
    }

    Ok(messages)
}

// =============================================================================
// Collector
// =============================================================================

/// Periodically samples usage and forwards normalized batches.
pub struct MetricsCollector {
    namespace: String,
    samples: Arc<dyn MetricsSource>,
    instances: Arc<dyn InstanceLister>,
    metrics_tx: mpsc::Sender<Vec<MetricsMessage>>,
}

impl MetricsCollector {
    pub fn new(
        namespace: impl Into<String>,
        samples: Arc<dyn MetricsSource>,
        instances: Arc<dyn InstanceLister>,
        metrics_tx: mpsc::Sender<Vec<MetricsMessage>>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            samples,
            instances,
            metrics_tx,
        }
    }

    /// Take one sample of every instance in the namespace.
    pub async fn collect_once(&self) -> Result<Vec<MetricsMessage>, MetricsError> {
        let samples = self.samples.list_pod_metrics(&self.namespace).await?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let app_ids: BTreeMap<String, String> = self
            .instances
            .list_instances(&self.namespace, &LabelSelector::default())
            .await?
            .into_iter()
            .filter_map(|i| {
                let app_id = i.app_guid()?.to_string();
                Some((i.name, app_id))
            })
            .collect();

        normalize_batch(&samples, &app_ids)
    }

    /// Collect every `interval` until shutdown or the receiver goes away.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            namespace = %self.namespace,
            interval_secs = interval.as_secs(),
            "Starting metrics collector"
        );

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let batch = match self.collect_once().await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(error = %e, "Failed to collect metrics");
                            continue;
                        }
                    };
                    if batch.is_empty() {
                        continue;
                    }

                    debug!(count = batch.len(), "Forwarding metrics batch");
                    if self.metrics_tx.send(batch).await.is_err() {
                        warn!("Metrics channel closed");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Metrics collector shutting down");
                        break;
                    }
                }
            }
        }
    }
}
