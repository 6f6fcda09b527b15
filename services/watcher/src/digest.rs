//! Rootfs digest sync.
//!
//! Polls the blob store for the current rootfs digest and labels every
//! workload group whose instance template still carries a different one, so
//! the platform rolls those groups onto the new rootfs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_events::labels;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, WorkloadGroupPatcher};

/// Longest value a label may hold.
const MAX_LABEL_VALUE_LEN: usize = 63;

#[derive(Debug, Error)]
pub enum DigestError {
    /// The blob store could not be reached.
    #[error("digest request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The blob store answered with a non-success status.
    #[error("digest request returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The blob store returned no usable digest.
    #[error("empty digest")]
    Empty,

    /// Listing or patching workload groups failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Source of the current rootfs digest.
#[async_trait]
pub trait DigestSource: Send + Sync {
    /// Current digest, already normalized to a label value.
    async fn current_digest(&self) -> Result<String, DigestError>;
}

/// Normalize a raw digest to a label value.
///
/// Keeps the text after the last `:`, trimmed of whitespace and quotes, cut to
/// the label length limit.
pub fn digest_label_value(raw: &str) -> Option<String> {
    let tail = raw.rsplit(':').next().unwrap_or(raw);
    let value: String = tail
        .trim_matches(|c: char| c.is_whitespace() || c == '"')
        .chars()
        .take(MAX_LABEL_VALUE_LEN)
        .collect();

    (!value.is_empty()).then_some(value)
}

/// Fetches the digest from `{bits_url}/v2/eirinifs`.
pub struct HttpDigester {
    client: reqwest::Client,
    bits_url: String,
}

impl HttpDigester {
    pub fn new(client: reqwest::Client, bits_url: impl Into<String>) -> Self {
        Self {
            client,
            bits_url: bits_url.into(),
        }
    }
}

#[async_trait]
impl DigestSource for HttpDigester {
    async fn current_digest(&self) -> Result<String, DigestError> {
        let base = self.bits_url.trim_end_matches('/');
        let url = format!("{base}/v2/eirinifs");
        debug!(url = %url, "Fetching rootfs digest");

        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(DigestError::Status { status, body });
        }

        let body = resp.text().await?;
        digest_label_value(&body).ok_or(DigestError::Empty)
    }
}

/// Periodic digest comparison and workload group patching.
pub struct DigestSync {
    namespace: String,
    source: Arc<dyn DigestSource>,
    groups: Arc<dyn WorkloadGroupPatcher>,
}

impl DigestSync {
    pub fn new(
        namespace: impl Into<String>,
        source: Arc<dyn DigestSource>,
        groups: Arc<dyn WorkloadGroupPatcher>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            source,
            groups,
        }
    }

    /// Label every stale group with the current digest.
    ///
    /// Stops at the first failed patch. Returns the number of groups patched.
    pub async fn poll(&self) -> Result<usize, DigestError> {
        let digest = self.source.current_digest().await?;

        let stale = self
            .groups
            .list_stale_groups(&self.namespace, labels::ROOTFS_DIGEST, &digest)
            .await?;
        debug!(digest = %digest, stale = stale.len(), "Checked workload group digests");

        for group in &stale {
            self.groups
                .patch_group_label(&self.namespace, group, labels::ROOTFS_DIGEST, &digest)
                .await?;
            info!(group = %group, digest = %digest, "Workload group labelled with rootfs digest");
        }

        Ok(stale.len())
    }

    /// Poll every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            namespace = %self.namespace,
            interval_secs = interval.as_secs(),
            "Starting digest sync"
        );

        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll().await {
                        warn!(error = %e, "Digest sync poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Digest sync shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use bridge_events::WorkloadGroup;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DIGEST: &str = "d2d3a41b8a0b8cd0d4f4f5ac3fa0e0c2f1d4cb8e3c21a1e7a4a5e4b8c9d0e1f2";

    struct FixedDigest(&'static str);

    #[async_trait]
    impl DigestSource for FixedDigest {
        async fn current_digest(&self) -> Result<String, DigestError> {
            Ok(self.0.to_string())
        }
    }

    fn group(name: &str, digest: Option<&str>) -> WorkloadGroup {
        WorkloadGroup {
            name: name.to_string(),
            namespace: "ns".to_string(),
            labels: digest
                .map(|d| BTreeMap::from([(labels::ROOTFS_DIGEST.to_string(), d.to_string())]))
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[rstest]
    #[case("sha256:abc\n", Some("abc"))]
    #[case("  abc  ", Some("abc"))]
    #[case("\"sha256:abc\"", Some("abc"))]
    #[case("sha256:", None)]
    #[case("", None)]
    fn test_digest_label_value(#[case] raw: &str, #[case] expected: Option<&str>) {
        assert_eq!(digest_label_value(raw).as_deref(), expected);
    }

    #[test]
    fn test_digest_label_value_is_cut_to_label_limit() {
        let value = digest_label_value(&format!("sha256:{DIGEST}")).unwrap();
        assert_eq!(value.len(), MAX_LABEL_VALUE_LEN);
        assert!(DIGEST.starts_with(&value));
    }

    #[tokio::test]
    async fn test_http_digester_fetches_digest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/eirinifs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("sha256:cafe\n"))
            .expect(1)
            .mount(&server)
            .await;

        let digester = HttpDigester::new(reqwest::Client::new(), server.uri());
        assert_eq!(digester.current_digest().await.unwrap(), "cafe");
    }

    #[tokio::test]
    async fn test_http_digester_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/eirinifs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let digester = HttpDigester::new(reqwest::Client::new(), format!("{}/", server.uri()));
        let err = digester.current_digest().await.unwrap_err();
        assert!(matches!(err, DigestError::Status { status: 503, ref body } if body == "busy"));
    }

    #[tokio::test]
    async fn test_poll_patches_only_stale_groups() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_group(group("fresh", Some("cafe"))).await;
        cluster.put_group(group("stale", Some("beef"))).await;
        cluster.put_group(group("unlabelled", None)).await;

        let sync = DigestSync::new("ns", Arc::new(FixedDigest("cafe")), cluster.clone());
        assert_eq!(sync.poll().await.unwrap(), 2);

        let patched: Vec<String> = cluster.patches().await.into_iter().map(|p| p.0).collect();
        assert_eq!(patched, vec!["stale".to_string(), "unlabelled".to_string()]);

        // Converged: a second poll finds nothing to do.
        assert_eq!(sync.poll().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poll_stops_at_first_failed_patch() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.put_group(group("stale", None)).await;
        cluster.fail_patches(true);

        let sync = DigestSync::new("ns", Arc::new(FixedDigest("cafe")), cluster.clone());
        assert!(matches!(sync.poll().await, Err(DigestError::Cluster(_))));
        assert!(cluster.patches().await.is_empty());
    }
}
