//! Log sink for outbound messages.
//!
//! Stands in for the downstream router, crash handler and metrics consumer:
//! every message is serialized and written to the log. Runs until the
//! senders are gone.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Drain `rx`, logging each message. Returns the number of messages seen.
pub async fn run_log_sink<T: Serialize>(channel: &'static str, mut rx: mpsc::Receiver<T>) -> u64 {
    let mut delivered = 0u64;

    while let Some(message) = rx.recv().await {
        delivered += 1;
        match serde_json::to_string(&message) {
            Ok(payload) => info!(channel, payload = %payload, "Outbound message"),
            Err(e) => warn!(channel, error = %e, "Failed to encode outbound message"),
        }
    }

    info!(channel, delivered, "Outbound channel closed");
    delivered
}
