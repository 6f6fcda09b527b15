//! Consumer loop shared by the reconcilers.
//!
//! Each reconciler runs as one long-lived task that:
//! - Pulls the next event from its own watch stream
//! - Handles it to completion (including any outbound sends)
//! - Checks the stop signal before pulling the next one
//!
//! Reconciler state is owned by the task; nothing else can reach it.

use async_trait::async_trait;
use bridge_events::WatchEvent;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cluster::ClusterError;

/// Errors a reconcile cycle can end with.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A collaborator failed. The cycle had no side effects; a later event retries.
    #[error("transient error: {0}")]
    Transient(#[from] ClusterError),

    /// The downstream reader is gone.
    #[error("outbound channel closed")]
    ChannelClosed,
}

/// A stateful consumer of watch events.
#[async_trait]
pub trait Reconciler: Send + 'static {
    /// The object kind this reconciler watches.
    type Object: Send + 'static;

    /// Reconciler name for logging.
    fn name(&self) -> &'static str;

    /// Handle a single event.
    async fn handle(&mut self, event: WatchEvent<Self::Object>) -> Result<(), ReconcileError>;
}

/// Counters reported when a worker stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub events_handled: u64,
    pub cycles_aborted: u64,
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    StreamClosed,
    ChannelClosed,
}

/// Drive `reconciler` over `events` until shutdown, stream end, or a closed
/// outbound channel.
pub async fn run_worker<R, S>(
    mut reconciler: R,
    mut events: S,
    mut shutdown: watch::Receiver<bool>,
) -> (StopReason, WorkerStats)
where
    R: Reconciler,
    S: Stream<Item = WatchEvent<R::Object>> + Unpin,
{
    let worker = reconciler.name();
    info!(worker, "Starting reconcile worker");

    let mut stats = WorkerStats::default();

    let reason = loop {
        if *shutdown.borrow() {
            break StopReason::Shutdown;
        }

        let event = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped sender can never signal again; treat it as a stop.
                if changed.is_err() || *shutdown.borrow() {
                    break StopReason::Shutdown;
                }
                continue;
            }
            event = events.next() => match event {
                Some(event) => event,
                None => break StopReason::StreamClosed,
            },
        };

        let kind = event.kind();
        match reconciler.handle(event).await {
            Ok(()) => {
                stats.events_handled += 1;
                debug!(worker, kind = %kind, "Event handled");
            }
            Err(ReconcileError::Transient(e)) => {
                stats.cycles_aborted += 1;
                debug!(worker, kind = %kind, error = %e, "Reconcile cycle aborted");
            }
            Err(ReconcileError::ChannelClosed) => {
                warn!(worker, "Outbound channel closed");
                break StopReason::ChannelClosed;
            }
        }
    };

    info!(
        worker,
        reason = ?reason,
        events_handled = stats.events_handled,
        cycles_aborted = stats.cycles_aborted,
        "Reconcile worker stopped"
    );

    (reason, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    struct Counter {
        seen: Vec<u32>,
        fail_on: Option<u32>,
        out: mpsc::Sender<u32>,
    }

    #[async_trait]
    impl Reconciler for Counter {
        type Object = u32;

        fn name(&self) -> &'static str {
            "counter"
        }

        async fn handle(&mut self, event: WatchEvent<u32>) -> Result<(), ReconcileError> {
            let (WatchEvent::Added(n) | WatchEvent::Modified(n) | WatchEvent::Deleted(n)) = event;
            if self.fail_on == Some(n) {
                return Err(ClusterError::Unavailable("boom".to_string()).into());
            }
            self.seen.push(n);
            self.out.send(n).await.map_err(|_| ReconcileError::ChannelClosed)
        }
    }

    fn counter(out: mpsc::Sender<u32>) -> Counter {
        Counter {
            seen: Vec::new(),
            fail_on: None,
            out,
        }
    }

    #[tokio::test]
    async fn test_worker_stops_when_stream_ends() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = tokio_stream::iter(vec![WatchEvent::Added(1), WatchEvent::Modified(2)]);

        let (reason, stats) = run_worker(counter(out_tx), events, shutdown_rx).await;

        assert_eq!(reason, StopReason::StreamClosed);
        assert_eq!(stats.events_handled, 2);
        assert_eq!(out_rx.recv().await, Some(1));
        assert_eq!(out_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_worker_counts_aborted_cycles() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = tokio_stream::iter(vec![WatchEvent::Added(1), WatchEvent::Added(2)]);

        let mut reconciler = counter(out_tx);
        reconciler.fail_on = Some(1);
        let (_, stats) = run_worker(reconciler, events, shutdown_rx).await;

        assert_eq!(stats.events_handled, 1);
        assert_eq!(stats.cycles_aborted, 1);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown_signal() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel(8);

        let handle = tokio::spawn(run_worker(
            counter(out_tx),
            ReceiverStream::new(event_rx),
            shutdown_rx,
        ));

        event_tx.send(WatchEvent::Added(7)).await.unwrap();
        assert_eq!(out_rx.recv().await, Some(7));

        shutdown_tx.send(true).unwrap();
        let (reason, stats) = handle.await.unwrap();
        assert_eq!(reason, StopReason::Shutdown);
        assert_eq!(stats.events_handled, 1);

        // Events sent after the stop signal are never consumed.
        assert!(event_tx.send(WatchEvent::Added(8)).await.is_err());
    }

    #[tokio::test]
    async fn test_worker_stops_when_channel_closes() {
        let (out_tx, out_rx) = mpsc::channel(8);
        drop(out_rx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = tokio_stream::iter(vec![WatchEvent::Added(1), WatchEvent::Added(2)]);

        let (reason, stats) = run_worker(counter(out_tx), events, shutdown_rx).await;
        assert_eq!(reason, StopReason::ChannelClosed);
        assert_eq!(stats.events_handled, 0);
    }
}
