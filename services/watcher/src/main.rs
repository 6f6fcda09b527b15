//! bridge watcher
//!
//! Runs the route and crash reconcilers against the cluster API, plus the
//! optional digest sync and metrics collector loops.

use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_watcher::config::Config;
use bridge_watcher::digest::{DigestSync, HttpDigester};
use bridge_watcher::kube::KubeClient;
use bridge_watcher::metrics::MetricsCollector;
use bridge_watcher::sink::run_log_sink;
use bridge_watcher::{run_worker, CrashReconciler, InstanceResolver, RouteReconciler};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        namespace = %config.namespace,
        api_url = ?config.api_url,
        digest_sync = config.bits_url.is_some(),
        metrics = config.metrics_interval.is_some(),
        "Starting bridge watcher"
    );

    let kube = Arc::new(KubeClient::from_config(&config).await?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = JoinSet::new();
    let mut sinks = JoinSet::new();

    // Route reconciler
    let (routes_tx, routes_rx) = mpsc::channel(config.channel_capacity);
    let route = RouteReconciler::new(InstanceResolver::new(kube.clone()), routes_tx);
    let groups = kube.watch_groups(&config.namespace);
    workers.spawn(run_worker(route, groups, shutdown_rx.clone()));
    sinks.spawn(run_log_sink("routes", routes_rx));

    // Crash reconciler
    let (crash_tx, crash_rx) = mpsc::channel(config.channel_capacity);
    let crash = CrashReconciler::new(kube.clone(), crash_tx);
    let instances = kube.watch_instances(&config.namespace);
    workers.spawn(run_worker(crash, instances, shutdown_rx.clone()));
    sinks.spawn(run_log_sink("crashes", crash_rx));

    let mut loops = JoinSet::new();

    if let Some(bits_url) = &config.bits_url {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bridge-watcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let sync = DigestSync::new(
            config.namespace.clone(),
            Arc::new(HttpDigester::new(http, bits_url.clone())),
            kube.clone(),
        );
        let interval = config.digest_poll_interval;
        let shutdown_rx = shutdown_rx.clone();
        loops.spawn(async move { sync.run(interval, shutdown_rx).await });
    }

    if let Some(interval) = config.metrics_interval {
        let (metrics_tx, metrics_rx) = mpsc::channel(config.channel_capacity);
        let collector =
            MetricsCollector::new(config.namespace.clone(), kube.clone(), kube.clone(), metrics_tx);
        let shutdown_rx = shutdown_rx.clone();
        loops.spawn(async move { collector.run(interval, shutdown_rx).await });
        sinks.spawn(run_log_sink("metrics", metrics_rx));
    }

    // Wait for shutdown signal or an early worker exit
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        }
        Some(result) = workers.join_next() => {
            match result {
                Ok((reason, stats)) => error!(
                    reason = ?reason,
                    events_handled = stats.events_handled,
                    "Reconcile worker exited early"
                ),
                Err(e) => error!(error = %e, "Reconcile worker panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Reconcile worker panicked");
        }
    }
    while loops.join_next().await.is_some() {}
    while let Some(result) = sinks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Sink task panicked");
        }
    }

    info!("Bridge watcher shutdown complete");
    Ok(())
}
