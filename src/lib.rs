use std::sync::Arc;

use async_trait::async_trait;
use kube::{Client, config::KubeConfigOptions};
use tracing::{debug, error, info, warn};

pub mod cluster;
pub mod config;
pub mod crds;
pub mod declaration;
pub mod dispatcher;
pub mod drift;
pub mod error;
pub mod event;
pub mod gc;
pub mod ledger;
pub mod watch;

use cluster::{ClusterApi, KubeCluster};
use config::Config;
use declaration::DeclarationReconciler;
use dispatcher::{Dispatcher, Shutdown, WorkHandler, shutdown_channel};
use drift::DriftReconciler;
use event::WorkItem;
use gc::GarbageCollector;
use ledger::ObjectKey;
use watch::WatchMultiplexer;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let options = KubeConfigOptions::default();

    // Load kubeconfig if it's present otherwise fall back to cluster config
    let kube_config = kube::Config::from_kubeconfig(&options)
        .await
        .or_else(|_| kube::Config::incluster())?;
    let client = Client::try_from(kube_config)?;

    run_with_client(client, config).await
}

/// Runs until a termination signal arrives or a watch subscription is lost.
pub async fn run_with_client(client: Client, config: Config) -> anyhow::Result<()> {
    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeCluster::new(client.clone()));
    let (trigger, shutdown) = shutdown_channel();

    let reconcilers = Arc::new(Reconcilers::new(cluster.clone()));
    let (dispatcher, mut workers) = Dispatcher::start(
        reconcilers,
        config.workers,
        config.queue_capacity,
        shutdown.clone(),
    );

    let collector =
        GarbageCollector::new(cluster, config.gc_interval).with_resync(dispatcher.clone());
    let gc_shutdown = shutdown.clone();
    let gc_task = tokio::spawn(async move { collector.run(gc_shutdown).await });

    let mux = Arc::new(WatchMultiplexer::new(client, dispatcher, config.watch_retries));
    let mut declarations = tokio::spawn({
        let mux = mux.clone();
        let shutdown = shutdown.clone();
        async move { mux.watch_declarations(shutdown).await }
    });
    let mut secrets = tokio::spawn(async move { mux.watch_secrets(shutdown).await });

    info!(gc_interval = ?config.gc_interval, workers = config.workers, "secret-syncopier started");

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            Ok(())
        }
        res = &mut declarations => watch_exit("SecretSync", res),
        res = &mut secrets => watch_exit("Secret", res),
    };

    trigger.trigger();
    while workers.join_next().await.is_some() {}
    if let Err(e) = gc_task.await {
        warn!(error = %e, "Garbage collector task failed");
    }
    declarations.abort();
    secrets.abort();
    info!("secret-syncopier stopped");

    outcome
}

fn watch_exit(
    stream: &str,
    res: Result<error::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match res {
        Ok(Ok(())) => anyhow::bail!("{stream} subscription exited unexpectedly"),
        Ok(Err(e)) => {
            error!(error = %e, "CRITICAL: {stream} subscription lost");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "CRITICAL: {stream} subscription task failed");
            Err(e.into())
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "Unable to listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Routes dispatched work to the declaration and drift reconcilers.
pub struct Reconcilers {
    declaration: DeclarationReconciler,
    drift: DriftReconciler,
}

impl Reconcilers {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self {
            declaration: DeclarationReconciler::new(cluster.clone()),
            drift: DriftReconciler::new(cluster),
        }
    }
}

#[async_trait]
impl WorkHandler for Reconcilers {
    async fn handle(&self, key: &ObjectKey, item: WorkItem, shutdown: &Shutdown) {
        let (what, outcome) = match &item {
            WorkItem::Declaration(event) => (
                "declaration",
                self.declaration.reconcile(event, shutdown).await,
            ),
            WorkItem::Drift(event) => ("drift", self.drift.reconcile(event, shutdown).await),
            WorkItem::Resync => ("resync", self.declaration.resync(key, shutdown).await),
        };

        match outcome {
            Ok(report) if report.is_clean() => debug!(
                declaration = %key,
                what,
                applied = ?report.applied,
                skipped = ?report.skipped,
                "Reconciled"
            ),
            Ok(report) => warn!(
                declaration = %key,
                what,
                failed = ?report.failed,
                "Reconciled with failures, waiting for the next event or sweep"
            ),
            Err(e) if e.is_not_found() => debug!(declaration = %key, what, error = %e, "Nothing to reconcile"),
            Err(e) if e.is_transient() => warn!(
                declaration = %key,
                what,
                error = %e,
                "Transient failure, waiting for the next event or sweep"
            ),
            Err(e) => error!(declaration = %key, what, error = %e, "Reconciliation failed"),
        }
    }
}
