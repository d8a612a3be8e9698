//! Periodic sweep over every managed copy.
//!
//! Deletes copies whose owning `SecretSync` is gone, no longer lists the copy's
//! namespace, or now replicates a different source. This bounds how long any
//! missed event or tampering can leave an orphan behind. Owners of the copies
//! that survive are queued for a resync, which picks up sources that changed
//! without emitting an event (e.g. created after their declaration).

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::{
    cluster::ClusterApi,
    crds::SecretSync,
    dispatcher::{Dispatcher, Shutdown},
    error::Result,
    event::WorkItem,
    ledger::{self, ObjectKey},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub pruned: Vec<ObjectKey>,
    pub skipped: usize,
    pub resynced: usize,
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Keep,
    Prune(&'static str),
}

pub struct GarbageCollector {
    cluster: Arc<dyn ClusterApi>,
    interval: Duration,
    resync: Option<Dispatcher>,
}

impl GarbageCollector {
    pub fn new(cluster: Arc<dyn ClusterApi>, interval: Duration) -> Self {
        Self {
            cluster,
            interval,
            resync: None,
        }
    }

    /// Queue a resync of every live owner after each sweep.
    pub fn with_resync(mut self, dispatcher: Dispatcher) -> Self {
        self.resync = Some(dispatcher);
        self
    }

    /// Sweep every `interval` until shutdown. The first sweep runs one interval after start.
    pub async fn run(&self, mut shutdown: Shutdown) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) => info!(
                    scanned = report.scanned,
                    pruned = report.pruned.len(),
                    skipped = report.skipped,
                    resynced = report.resynced,
                    "Garbage collection finished"
                ),
                Err(e) => error!(error = %e, "Garbage collection failed to list managed secrets"),
            }
        }
        debug!("Garbage collector stopped");
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let copies = self.cluster.list_managed_secrets().await?;
        let mut declarations: HashMap<ObjectKey, Option<SecretSync>> = HashMap::new();
        let mut live = BTreeSet::new();
        let mut report = SweepReport {
            scanned: copies.len(),
            ..SweepReport::default()
        };

        for copy in &copies {
            let Some(copy_key) = ObjectKey::of(copy) else {
                continue;
            };
            let owner = match ledger::owner_of(copy) {
                Some(Ok(owner)) => owner,
                Some(Err(e)) => {
                    warn!(secret = %copy_key, error = %e, "Managed secret has an unreadable owner, skipping");
                    report.skipped += 1;
                    continue;
                }
                None => {
                    warn!(secret = %copy_key, "Managed secret has no owner annotation, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            let declaration = match declarations.get(&owner) {
                Some(cached) => cached.clone(),
                None => match self.cluster.get_declaration(&owner).await {
                    Ok(found) => {
                        declarations.insert(owner.clone(), found.clone());
                        found
                    }
                    Err(e) => {
                        warn!(secret = %copy_key, declaration = %owner, error = %e, "Could not fetch SecretSync, retrying next cycle");
                        report.skipped += 1;
                        continue;
                    }
                },
            };

            let Verdict::Prune(reason) = verdict(copy, declaration.as_ref()) else {
                live.insert(owner);
                continue;
            };

            match self
                .cluster
                .delete_secret(&copy_key.namespace, &copy_key.name)
                .await
            {
                Ok(_) => {
                    info!(secret = %copy_key, declaration = %owner, reason, "Pruned orphaned secret");
                    report.pruned.push(copy_key);
                }
                Err(e) => {
                    warn!(secret = %copy_key, error = %e, "Failed to prune secret, retrying next cycle");
                    report.skipped += 1;
                }
            }
        }

        if let Some(dispatcher) = &self.resync {
            for owner in live {
                match dispatcher.submit(owner.clone(), WorkItem::Resync).await {
                    Ok(()) => report.resynced += 1,
                    Err(e) => {
                        warn!(declaration = %owner, error = %e, "Could not queue resync");
                        break;
                    }
                }
            }
        }

        Ok(report)
    }
}

fn verdict(copy: &Secret, declaration: Option<&SecretSync>) -> Verdict {
    let Some(sync) = declaration else {
        return Verdict::Prune("SecretSync deleted");
    };

    let namespace = copy.namespace().unwrap_or_default();
    if !sync.targets_namespace(&namespace) {
        return Verdict::Prune("namespace no longer a destination");
    }

    if let Some(Ok(origin)) = ledger::origin_of(copy) {
        let current = ObjectKey::new(sync.namespace().unwrap_or_default(), &sync.spec.source_secret);
        if origin != current || copy.name_any() != sync.spec.source_secret {
            return Verdict::Prune("source secret changed");
        }
    }

    Verdict::Keep
}
