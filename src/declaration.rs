use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ClusterApi, SecretPatch},
    crds::SecretSync,
    dispatcher::Shutdown,
    error::Result,
    event::{ChangeType, Event},
    ledger::{self, ObjectKey},
};

/// Outcome of one reconciliation, by destination namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct DeclarationReconciler {
    cluster: Arc<dyn ClusterApi>,
}

impl DeclarationReconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn reconcile(
        &self,
        event: &Event<SecretSync>,
        shutdown: &Shutdown,
    ) -> Result<ReconcileReport> {
        match event.change {
            ChangeType::Added | ChangeType::Modified => self.apply(&event.object, shutdown).await,
            ChangeType::Deleted => self.cleanup(&event.object, shutdown).await,
        }
    }

    /// Re-apply the live declaration, if it still exists.
    pub async fn resync(&self, key: &ObjectKey, shutdown: &Shutdown) -> Result<ReconcileReport> {
        match self.cluster.get_declaration(key).await? {
            Some(sync) => self.apply(&sync, shutdown).await,
            None => {
                debug!(declaration = %key, "SecretSync no longer exists, nothing to resync");
                Ok(ReconcileReport::default())
            }
        }
    }

    pub async fn apply(&self, sync: &SecretSync, shutdown: &Shutdown) -> Result<ReconcileReport> {
        let key = ledger::declaration_key(sync)?;
        let source_name = sync.spec.source_secret.as_str();
        let origin = ObjectKey::new(&key.namespace, source_name);

        let source = match self.cluster.get_secret(&key.namespace, source_name).await? {
            Some(source) => {
                self.mark_source(&key, &source).await;
                source
            }
            None => {
                warn!(
                    declaration = %key,
                    source = %origin,
                    "Source secret not found, replicating an empty payload"
                );
                Secret::default()
            }
        };

        let labels = ledger::destination_labels();
        let annotations = ledger::destination_annotations(&origin, &key);
        let payload = source.data.clone().unwrap_or_default();
        let metadata = SecretPatch::default()
            .labels(&labels)
            .annotations(&annotations);

        let namespaces = self.cluster.list_namespaces().await?;
        let mut report = ReconcileReport::default();

        for ns in sync.destinations() {
            if shutdown.is_triggered() {
                info!(declaration = %key, "Shutdown requested, stopping reconciliation");
                break;
            }
            if ns == key.namespace {
                warn!(declaration = %key, namespace = ns, "Refusing to copy a secret onto itself");
                report.skipped.push(ns.to_owned());
                continue;
            }
            if !namespaces.contains(ns) {
                warn!(declaration = %key, namespace = ns, "Destination namespace does not exist, skipping");
                report.skipped.push(ns.to_owned());
                continue;
            }

            // Keys the copy has but the source lacks are nulled so replays converge.
            let result = match self.cluster.get_secret(ns, source_name).await {
                Ok(Some(existing)) => {
                    let patch = metadata.clone().payload(&payload, existing.data.as_ref());
                    self.cluster
                        .patch_secret(ns, source_name, &patch)
                        .await
                        .map(|_| "patched")
                }
                Ok(None) => {
                    let copy = Secret {
                        metadata: ObjectMeta {
                            name: Some(source_name.to_owned()),
                            namespace: Some(ns.to_owned()),
                            labels: Some(labels.clone()),
                            annotations: Some(annotations.clone()),
                            ..ObjectMeta::default()
                        },
                        data: Some(payload.clone()),
                        type_: source.type_.clone(),
                        ..Secret::default()
                    };
                    self.cluster.create_secret(ns, &copy).await.map(|_| "created")
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(verb) => {
                    info!(declaration = %key, namespace = ns, secret = source_name, "Secret {verb}");
                    report.applied.push(ns.to_owned());
                }
                Err(e) => {
                    error!(declaration = %key, namespace = ns, error = %e, "Failed to replicate secret");
                    report.failed.push(ns.to_owned());
                }
            }
        }

        Ok(report)
    }

    pub async fn cleanup(&self, sync: &SecretSync, shutdown: &Shutdown) -> Result<ReconcileReport> {
        let key = ledger::declaration_key(sync)?;
        let source_name = sync.spec.source_secret.as_str();
        let mut report = ReconcileReport::default();

        for ns in sync.destinations() {
            if shutdown.is_triggered() {
                info!(declaration = %key, "Shutdown requested, stopping cleanup");
                return Ok(report);
            }
            if ns == key.namespace {
                report.skipped.push(ns.to_owned());
                continue;
            }

            match self.delete_copy(&key, ns, source_name).await {
                Ok(true) => {
                    info!(declaration = %key, namespace = ns, secret = source_name, "Secret deleted");
                    report.applied.push(ns.to_owned());
                }
                Ok(false) => report.skipped.push(ns.to_owned()),
                Err(e) => {
                    error!(declaration = %key, namespace = ns, error = %e, "Failed to delete secret");
                    report.failed.push(ns.to_owned());
                }
            }
        }

        if let Err(e) = self.unmark_source(&key, source_name).await {
            error!(declaration = %key, error = %e, "Failed to remove source markers");
            report.failed.push(key.namespace.clone());
        }

        Ok(report)
    }

    async fn mark_source(&self, key: &ObjectKey, source: &Secret) {
        match ledger::sourced_by(source) {
            Some(Ok(owner)) if &owner == key && ledger::is_sourced(source) => return,
            Some(Ok(previous)) if &previous != key => warn!(
                declaration = %key,
                previous = %previous,
                "Source secret is already replicated by another SecretSync, taking over the marker"
            ),
            _ => {}
        }

        let name = source.metadata.name.as_deref().unwrap_or_default();
        match self
            .cluster
            .patch_secret(&key.namespace, name, &ledger::mark_source(key))
            .await
        {
            Ok(()) => debug!(declaration = %key, secret = name, "Marked source secret"),
            Err(e) => warn!(declaration = %key, secret = name, error = %e, "Failed to mark source secret"),
        }
    }

    /// Returns `false` if there was nothing of ours to delete.
    async fn delete_copy(&self, key: &ObjectKey, ns: &str, name: &str) -> Result<bool> {
        let Some(copy) = self.cluster.get_secret(ns, name).await? else {
            return Ok(false);
        };
        if !ledger::owned_by(&copy, key) {
            warn!(declaration = %key, namespace = ns, secret = name, "Secret is not owned by this SecretSync, leaving it");
            return Ok(false);
        }
        self.cluster.delete_secret(ns, name).await
    }

    async fn unmark_source(&self, key: &ObjectKey, name: &str) -> Result<()> {
        let Some(source) = self.cluster.get_secret(&key.namespace, name).await? else {
            debug!(declaration = %key, secret = name, "Source secret already gone");
            return Ok(());
        };

        match ledger::sourced_by(&source) {
            Some(Ok(owner)) if &owner != key => {
                debug!(declaration = %key, owner = %owner, "Source secret marked by another SecretSync");
                return Ok(());
            }
            None if !ledger::is_sourced(&source) => return Ok(()),
            _ => {}
        }

        match self
            .cluster
            .patch_secret(&key.namespace, name, &ledger::unmark_source())
            .await
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}
