use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::{
    cluster::{ClusterApi, SecretPatch},
    declaration::ReconcileReport,
    dispatcher::Shutdown,
    error::Result,
    event::{ChangeType, Event},
    ledger::{self, ObjectKey},
};

/// Forwards in-place payload edits of a source Secret to its existing copies.
///
/// Only the payload is written; copy metadata belongs to the declaration reconciler.
pub struct DriftReconciler {
    cluster: Arc<dyn ClusterApi>,
}

impl DriftReconciler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn reconcile(&self, event: &Event<Secret>, shutdown: &Shutdown) -> Result<ReconcileReport> {
        if event.change != ChangeType::Modified {
            return Ok(ReconcileReport::default());
        }
        self.propagate(&event.object, shutdown).await
    }

    pub async fn propagate(&self, source: &Secret, shutdown: &Shutdown) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let Some(origin) = ObjectKey::of(source) else {
            return Ok(report);
        };
        let key = match ledger::sourced_by(source) {
            Some(Ok(key)) => key,
            Some(Err(e)) => {
                warn!(source = %origin, error = %e, "Ignoring source secret with unreadable marker");
                return Ok(report);
            }
            None => return Ok(report),
        };

        let Some(sync) = self.cluster.get_declaration(&key).await? else {
            debug!(declaration = %key, source = %origin, "SecretSync is gone, skipping drift");
            return Ok(report);
        };
        if key.namespace != origin.namespace || sync.spec.source_secret != origin.name {
            debug!(declaration = %key, source = %origin, "SecretSync no longer replicates this secret");
            return Ok(report);
        }

        let payload = source.data.clone().unwrap_or_default();
        let namespaces = self.cluster.list_namespaces().await?;

        for ns in sync.destinations() {
            if shutdown.is_triggered() {
                break;
            }
            if ns == origin.namespace || !namespaces.contains(ns) {
                report.skipped.push(ns.to_owned());
                continue;
            }

            match self.sync_payload(&key, ns, source, &payload).await {
                Ok(true) => {
                    info!(declaration = %key, namespace = ns, secret = %source.name_any(), "Propagated payload change");
                    report.applied.push(ns.to_owned());
                }
                Ok(false) => report.skipped.push(ns.to_owned()),
                Err(e) => {
                    error!(declaration = %key, namespace = ns, error = %e, "Failed to propagate payload change");
                    report.failed.push(ns.to_owned());
                }
            }
        }

        Ok(report)
    }

    /// Returns `true` if the copy was rewritten.
    async fn sync_payload(
        &self,
        key: &ObjectKey,
        ns: &str,
        source: &Secret,
        payload: &BTreeMap<String, ByteString>,
    ) -> Result<bool> {
        let name = source.name_any();
        let Some(copy) = self.cluster.get_secret(ns, &name).await? else {
            debug!(declaration = %key, namespace = ns, "Copy not created yet, leaving it to the SecretSync");
            return Ok(false);
        };
        if !ledger::owned_by(&copy, key) {
            return Ok(false);
        }

        let current = copy.data.unwrap_or_default();
        if &current == payload {
            return Ok(false);
        }

        let patch = SecretPatch::default().payload(payload, Some(&current));
        match self.cluster.patch_secret(ns, &name, &patch).await {
            Err(e) if e.is_not_found() => Ok(false),
            other => other.map(|_| true),
        }
    }
}
