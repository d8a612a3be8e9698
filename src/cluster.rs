//! Cluster collaborator.
//!
//! Every component talks to the API server through [`ClusterApi`] so that the
//! reconcilers and the garbage collector can run against an in-memory fake.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::{
    ByteString,
    api::core::v1::{Namespace, Secret},
};
use kube::{
    Api, Client,
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
    crds::SecretSync,
    error::Result,
    ledger::{self, ObjectKey},
};

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Fails with an `AlreadyExists` API error if the Secret is present.
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()>;

    /// JSON merge patch. Fails with a not-found error if the Secret is absent.
    async fn patch_secret(&self, namespace: &str, name: &str, patch: &SecretPatch) -> Result<()>;

    /// Returns `false` if the Secret was already gone.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Every Secret carrying the managed label, cluster-wide.
    async fn list_managed_secrets(&self) -> Result<Vec<Secret>>;

    /// Names of namespaces that exist and are not terminating.
    async fn list_namespaces(&self) -> Result<BTreeSet<String>>;

    async fn get_declaration(&self, key: &ObjectKey) -> Result<Option<SecretSync>>;
}

/// Partial update to a Secret. `None` values delete the key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecretPatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
    pub data: Option<BTreeMap<String, Option<ByteString>>>,
}

impl SecretPatch {
    pub fn label(mut self, key: &str, value: Option<String>) -> Self {
        self.labels.insert(key.to_owned(), value);
        self
    }

    pub fn annotation(mut self, key: &str, value: Option<String>) -> Self {
        self.annotations.insert(key.to_owned(), value);
        self
    }

    pub fn labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        for (k, v) in labels {
            self.labels.insert(k.clone(), Some(v.clone()));
        }
        self
    }

    pub fn annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        for (k, v) in annotations {
            self.annotations.insert(k.clone(), Some(v.clone()));
        }
        self
    }

    /// Replace the payload with `desired`, removing keys only present in `current`.
    pub fn payload(
        mut self,
        desired: &BTreeMap<String, ByteString>,
        current: Option<&BTreeMap<String, ByteString>>,
    ) -> Self {
        let mut data: BTreeMap<String, Option<ByteString>> = desired
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .collect();
        for stale in current.into_iter().flat_map(|c| c.keys()) {
            data.entry(stale.clone()).or_insert(None);
        }
        self.data = Some(data);
        self
    }

    /// RFC 7386 body for this patch.
    pub fn to_merge_patch(&self) -> Value {
        let mut metadata = Map::new();
        if !self.labels.is_empty() {
            metadata.insert("labels".into(), json!(self.labels));
        }
        if !self.annotations.is_empty() {
            metadata.insert("annotations".into(), json!(self.annotations));
        }

        let mut body = Map::new();
        if !metadata.is_empty() {
            body.insert("metadata".into(), Value::Object(metadata));
        }
        if let Some(data) = &self.data {
            body.insert("data".into(), json!(data));
        }
        Value::Object(body)
    }

    /// Apply the patch locally with merge-patch semantics.
    #[cfg(test)]
    pub(crate) fn apply_to(&self, secret: &mut Secret) {
        fn merge<V: Clone>(target: &mut BTreeMap<String, V>, changes: &BTreeMap<String, Option<V>>) {
            for (k, v) in changes {
                match v {
                    Some(v) => target.insert(k.clone(), v.clone()),
                    None => target.remove(k),
                };
            }
        }

        if !self.labels.is_empty() {
            merge(
                secret.metadata.labels.get_or_insert_with(BTreeMap::new),
                &self.labels,
            );
        }
        if !self.annotations.is_empty() {
            merge(
                secret.metadata.annotations.get_or_insert_with(BTreeMap::new),
                &self.annotations,
            );
        }
        if let Some(data) = &self.data {
            merge(secret.data.get_or_insert_with(BTreeMap::new), data);
        }
    }
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params() -> PatchParams {
        PatchParams {
            field_manager: Some(ledger::CONTROLLER_NAME.to_owned()),
            ..PatchParams::default()
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets(namespace).get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await?;
        Ok(())
    }

    async fn patch_secret(&self, namespace: &str, name: &str, patch: &SecretPatch) -> Result<()> {
        let body = patch.to_merge_patch();
        debug!(namespace, name, patch = %body, "Patching secret");
        self.secrets(namespace)
            .patch(name, &Self::patch_params(), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_managed_secrets(&self) -> Result<Vec<Secret>> {
        let params = ListParams::default().labels(&ledger::managed_selector());
        Ok(Api::<Secret>::all(self.client.clone())
            .list(&params)
            .await?
            .items)
    }

    async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
        let namespaces = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default())
            .await?;

        Ok(namespaces
            .items
            .into_iter()
            .filter(|ns| {
                ns.status.as_ref().and_then(|s| s.phase.as_deref()) != Some("Terminating")
            })
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn get_declaration(&self, key: &ObjectKey) -> Result<Option<SecretSync>> {
        Ok(Api::<SecretSync>::namespaced(self.client.clone(), &key.namespace)
            .get_opt(&key.name)
            .await?)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use kube::api::ObjectMeta;

    use super::*;
    use crate::{crds::SecretSyncSpec, error::Error};

    #[derive(Default)]
    pub struct FakeState {
        pub namespaces: BTreeSet<String>,
        pub secrets: BTreeMap<(String, String), Secret>,
        pub declarations: BTreeMap<ObjectKey, SecretSync>,
        pub failing_namespaces: BTreeSet<String>,
        pub writes: Vec<String>,
    }

    /// In-memory cluster with merge-patch semantics.
    #[derive(Default)]
    pub struct FakeCluster {
        pub state: Mutex<FakeState>,
    }

    pub fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, ByteString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }

    pub fn declaration(namespace: &str, name: &str, source: &str, dests: &[&str]) -> SecretSync {
        let mut sync = SecretSync::new(
            name,
            SecretSyncSpec {
                source_secret: source.to_owned(),
                destination_namespaces: dests.iter().map(|d| d.to_string()).collect(),
            },
        );
        sync.metadata.namespace = Some(namespace.to_owned());
        sync
    }

    fn unavailable() -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: "service unavailable".into(),
            reason: "ServiceUnavailable".into(),
            code: 503,
        }))
    }

    fn already_exists(name: &str) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: format!("secrets \"{name}\" already exists"),
            reason: "AlreadyExists".into(),
            code: 409,
        }))
    }

    impl FakeCluster {
        pub fn with_namespaces(namespaces: &[&str]) -> Self {
            let cluster = Self::default();
            cluster.state.lock().unwrap().namespaces =
                namespaces.iter().map(|n| n.to_string()).collect();
            cluster
        }

        pub fn put_secret(&self, namespace: &str, name: &str, payload: &[(&str, &str)]) {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    namespace: Some(namespace.to_owned()),
                    ..ObjectMeta::default()
                },
                data: Some(data(payload)),
                ..Secret::default()
            };
            self.insert_secret(secret);
        }

        pub fn insert_secret(&self, secret: Secret) {
            let key = (
                secret.metadata.namespace.clone().unwrap_or_default(),
                secret.metadata.name.clone().unwrap_or_default(),
            );
            self.state.lock().unwrap().secrets.insert(key, secret);
        }

        pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
            self.state
                .lock()
                .unwrap()
                .secrets
                .get(&(namespace.to_owned(), name.to_owned()))
                .cloned()
        }

        pub fn put_declaration(&self, sync: SecretSync) {
            let key = sync.key().unwrap();
            self.state.lock().unwrap().declarations.insert(key, sync);
        }

        pub fn remove_declaration(&self, namespace: &str, name: &str) {
            self.state
                .lock()
                .unwrap()
                .declarations
                .remove(&ObjectKey::new(namespace, name));
        }

        pub fn remove_namespace(&self, namespace: &str) {
            let mut state = self.state.lock().unwrap();
            state.namespaces.remove(namespace);
            state.secrets.retain(|(ns, _), _| ns != namespace);
        }

        pub fn fail_writes_in(&self, namespace: &str) {
            self.state
                .lock()
                .unwrap()
                .failing_namespaces
                .insert(namespace.to_owned());
        }

        pub fn writes(&self) -> Vec<String> {
            self.state.lock().unwrap().writes.clone()
        }

        fn check_writable(state: &mut FakeState, verb: &str, namespace: &str, name: &str) -> Result<()> {
            if state.failing_namespaces.contains(namespace) {
                return Err(unavailable());
            }
            state.writes.push(format!("{verb} {namespace}/{name}"));
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterApi for FakeCluster {
        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
            Ok(self.secret(namespace, name))
        }

        async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<()> {
            let name = secret.metadata.name.clone().unwrap_or_default();
            let mut state = self.state.lock().unwrap();
            if !state.namespaces.contains(namespace) {
                return Err(Error::not_found("Namespace", namespace));
            }
            let key = (namespace.to_owned(), name.clone());
            if state.secrets.contains_key(&key) {
                return Err(already_exists(&name));
            }
            Self::check_writable(&mut state, "create", namespace, &name)?;
            let mut stored = secret.clone();
            stored.metadata.namespace = Some(namespace.to_owned());
            state.secrets.insert(key, stored);
            Ok(())
        }

        async fn patch_secret(&self, namespace: &str, name: &str, patch: &SecretPatch) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let key = (namespace.to_owned(), name.to_owned());
            if !state.secrets.contains_key(&key) {
                return Err(Error::not_found("Secret", format!("{namespace}/{name}")));
            }
            Self::check_writable(&mut state, "patch", namespace, name)?;
            if let Some(secret) = state.secrets.get_mut(&key) {
                patch.apply_to(secret);
            }
            Ok(())
        }

        async fn delete_secret(&self, namespace: &str, name: &str) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            let key = (namespace.to_owned(), name.to_owned());
            if !state.secrets.contains_key(&key) {
                return Ok(false);
            }
            Self::check_writable(&mut state, "delete", namespace, name)?;
            Ok(state.secrets.remove(&key).is_some())
        }

        async fn list_managed_secrets(&self) -> Result<Vec<Secret>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .secrets
                .values()
                .filter(|s| ledger::is_managed(s))
                .cloned()
                .collect())
        }

        async fn list_namespaces(&self) -> Result<BTreeSet<String>> {
            Ok(self.state.lock().unwrap().namespaces.clone())
        }

        async fn get_declaration(&self, key: &ObjectKey) -> Result<Option<SecretSync>> {
            Ok(self.state.lock().unwrap().declarations.get(key).cloned())
        }
    }
}
