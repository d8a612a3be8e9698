use kube_derive::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ledger::ObjectKey;

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "beansnet.net",
    version = "v1",
    kind = "SecretSync",
    namespaced,
    shortname = "ssync",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceSecret"}"#
)]
pub struct SecretSyncSpec {
    /// Name of the Secret, in the same namespace, to replicate.
    pub source_secret: String,
    #[serde(default)]
    pub destination_namespaces: Vec<String>,
}

impl SecretSync {
    /// `namespace/name` of this declaration, if it carries both.
    pub fn key(&self) -> Option<ObjectKey> {
        ObjectKey::of(self)
    }

    /// Destination namespaces in declaration order with duplicates removed.
    pub fn destinations(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.spec
            .destination_namespaces
            .iter()
            .map(String::as_str)
            .filter(|ns| seen.insert(*ns))
            .collect()
    }

    pub fn targets_namespace(&self, namespace: &str) -> bool {
        self.spec
            .destination_namespaces
            .iter()
            .any(|ns| ns == namespace)
    }
}
