//! Ownership ledger.
//!
//! The only persistent link between a copied Secret and the `SecretSync` that
//! produced it is a handful of labels and annotations. The keys and values here
//! are shared with any other implementation of the controller and must not change.

use std::{collections::BTreeMap, fmt, str::FromStr};

use k8s_openapi::api::core::v1::Secret;
use kube::{Resource, ResourceExt};

use crate::{cluster::SecretPatch, crds::SecretSync, error::Error};

pub const CONTROLLER_NAME: &str = "secret-syncopier";

/// Label placed on a source Secret while a declaration replicates it.
pub const SOURCED_LABEL: &str = "sourced-with";
/// Annotation on a source Secret naming the declaration that marked it.
pub const SOURCED_BY_ANNOTATION: &str = "sourced-by";
/// Label placed on every destination copy.
pub const MANAGED_LABEL: &str = "managed-by";
/// Annotation on a copy naming its origin Secret.
pub const SOURCE_SECRET_ANNOTATION: &str = "source-secret";
/// Annotation on a copy naming its owning declaration.
pub const OWNER_ANNOTATION: &str = "secret-syncopier";

pub fn sourced_selector() -> String {
    format!("{SOURCED_LABEL}={CONTROLLER_NAME}")
}

pub fn managed_selector() -> String {
    format!("{MANAGED_LABEL}={CONTROLLER_NAME}")
}

/// A `namespace/name` reference to a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self::new(meta.namespace.clone()?, meta.name.clone()?))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(Error::InvalidReference(s.to_owned())),
        }
    }
}

fn annotation_key(obj: &Secret, annotation: &str) -> Option<Result<ObjectKey, Error>> {
    obj.annotations().get(annotation).map(|v| v.parse())
}

fn has_label(obj: &Secret, label: &str) -> bool {
    obj.labels().get(label).map(String::as_str) == Some(CONTROLLER_NAME)
}

pub fn is_sourced(secret: &Secret) -> bool {
    has_label(secret, SOURCED_LABEL)
}

pub fn is_managed(secret: &Secret) -> bool {
    has_label(secret, MANAGED_LABEL)
}

/// Declaration that marked a source Secret, if any.
pub fn sourced_by(secret: &Secret) -> Option<Result<ObjectKey, Error>> {
    annotation_key(secret, SOURCED_BY_ANNOTATION)
}

/// Declaration owning a copied Secret, if any.
pub fn owner_of(secret: &Secret) -> Option<Result<ObjectKey, Error>> {
    annotation_key(secret, OWNER_ANNOTATION)
}

/// Secret a copy was made from, if recorded.
pub fn origin_of(secret: &Secret) -> Option<Result<ObjectKey, Error>> {
    annotation_key(secret, SOURCE_SECRET_ANNOTATION)
}

/// Whether a copy records `declaration` as its owner.
pub fn owned_by(secret: &Secret, declaration: &ObjectKey) -> bool {
    matches!(owner_of(secret), Some(Ok(owner)) if &owner == declaration)
}

/// Merge patch marking a source Secret as replicated by `declaration`.
pub fn mark_source(declaration: &ObjectKey) -> SecretPatch {
    SecretPatch::default()
        .label(SOURCED_LABEL, Some(CONTROLLER_NAME.to_owned()))
        .annotation(SOURCED_BY_ANNOTATION, Some(declaration.to_string()))
}

/// Merge patch removing the source markers.
pub fn unmark_source() -> SecretPatch {
    SecretPatch::default()
        .label(SOURCED_LABEL, None)
        .annotation(SOURCED_BY_ANNOTATION, None)
}

pub fn destination_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_LABEL.to_owned(), CONTROLLER_NAME.to_owned())])
}

pub fn destination_annotations(
    origin: &ObjectKey,
    declaration: &ObjectKey,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (SOURCE_SECRET_ANNOTATION.to_owned(), origin.to_string()),
        (OWNER_ANNOTATION.to_owned(), declaration.to_string()),
    ])
}

pub fn declaration_key(sync: &SecretSync) -> Result<ObjectKey, Error> {
    sync.key()
        .ok_or_else(|| Error::InvalidReference(sync.name_any()))
}
