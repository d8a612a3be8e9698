use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::{
    crds::SecretSync,
    ledger::{self, ObjectKey},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Event<K> {
    pub change: ChangeType,
    pub object: K,
}

impl<K> Event<K> {
    pub fn new(change: ChangeType, object: K) -> Self {
        Self { change, object }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Declaration,
    Secret,
}

/// A change delivered by one of the two subscriptions.
#[derive(Clone, Debug)]
pub enum Notification {
    Declaration(Event<SecretSync>),
    Secret(Event<Secret>),
}

impl Notification {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Notification::Declaration(_) => ResourceKind::Declaration,
            Notification::Secret(_) => ResourceKind::Secret,
        }
    }
}

/// Unit of work for one declaration key.
#[derive(Clone, Debug)]
pub enum WorkItem {
    Declaration(Event<SecretSync>),
    /// A source Secret changed in place.
    Drift(Event<Secret>),
    /// A copy disappeared; re-apply the declaration if it still exists.
    Resync,
}

impl WorkItem {
    /// Whether running `self` makes a still-pending `older` item redundant.
    pub fn supersedes(&self, older: &WorkItem) -> bool {
        match (self, older) {
            // A pending cleanup always runs, even when a recreation follows it.
            (WorkItem::Declaration(_), WorkItem::Declaration(old)) => {
                old.change != ChangeType::Deleted
            }
            (WorkItem::Declaration(new), WorkItem::Resync) => new.change != ChangeType::Deleted,
            (WorkItem::Drift(_), WorkItem::Drift(_)) => true,
            (WorkItem::Resync, WorkItem::Resync) => true,
            _ => false,
        }
    }
}

/// Map a notification onto the declaration keys it concerns.
///
/// Source and copy events share the owning declaration's key so that every
/// write for one declaration is serialized.
pub fn route(notification: Notification) -> Vec<(ObjectKey, WorkItem)> {
    match notification {
        Notification::Declaration(event) => match event.object.key() {
            Some(key) => vec![(key, WorkItem::Declaration(event))],
            None => {
                warn!(name = %event.object.name_any(), "Ignoring SecretSync without namespace");
                vec![]
            }
        },
        Notification::Secret(event) => route_secret(event),
    }
}

fn route_secret(event: Event<Secret>) -> Vec<(ObjectKey, WorkItem)> {
    let secret = &event.object;
    let mut work = Vec::new();

    if ledger::is_sourced(secret) && event.change == ChangeType::Modified {
        match ledger::sourced_by(secret) {
            Some(Ok(owner)) => work.push((owner, WorkItem::Drift(event.clone()))),
            Some(Err(e)) => warn!(secret = %secret.name_any(), error = %e, "Unreadable source marker"),
            None => debug!(secret = %secret.name_any(), "Sourced secret has no owner annotation"),
        }
    }

    if ledger::is_managed(secret) && event.change == ChangeType::Deleted {
        match ledger::owner_of(secret) {
            Some(Ok(owner)) => work.push((owner, WorkItem::Resync)),
            Some(Err(e)) => warn!(secret = %secret.name_any(), error = %e, "Unreadable owner marker"),
            None => {}
        }
    }

    work
}
