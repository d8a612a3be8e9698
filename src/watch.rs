//! Watch multiplexer.
//!
//! Two subscriptions feed the dispatcher: one over `SecretSync` objects and one
//! over Secrets carrying either controller label. Every (re)connect starts from a
//! fresh list, which is replayed as `Modified` events so that each reconnect
//! doubles as a full resync.

use std::{collections::HashMap, time::Duration};

use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, Resource,
    runtime::watcher::{self, watcher},
};
use tokio_retry2::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, info, warn};

use crate::{
    crds::SecretSync,
    dispatcher::{Dispatcher, Shutdown},
    error::{Error, Result},
    event::{ChangeType, Event, Notification, route},
    ledger::{self, ObjectKey},
};

/// Turns raw watcher events into change events, keeping the last-known state
/// of every object so that objects which vanished across a relist are reported
/// as deleted.
pub struct Translator<K> {
    known: HashMap<ObjectKey, K>,
    relisting: Option<HashMap<ObjectKey, K>>,
}

impl<K> Default for Translator<K> {
    fn default() -> Self {
        Self {
            known: HashMap::new(),
            relisting: None,
        }
    }
}

impl<K: Resource + Clone> Translator<K> {
    pub fn translate(&mut self, event: watcher::Event<K>) -> Vec<Event<K>> {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashMap::new());
                vec![]
            }
            watcher::Event::InitApply(obj) => {
                let Some(key) = ObjectKey::of(&obj) else {
                    return vec![];
                };
                match self.relisting.as_mut() {
                    Some(fresh) => {
                        fresh.insert(key, obj.clone());
                    }
                    None => {
                        self.known.insert(key, obj.clone());
                    }
                }
                vec![Event::new(ChangeType::Modified, obj)]
            }
            watcher::Event::InitDone => {
                let fresh = self.relisting.take().unwrap_or_default();
                let gone = self
                    .known
                    .drain()
                    .filter(|(key, _)| !fresh.contains_key(key))
                    .map(|(_, obj)| Event::new(ChangeType::Deleted, obj))
                    .collect();
                self.known = fresh;
                gone
            }
            watcher::Event::Apply(obj) => {
                let Some(key) = ObjectKey::of(&obj) else {
                    return vec![];
                };
                let change = match self.known.insert(key, obj.clone()) {
                    Some(_) => ChangeType::Modified,
                    None => ChangeType::Added,
                };
                vec![Event::new(change, obj)]
            }
            watcher::Event::Delete(obj) => {
                if let Some(key) = ObjectKey::of(&obj) {
                    self.known.remove(&key);
                }
                vec![Event::new(ChangeType::Deleted, obj)]
            }
        }
    }
}

fn reconnect_delays(retries: usize) -> Box<dyn Iterator<Item = Duration> + Send> {
    Box::new(
        ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(retries),
    )
}

pub struct WatchMultiplexer {
    client: Client,
    dispatcher: Dispatcher,
    retries: usize,
}

impl WatchMultiplexer {
    pub fn new(client: Client, dispatcher: Dispatcher, retries: usize) -> Self {
        Self {
            client,
            dispatcher,
            retries,
        }
    }

    pub async fn watch_declarations(&self, shutdown: Shutdown) -> Result<()> {
        let api = Api::<SecretSync>::all(self.client.clone());
        subscribe(
            "SecretSync",
            || watcher(api.clone(), watcher::Config::default()).boxed(),
            Notification::Declaration,
            &self.dispatcher,
            self.retries,
            shutdown,
        )
        .await
    }

    /// Label selectors cannot express "either label", so this subscription is
    /// backed by one watch per label.
    pub async fn watch_secrets(&self, shutdown: Shutdown) -> Result<()> {
        let api = Api::<Secret>::all(self.client.clone());
        let sourced = watcher::Config::default().labels(&ledger::sourced_selector());
        let managed = watcher::Config::default().labels(&ledger::managed_selector());
        tokio::try_join!(
            subscribe(
                "sourced Secret",
                || watcher(api.clone(), sourced.clone()).boxed(),
                Notification::Secret,
                &self.dispatcher,
                self.retries,
                shutdown.clone(),
            ),
            subscribe(
                "managed Secret",
                || watcher(api.clone(), managed.clone()).boxed(),
                Notification::Secret,
                &self.dispatcher,
                self.retries,
                shutdown,
            ),
        )
        .map(|_| ())
    }
}

pub(crate) type WatchStream<K> = BoxStream<'static, watcher::Result<watcher::Event<K>>>;

/// Feed one watch into the dispatcher until shutdown.
///
/// `connect` is called once up front and again after every stream error. The
/// retry budget is only restored once the new stream has delivered a complete
/// list or a live change. The watcher yields `Init` before making any API call,
/// so `Init` does not count.
pub(crate) async fn subscribe<K, F>(
    stream: &'static str,
    connect: F,
    wrap: fn(Event<K>) -> Notification,
    dispatcher: &Dispatcher,
    retries: usize,
    mut shutdown: Shutdown,
) -> Result<()>
where
    K: Resource + Clone + Send + 'static,
    F: Fn() -> WatchStream<K>,
{
    let mut events = connect();
    let mut translator = Translator::default();
    let mut delays = reconnect_delays(retries);
    info!(stream, "Watching");

    loop {
        let next = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            next = events.try_next() => next,
        };

        match next {
            Ok(Some(raw)) => {
                if matches!(
                    raw,
                    watcher::Event::InitDone | watcher::Event::Apply(_) | watcher::Event::Delete(_)
                ) {
                    delays = reconnect_delays(retries);
                }
                for event in translator.translate(raw) {
                    let notification = wrap(event);
                    debug!(stream, kind = ?notification.kind(), "Routing notification");
                    for (key, item) in route(notification) {
                        if let Err(e) = dispatcher.submit(key, item).await {
                            return if shutdown.is_triggered() { Ok(()) } else { Err(e) };
                        }
                    }
                }
            }
            Ok(None) => {
                return Err(Error::SubscriptionFailure {
                    stream,
                    reason: "watch stream ended".to_owned(),
                });
            }
            Err(e) => {
                let Some(delay) = delays.next() else {
                    return Err(Error::SubscriptionFailure {
                        stream,
                        reason: e.to_string(),
                    });
                };
                warn!(stream, error = %e, ?delay, "Watch failed, reconnecting");
                tokio::select! {
                    _ = shutdown.triggered() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                // A fresh watcher always relists, which replays every object.
                events = connect();
                debug!(stream, "Resubscribed");
            }
        }
    }
}
