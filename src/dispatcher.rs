//! Keyed work queue.
//!
//! Work items are queued per declaration key. A key is handed to at most one
//! worker at a time, which drains that key's queue in FIFO order; distinct keys
//! are processed in parallel by the worker pool.

use std::{
    collections::{HashMap, VecDeque, hash_map::Entry},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, error, info};

use crate::{
    error::{Error, Result},
    event::WorkItem,
    ledger::ObjectKey,
};

/// Cooperative shutdown signal shared by workers, watchers and the collector.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn shutdown_channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested or the trigger is dropped.
    pub async fn triggered(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}

#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    async fn handle(&self, key: &ObjectKey, item: WorkItem, shutdown: &Shutdown);
}

type Queues = Arc<Mutex<HashMap<ObjectKey, VecDeque<WorkItem>>>>;

/// A key present in `queues` is either waiting in `ready` or owned by a worker.
#[derive(Clone)]
pub struct Dispatcher {
    queues: Queues,
    ready: mpsc::Sender<ObjectKey>,
}

impl Dispatcher {
    pub fn start<H: WorkHandler>(
        handler: Arc<H>,
        workers: usize,
        capacity: usize,
        shutdown: Shutdown,
    ) -> (Self, JoinSet<()>) {
        let (ready, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queues: Queues = Arc::default();

        let mut tasks = JoinSet::new();
        for id in 0..workers.max(1) {
            tasks.spawn(worker(
                id,
                handler.clone(),
                queues.clone(),
                rx.clone(),
                shutdown.clone(),
            ));
        }
        info!(workers = workers.max(1), "Started reconciliation workers");

        (Self { queues, ready }, tasks)
    }

    pub async fn submit(&self, key: ObjectKey, item: WorkItem) -> Result<()> {
        let schedule = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            match queues.entry(key.clone()) {
                Entry::Occupied(mut queue) => {
                    coalesce(queue.get_mut(), item);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(VecDeque::from([item]));
                    true
                }
            }
        };

        if schedule {
            self.ready
                .send(key)
                .await
                .map_err(|_| Error::DispatcherClosed)?;
        }
        Ok(())
    }

    /// Items queued but not yet started, across all keys.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }
}

fn coalesce(queue: &mut VecDeque<WorkItem>, item: WorkItem) {
    while queue.back().is_some_and(|last| item.supersedes(last)) {
        queue.pop_back();
    }
    queue.push_back(item);
}

async fn worker<H: WorkHandler>(
    id: usize,
    handler: Arc<H>,
    queues: Queues,
    ready: Arc<tokio::sync::Mutex<mpsc::Receiver<ObjectKey>>>,
    mut shutdown: Shutdown,
) {
    loop {
        let key = {
            let mut rx = ready.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.triggered() => break,
                key = rx.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            }
        };

        loop {
            if shutdown.is_triggered() {
                debug!(worker = id, key = %key, "Shutdown requested, leaving queued work");
                break;
            }

            let next = {
                let mut queues = queues.lock().unwrap_or_else(PoisonError::into_inner);
                match queues.get_mut(&key).and_then(VecDeque::pop_front) {
                    Some(item) => Some(item),
                    None => {
                        queues.remove(&key);
                        None
                    }
                }
            };
            let Some(item) = next else { break };

            let run = AssertUnwindSafe(handler.handle(&key, item, &shutdown)).catch_unwind();
            if run.await.is_err() {
                error!(worker = id, key = %key, "Reconciliation panicked");
            }
        }
    }
    debug!(worker = id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use tokio::{
        sync::Semaphore,
        time::{sleep, timeout},
    };

    use super::*;
    use crate::{
        cluster::fake::declaration,
        event::{ChangeType, Event},
    };

    struct Recorder {
        active: Mutex<HashSet<ObjectKey>>,
        overlapped: AtomicBool,
        gate: Semaphore,
        started: mpsc::UnboundedSender<(ObjectKey, String)>,
        done: mpsc::UnboundedSender<(ObjectKey, String)>,
    }

    #[async_trait]
    impl WorkHandler for Recorder {
        async fn handle(&self, key: &ObjectKey, item: WorkItem, _: &Shutdown) {
            let label = match &item {
                WorkItem::Declaration(e) => format!("{:?}:{}", e.change, e.object.spec.source_secret),
                WorkItem::Drift(_) => "drift".to_owned(),
                WorkItem::Resync => "resync".to_owned(),
            };
            if !self.active.lock().unwrap().insert(key.clone()) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let _ = self.started.send((key.clone(), label.clone()));
            self.gate.acquire().await.unwrap().forget();
            sleep(Duration::from_millis(5)).await;
            self.active.lock().unwrap().remove(key);
            let _ = self.done.send((key.clone(), label));
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        recorder: Arc<Recorder>,
        started: mpsc::UnboundedReceiver<(ObjectKey, String)>,
        done: mpsc::UnboundedReceiver<(ObjectKey, String)>,
        _trigger: ShutdownTrigger,
        _tasks: JoinSet<()>,
    }

    fn harness(workers: usize, permits: usize) -> Harness {
        let (started_tx, started) = mpsc::unbounded_channel();
        let (done_tx, done) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            active: Mutex::default(),
            overlapped: AtomicBool::new(false),
            gate: Semaphore::new(permits),
            started: started_tx,
            done: done_tx,
        });
        let (trigger, shutdown) = shutdown_channel();
        let (dispatcher, tasks) = Dispatcher::start(recorder.clone(), workers, 16, shutdown);
        Harness {
            dispatcher,
            recorder,
            started,
            done,
            _trigger: trigger,
            _tasks: tasks,
        }
    }

    fn deleted(marker: &str) -> WorkItem {
        WorkItem::Declaration(Event::new(
            ChangeType::Deleted,
            declaration("ns1", "creds-sync", marker, &[]),
        ))
    }

    fn modified(marker: &str) -> WorkItem {
        WorkItem::Declaration(Event::new(
            ChangeType::Modified,
            declaration("ns1", "creds-sync", marker, &[]),
        ))
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<(ObjectKey, String)>, n: usize) -> Vec<(ObjectKey, String)> {
        let mut out = Vec::new();
        for _ in 0..n {
            let item = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for work")
                .expect("channel closed");
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn same_key_runs_in_order_without_overlap() {
        let mut h = harness(4, 100);
        let key = ObjectKey::new("ns1", "creds-sync");

        for marker in ["one", "two", "three"] {
            h.dispatcher.submit(key.clone(), deleted(marker)).await.unwrap();
        }

        let done = collect(&mut h.done, 3).await;
        let order: Vec<_> = done.into_iter().map(|(_, label)| label).collect();
        assert_eq!(order, vec!["Deleted:one", "Deleted:two", "Deleted:three"]);
        assert!(!h.recorder.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn distinct_keys_run_in_parallel() {
        let mut h = harness(2, 0);
        let a = ObjectKey::new("ns1", "a");
        let b = ObjectKey::new("ns1", "b");

        h.dispatcher.submit(a.clone(), deleted("a")).await.unwrap();
        h.dispatcher.submit(b.clone(), deleted("b")).await.unwrap();

        // Both start while the gate is still closed.
        let started: HashSet<_> = collect(&mut h.started, 2).await.into_iter().map(|(k, _)| k).collect();
        assert_eq!(started, HashSet::from([a, b]));

        h.recorder.gate.add_permits(2);
        collect(&mut h.done, 2).await;
    }

    #[tokio::test]
    async fn pending_applies_are_coalesced() {
        let mut h = harness(1, 0);
        let key = ObjectKey::new("ns1", "creds-sync");

        h.dispatcher.submit(key.clone(), modified("first")).await.unwrap();
        collect(&mut h.started, 1).await;

        for marker in ["second", "third", "fourth"] {
            h.dispatcher.submit(key.clone(), modified(marker)).await.unwrap();
        }
        assert_eq!(h.dispatcher.pending(), 1);

        h.recorder.gate.add_permits(10);
        let done = collect(&mut h.done, 2).await;
        assert_eq!(done[1].1, "Modified:fourth");
    }

    #[tokio::test]
    async fn cleanup_is_not_coalesced_away_by_recreation() {
        let mut h = harness(1, 0);
        let key = ObjectKey::new("ns1", "creds-sync");

        h.dispatcher.submit(key.clone(), modified("first")).await.unwrap();
        collect(&mut h.started, 1).await;

        h.dispatcher.submit(key.clone(), deleted("gone")).await.unwrap();
        h.dispatcher.submit(key.clone(), modified("again")).await.unwrap();
        assert_eq!(h.dispatcher.pending(), 2);

        h.recorder.gate.add_permits(10);
        let done = collect(&mut h.done, 3).await;
        let order: Vec<_> = done.into_iter().map(|(_, label)| label).collect();
        assert_eq!(order, vec!["Modified:first", "Deleted:gone", "Modified:again"]);
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let (trigger, shutdown) = shutdown_channel();
        let (started, _rx) = mpsc::unbounded_channel();
        let (done, _done_rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            active: Mutex::default(),
            overlapped: AtomicBool::new(false),
            gate: Semaphore::new(10),
            started,
            done,
        });
        let (_dispatcher, mut tasks) = Dispatcher::start(recorder, 3, 4, shutdown);

        trigger.trigger();
        timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .expect("workers did not stop");
    }
}
