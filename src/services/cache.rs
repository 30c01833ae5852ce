//! Change-stream cache
//!
//! Mirrors the vehicles, operators and guardians collections in memory and
//! fans every remote update out to local observers.
//!
//! One task per collection reads that collection's change feed. All state
//! sits behind a single `parking_lot::Mutex` that is held while a snapshot is
//! swapped in *and* while observers run, so:
//! - a new observer is replayed the current snapshot before any later update,
//! - per-collection updates reach observers in remote commit order,
//! - no observer ever sees a half-applied snapshot.
//!
//! Observers must return quickly and must not call back into the cache.

use crate::domain::error::ErrorKind;
use crate::domain::snapshot::Snapshot;
use crate::domain::types::{CollectionKind, Guardian, Operator, Vehicle, VehicleId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::store::{FeedEvent, RemoteStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked with each new snapshot of one collection
pub type Observer = Arc<dyn Fn(&Snapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    ShutDown,
}

struct Bucket {
    snapshot: Snapshot,
    observers: BTreeMap<u64, Observer>,
}

struct Shared {
    buckets: Mutex<[Bucket; 3]>,
    next_subscriber: AtomicU64,
    /// Flips to true once the first remote snapshot of a kind is applied
    synced: [watch::Sender<bool>; 3],
    metrics: Arc<Metrics>,
}

impl Shared {
    fn new(metrics: Arc<Metrics>) -> Self {
        let buckets = CollectionKind::ALL
            .map(|kind| Bucket { snapshot: Snapshot::empty(kind), observers: BTreeMap::new() });
        Self {
            buckets: Mutex::new(buckets),
            next_subscriber: AtomicU64::new(1),
            synced: std::array::from_fn(|_| watch::channel(false).0),
            metrics,
        }
    }

    /// Swap in a new snapshot and notify every observer of that kind
    fn apply(&self, kind: CollectionKind, snapshot: Snapshot) {
        if snapshot.kind() != kind {
            warn!(expected = %kind, got = %snapshot.kind(), "cache_snapshot_kind_mismatch");
            return;
        }

        let notified = {
            let mut buckets = self.buckets.lock();
            let bucket = &mut buckets[kind.index()];
            bucket.snapshot = snapshot;
            for (&id, observer) in &bucket.observers {
                self.invoke(kind, id, observer, &bucket.snapshot);
            }
            debug!(
                kind = %kind,
                entities = %bucket.snapshot.len(),
                observers = %bucket.observers.len(),
                "cache_updated"
            );
            bucket.observers.len() as u64
        };

        self.synced[kind.index()].send_replace(true);
        self.metrics.record_cache_update(notified);
    }

    fn invoke(&self, kind: CollectionKind, id: u64, observer: &Observer, snapshot: &Snapshot) {
        if catch_unwind(AssertUnwindSafe(|| observer(snapshot))).is_err() {
            self.metrics.record_observer_panic();
            error!(kind = %kind, subscriber = %id, "cache_observer_panicked");
        }
    }
}

/// Registration returned by [`ChangeStreamCache::subscribe`]
///
/// Dropping the handle leaves the observer registered; call `unsubscribe`.
#[must_use = "the observer stays registered until unsubscribe() is called"]
pub struct SubscriptionHandle {
    shared: Weak<Shared>,
    kind: CollectionKind,
    id: u64,
    active: AtomicBool,
}

impl SubscriptionHandle {
    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove the observer; later calls (or calls after the cache is gone) do nothing
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.buckets.lock()[self.kind.index()].observers.remove(&self.id);
            debug!(kind = %self.kind, subscriber = %self.id, "cache_unsubscribed");
        }
    }
}

pub struct ChangeStreamCache {
    shared: Arc<Shared>,
    store: Arc<dyn RemoteStore>,
    audit: Arc<dyn AuditSink>,
    reconnect_delay: Duration,
    lifecycle: Mutex<Lifecycle>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeStreamCache {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<Metrics>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared::new(metrics)),
            store,
            audit,
            reconnect_delay,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            shutdown_tx: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(
        store: Arc<dyn RemoteStore>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        Self::new(store, audit, metrics, config.cache_reconnect_delay())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// Start one feed task per collection
    ///
    /// Only the first call on an uninitialized cache does anything; must be
    /// called from within a tokio runtime.
    pub fn init(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle != Lifecycle::Uninitialized {
            debug!(state = ?*lifecycle, "cache_init_ignored");
            return;
        }
        *lifecycle = Lifecycle::Active;

        let mut tasks = self.tasks.lock();
        for kind in CollectionKind::ALL {
            let feed = FeedTask {
                kind,
                store: self.store.clone(),
                shared: self.shared.clone(),
                audit: self.audit.clone(),
                reconnect_delay: self.reconnect_delay,
            };
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(feed.run(shutdown)));
        }
        info!("cache_initialized");
    }

    /// Stop every feed task and wait for them to exit; snapshots stay readable
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::ShutDown {
                return;
            }
            *lifecycle = Lifecycle::ShutDown;
        }
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "cache_feed_task_join_failed");
            }
        }
        info!("cache_shutdown");
    }

    /// Register `observer` for `kind`, replaying the current snapshot to it first
    pub fn subscribe<F>(&self, kind: CollectionKind, observer: F) -> SubscriptionHandle
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let observer: Observer = Arc::new(observer);

        {
            let mut buckets = self.shared.buckets.lock();
            let bucket = &mut buckets[kind.index()];
            self.shared.invoke(kind, id, &observer, &bucket.snapshot);
            bucket.observers.insert(id, observer);
        }
        self.shared.metrics.record_observer_notified();
        debug!(kind = %kind, subscriber = %id, "cache_subscribed");

        SubscriptionHandle {
            shared: Arc::downgrade(&self.shared),
            kind,
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn observer_count(&self, kind: CollectionKind) -> usize {
        self.shared.buckets.lock()[kind.index()].observers.len()
    }

    /// Latest known snapshot of `kind`
    pub fn get(&self, kind: CollectionKind) -> Snapshot {
        self.shared.buckets.lock()[kind.index()].snapshot.clone()
    }

    pub fn vehicles(&self) -> Arc<[Vehicle]> {
        match self.get(CollectionKind::Vehicles) {
            Snapshot::Vehicles(v) => v,
            _ => Arc::from(Vec::new()),
        }
    }

    pub fn operators(&self) -> Arc<[Operator]> {
        match self.get(CollectionKind::Operators) {
            Snapshot::Operators(o) => o,
            _ => Arc::from(Vec::new()),
        }
    }

    pub fn guardians(&self) -> Arc<[Guardian]> {
        match self.get(CollectionKind::Guardians) {
            Snapshot::Guardians(g) => g,
            _ => Arc::from(Vec::new()),
        }
    }

    pub fn find_vehicle(&self, id: &VehicleId) -> Option<Vehicle> {
        self.vehicles().iter().find(|v| &v.id == id).cloned()
    }

    /// Whether a remote snapshot of `kind` has been applied yet
    pub fn is_synced(&self, kind: CollectionKind) -> bool {
        *self.shared.synced[kind.index()].borrow()
    }

    /// Wait until `kind` is synced; false on timeout
    pub async fn wait_synced(&self, kind: CollectionKind, timeout: Duration) -> bool {
        let mut rx = self.shared.synced[kind.index()].subscribe();
        let synced =
            matches!(tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await, Ok(Ok(_)));
        synced
    }
}

/// Per-collection feed reader with reconnect
struct FeedTask {
    kind: CollectionKind,
    store: Arc<dyn RemoteStore>,
    shared: Arc<Shared>,
    audit: Arc<dyn AuditSink>,
    reconnect_delay: Duration,
}

impl FeedTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let kind = self.kind;
        info!(kind = %kind, "cache_feed_started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let opened = tokio::select! {
                result = self.store.watch(kind) => result,
                _ = shutdown.changed() => break,
            };

            match opened {
                Ok(mut feed) => {
                    debug!(kind = %kind, "cache_feed_connected");
                    loop {
                        tokio::select! {
                            event = feed.recv() => match event {
                                Some(FeedEvent::Snapshot(snapshot)) => {
                                    self.shared.apply(kind, snapshot)
                                }
                                Some(FeedEvent::Error(message)) => {
                                    self.report(&message);
                                    break;
                                }
                                None => {
                                    self.report("change feed closed");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => {
                                info!(kind = %kind, "cache_feed_shutdown");
                                return;
                            }
                        }
                    }
                }
                Err(e) => self.report(&e.to_string()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {
                    self.shared.metrics.record_reconnect();
                    info!(kind = %kind, "cache_feed_reconnecting");
                }
                _ = shutdown.changed() => break,
            }
        }

        info!(kind = %kind, "cache_feed_shutdown");
    }

    /// Last good snapshot is kept and observers are not notified
    fn report(&self, message: &str) {
        self.shared.metrics.record_stream_error();
        warn!(kind = %self.kind, error = %message, "cache_feed_error");
        self.audit.record(AuditEvent::error(
            "cache",
            ErrorKind::StoreError,
            self.kind.as_str(),
            message,
        ));
    }
}
