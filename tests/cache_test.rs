//! Integration tests for the change-stream cache over the in-memory store

use fleet_admin::domain::types::{CollectionKind, Vehicle, VehicleId};
use fleet_admin::domain::Snapshot;
use fleet_admin::infra::Metrics;
use fleet_admin::io::{MemoryAuditSink, MemoryStore, RemoteStore};
use fleet_admin::services::ChangeStreamCache;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const SYNC: Duration = Duration::from_secs(2);

struct Harness {
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditSink>,
    metrics: Arc<Metrics>,
    cache: ChangeStreamCache,
}

async fn harness(vehicles: &[&str]) -> Harness {
    let store = Arc::new(MemoryStore::new());
    for number in vehicles {
        let id = VehicleId::new(format!("bus_{number}"));
        store.create_vehicle(Vehicle::new(id, *number, "")).await.unwrap();
    }
    let audit = Arc::new(MemoryAuditSink::new());
    let metrics = Arc::new(Metrics::new());
    let cache = ChangeStreamCache::new(
        store.clone(),
        audit.clone(),
        metrics.clone(),
        Duration::from_millis(20),
    );
    Harness { store, audit, metrics, cache }
}

/// Poll `check` until it holds or two seconds pass
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn recorder() -> (Arc<Mutex<Vec<usize>>>, impl Fn(&Snapshot) + Send + Sync) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    (seen, move |snap: &Snapshot| seen_in.lock().push(snap.len()))
}

#[tokio::test]
async fn test_subscribe_replays_current_snapshot_once() {
    let h = harness(&["B1"]).await;
    h.cache.init();
    assert!(h.cache.wait_synced(CollectionKind::Vehicles, SYNC).await);

    let (seen, observer) = recorder();
    let handle = h.cache.subscribe(CollectionKind::Vehicles, observer);
    assert_eq!(*seen.lock(), vec![1]);

    handle.unsubscribe();
    h.cache.shutdown().await;
}

#[tokio::test]
async fn test_remote_update_reaches_observer() {
    let h = harness(&["B1"]).await;
    h.cache.init();
    assert!(h.cache.wait_synced(CollectionKind::Vehicles, SYNC).await);

    let (seen, observer) = recorder();
    let handle = h.cache.subscribe(CollectionKind::Vehicles, observer);

    h.store.create_vehicle(Vehicle::new(VehicleId::from("bus_B2"), "B2", "")).await.unwrap();

    assert!(eventually(|| seen.lock().last() == Some(&2)).await);
    assert_eq!(h.cache.vehicles().len(), 2);
    assert!(h.cache.find_vehicle(&VehicleId::from("bus_B2")).is_some());

    handle.unsubscribe();
    h.cache.shutdown().await;
}

#[tokio::test]
async fn test_stream_error_keeps_snapshot_and_reconnects() {
    let h = harness(&["B1"]).await;
    h.cache.init();
    assert!(h.cache.wait_synced(CollectionKind::Vehicles, SYNC).await);

    let (seen, observer) = recorder();
    let handle = h.cache.subscribe(CollectionKind::Vehicles, observer);

    h.store.fail_stream(CollectionKind::Vehicles, "permission denied");

    assert!(eventually(|| h.audit.count_from("cache") >= 1).await);
    assert_eq!(h.cache.vehicles().len(), 1);
    assert!(h.metrics.stream_errors_total() >= 1);

    // After the reconnect delay the feed is live again
    assert!(eventually(|| h.store.watcher_count(CollectionKind::Vehicles) == 1).await);
    h.store.create_vehicle(Vehicle::new(VehicleId::from("bus_B2"), "B2", "")).await.unwrap();
    assert!(eventually(|| h.cache.vehicles().len() == 2).await);
    assert_eq!(seen.lock().last(), Some(&2));

    handle.unsubscribe();
    h.cache.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_keeps_snapshot_and_reconnects() {
    let h = harness(&["B1"]).await;
    h.cache.init();
    assert!(h.cache.wait_synced(CollectionKind::Vehicles, SYNC).await);

    let (seen, observer) = recorder();
    let handle = h.cache.subscribe(CollectionKind::Vehicles, observer);

    h.store.disconnect(CollectionKind::Vehicles);

    assert!(eventually(|| h.audit.count_from("cache") == 1).await);
    assert_eq!(h.cache.vehicles().len(), 1);

    assert!(eventually(|| h.store.watcher_count(CollectionKind::Vehicles) == 1).await);
    h.store.create_vehicle(Vehicle::new(VehicleId::from("bus_B2"), "B2", "")).await.unwrap();
    assert!(eventually(|| h.cache.vehicles().len() == 2).await);
    assert_eq!(seen.lock().last(), Some(&2));
    assert_eq!(h.audit.count_from("cache"), 1);

    handle.unsubscribe();
    h.cache.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribed_observer_gets_nothing_more() {
    let h = harness(&[]).await;
    h.cache.init();
    assert!(h.cache.wait_synced(CollectionKind::Vehicles, SYNC).await);

    let (seen, observer) = recorder();
    let handle = h.cache.subscribe(CollectionKind::Vehicles, observer);
    let (other_seen, other) = recorder();
    let other_handle = h.cache.subscribe(CollectionKind::Vehicles, other);

    handle.unsubscribe();
    handle.unsubscribe();
    assert_eq!(h.cache.observer_count(CollectionKind::Vehicles), 1);

    h.store.create_vehicle(Vehicle::new(VehicleId::from("bus_B1"), "B1", "")).await.unwrap();
    assert!(eventually(|| other_seen.lock().last() == Some(&1)).await);
    assert_eq!(*seen.lock(), vec![0]);

    other_handle.unsubscribe();
    h.cache.shutdown().await;
}

#[tokio::test]
async fn test_snapshots_readable_after_shutdown() {
    let h = harness(&["B1", "B2"]).await;
    h.cache.init();
    assert!(h.cache.wait_synced(CollectionKind::Vehicles, SYNC).await);
    h.cache.shutdown().await;

    assert_eq!(h.cache.vehicles().len(), 2);
    assert!(eventually(|| h.store.watcher_count(CollectionKind::Vehicles) == 0).await);
}
