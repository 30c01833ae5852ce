//! Integration tests for conflict-safe stop-list transactions

use fleet_admin::domain::stops::is_contiguous;
use fleet_admin::domain::types::{Vehicle, VehicleId};
use fleet_admin::domain::FleetError;
use fleet_admin::infra::Metrics;
use fleet_admin::io::{MemoryAuditSink, MemoryStore, RemoteStore};
use fleet_admin::services::{MutationSettings, NewStop, StopListMutator};
use std::sync::Arc;
use std::time::Duration;

fn settings(max_attempts: u32) -> MutationSettings {
    MutationSettings {
        max_attempts,
        retry_backoff: Duration::from_millis(2),
        txn_timeout: Duration::from_secs(1),
    }
}

async fn setup(latency_ms: u64, max_attempts: u32) -> (Arc<MemoryStore>, Arc<StopListMutator>) {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(latency_ms)));
    store.create_vehicle(Vehicle::new(VehicleId::from("bus_1"), "B1", "North")).await.unwrap();
    let mutator = Arc::new(StopListMutator::new(
        store.clone(),
        Arc::new(MemoryAuditSink::new()),
        Arc::new(Metrics::new()),
        settings(max_attempts),
    ));
    (store, mutator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inserts_all_land_with_contiguous_orders() {
    // Store latency widens the read-to-write window so the writers collide
    let (store, mutator) = setup(2, 20).await;
    let bus = VehicleId::from("bus_1");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let mutator = mutator.clone();
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            mutator.insert_stop(&bus, NewStop::new(format!("Stop {i}"), 11.0, 79.0), None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let stops = store.read_vehicle(&bus).await.unwrap().unwrap().value.stops;
    assert_eq!(stops.len(), 8);
    assert!(is_contiguous(&stops));
    let mut names: Vec<&str> = stops.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_concurrent_inserts_get_distinct_orders() {
    let (store, mutator) = setup(5, 5).await;
    let bus = VehicleId::from("bus_1");

    let (a, b) = tokio::join!(
        mutator.insert_stop(&bus, NewStop::new("Gate", 11.0, 79.0), None),
        mutator.insert_stop(&bus, NewStop::new("Market", 11.1, 79.1), None),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a.order, b.order);

    let stops = store.read_vehicle(&bus).await.unwrap().unwrap().value.stops;
    assert_eq!(stops.iter().map(|s| s.order).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn test_mixed_edit_sequence_keeps_orders_contiguous() {
    let (store, mutator) = setup(0, 3).await;
    let bus = VehicleId::from("bus_1");

    let mut ids = Vec::new();
    for (i, position) in [None, Some(1), Some(99), Some(-4), Some(2)].into_iter().enumerate() {
        let stop = mutator
            .insert_stop(&bus, NewStop::new(format!("S{i}"), 10.0, 70.0), position)
            .await
            .unwrap();
        ids.push(stop.id);
    }
    mutator.remove_stop(&bus, &ids[1]).await.unwrap();
    mutator.remove_stop(&bus, &ids[3]).await.unwrap();

    let stops = store.read_vehicle(&bus).await.unwrap().unwrap().value.stops;
    assert_eq!(stops.len(), 3);
    assert!(is_contiguous(&stops));

    let again = mutator.remove_stop(&bus, &ids[1]).await;
    assert!(matches!(again, Err(FleetError::NotFound { .. })));
}

#[tokio::test]
async fn test_exhausted_retries_surface_conflict() {
    let (store, mutator) = setup(0, 2).await;
    let bus = VehicleId::from("bus_1");
    store.inject_conflicts(&bus, 5);

    let result = mutator.insert_stop(&bus, NewStop::new("Gate", 11.0, 79.0), None).await;
    assert!(matches!(result, Err(FleetError::Conflict { attempts: 2, .. })));
}
