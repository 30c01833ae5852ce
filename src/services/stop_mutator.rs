//! Conflict-safe edits to a vehicle's ordered stop list
//!
//! Each operation is one optimistic transaction: read the vehicle with its
//! version, apply a pure edit from `domain::stops`, write back with
//! compare-and-swap. A version mismatch means another editor committed first;
//! the transaction is retried from a fresh read with linear backoff until
//! `max_attempts` is reached, then surfaces `FleetError::Conflict`.
//!
//! Writes land in the store only. The cache observes them later through its
//! change feed.

use crate::domain::error::{FleetError, FleetResult, StoreError};
use crate::domain::stops::{apply_edit, StopEdit};
use crate::domain::types::{generate_id, GeoPoint, Stop, StopId, VehicleId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::store::{RemoteStore, Versioned};
use crate::services::bounded;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const AUDIT_SOURCE: &str = "mutator";

/// Retry and timeout policy for store transactions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutationSettings {
    pub max_attempts: u32,
    /// Retry n sleeps `retry_backoff * n`
    pub retry_backoff: Duration,
    /// Bound on every individual store call
    pub txn_timeout: Duration,
}

impl From<&Config> for MutationSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.mutation_max_attempts(),
            retry_backoff: config.mutation_retry_backoff(),
            txn_timeout: config.mutation_txn_timeout(),
        }
    }
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Stop to be inserted; the id is generated on insert
#[derive(Debug, Clone, PartialEq)]
pub struct NewStop {
    pub name: String,
    pub location: GeoPoint,
}

impl NewStop {
    pub fn new(name: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self { name: name.into(), location: GeoPoint::new(lat, lng) }
    }
}

pub struct StopListMutator {
    store: Arc<dyn RemoteStore>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
    settings: MutationSettings,
}

impl StopListMutator {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<Metrics>,
        settings: MutationSettings,
    ) -> Self {
        Self { store, audit, metrics, settings }
    }

    /// Insert at the 1-based `position` (clamped into range), or append
    pub async fn insert_stop(
        &self,
        vehicle_id: &VehicleId,
        stop: NewStop,
        position: Option<i64>,
    ) -> FleetResult<Stop> {
        let new_stop = Stop {
            id: StopId::new(generate_id("stop")),
            name: stop.name,
            location: stop.location,
            order: 0,
        };
        let stop_id = new_stop.id.clone();
        let edit = StopEdit::Insert { stop: new_stop, position };

        let stops = self.transact("insert_stop", vehicle_id, &edit).await?;
        let stored = stops
            .into_iter()
            .find(|s| s.id == stop_id)
            .ok_or_else(|| FleetError::not_found("stop", &stop_id))?;
        info!(
            vehicle_id = %vehicle_id,
            stop_id = %stored.id,
            order = %stored.order,
            "stop_inserted"
        );
        Ok(stored)
    }

    /// Remove a stop; the rest are renumbered keeping their relative order
    pub async fn remove_stop(&self, vehicle_id: &VehicleId, stop_id: &StopId) -> FleetResult<()> {
        let edit = StopEdit::Remove { stop_id: stop_id.clone() };
        let stops = self.transact("remove_stop", vehicle_id, &edit).await?;
        info!(
            vehicle_id = %vehicle_id,
            stop_id = %stop_id,
            remaining = %stops.len(),
            "stop_removed"
        );
        Ok(())
    }

    /// Rename a stop; order is untouched
    pub async fn rename_stop(
        &self,
        vehicle_id: &VehicleId,
        stop_id: &StopId,
        name: &str,
    ) -> FleetResult<Stop> {
        let edit = StopEdit::Rename { stop_id: stop_id.clone(), name: name.to_string() };
        let stops = self.transact("rename_stop", vehicle_id, &edit).await?;
        let stored = stops
            .into_iter()
            .find(|s| &s.id == stop_id)
            .ok_or_else(|| FleetError::not_found("stop", stop_id))?;
        info!(vehicle_id = %vehicle_id, stop_id = %stop_id, name = %stored.name, "stop_renamed");
        Ok(stored)
    }

    async fn transact(
        &self,
        operation: &'static str,
        vehicle_id: &VehicleId,
        edit: &StopEdit,
    ) -> FleetResult<Vec<Stop>> {
        let started = Instant::now();
        let result = self.attempt_loop(operation, vehicle_id, edit).await;

        match &result {
            Ok(_) => self.metrics.record_mutation_commit(started.elapsed().as_micros() as u64),
            Err(err) => {
                if matches!(err, FleetError::Conflict { .. }) {
                    self.metrics.record_conflict_exhausted();
                } else {
                    self.metrics.record_mutation_failure();
                }
                self.audit.record(AuditEvent::error(
                    AUDIT_SOURCE,
                    err.kind(),
                    vehicle_id.as_str(),
                    format!("{operation}: {err}"),
                ));
            }
        }
        result
    }

    async fn attempt_loop(
        &self,
        operation: &'static str,
        vehicle_id: &VehicleId,
        edit: &StopEdit,
    ) -> FleetResult<Vec<Stop>> {
        let max_attempts = self.settings.max_attempts.max(1);
        let timeout = self.settings.txn_timeout;

        for attempt in 1..=max_attempts {
            let Versioned { value: mut vehicle, version } =
                bounded(operation, timeout, self.store.read_vehicle(vehicle_id))
                    .await??
                    .ok_or_else(|| FleetError::not_found("vehicle", vehicle_id))?;

            let stops = apply_edit(&vehicle.stops, edit)?;
            vehicle.stops = stops.clone();

            let written =
                bounded(operation, timeout, self.store.write_vehicle_if(vehicle, version)).await?;
            match written {
                Ok(new_version) => {
                    debug!(
                        vehicle_id = %vehicle_id,
                        operation = %operation,
                        attempt = %attempt,
                        version = %new_version,
                        "stop_list_committed"
                    );
                    return Ok(stops);
                }
                Err(StoreError::VersionMismatch { expected, actual, .. }) => {
                    self.metrics.record_conflict_retry();
                    debug!(
                        vehicle_id = %vehicle_id,
                        operation = %operation,
                        attempt = %attempt,
                        expected = %expected,
                        actual = %actual,
                        "stop_list_conflict"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                    }
                }
                Err(StoreError::Missing { .. }) => {
                    return Err(FleetError::not_found("vehicle", vehicle_id));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(FleetError::Conflict {
            entity: "vehicle",
            id: vehicle_id.to_string(),
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stops::is_contiguous;
    use crate::domain::types::Vehicle;
    use crate::io::audit::MemoryAuditSink;
    use crate::io::memory_store::MemoryStore;

    fn settings() -> MutationSettings {
        MutationSettings {
            max_attempts: 3,
            retry_backoff: Duration::from_millis(1),
            txn_timeout: Duration::from_millis(500),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<MemoryAuditSink>, StopListMutator) {
        let store = Arc::new(MemoryStore::new());
        store.create_vehicle(Vehicle::new(VehicleId::from("bus_1"), "B1", "North")).await.unwrap();
        let audit = Arc::new(MemoryAuditSink::new());
        let mutator = StopListMutator::new(
            store.clone(),
            audit.clone(),
            Arc::new(Metrics::new()),
            settings(),
        );
        (store, audit, mutator)
    }

    async fn stops_of(store: &MemoryStore) -> Vec<Stop> {
        store.read_vehicle(&VehicleId::from("bus_1")).await.unwrap().unwrap().value.stops
    }

    #[tokio::test]
    async fn test_insert_append_and_position() {
        let (store, _, mutator) = setup().await;
        let bus = VehicleId::from("bus_1");

        let a = mutator.insert_stop(&bus, NewStop::new("A", 11.0, 79.0), None).await.unwrap();
        let b = mutator.insert_stop(&bus, NewStop::new("B", 11.1, 79.1), None).await.unwrap();
        let c = mutator.insert_stop(&bus, NewStop::new("C", 11.2, 79.2), Some(1)).await.unwrap();
        assert_eq!(c.order, 1);

        let stops = stops_of(&store).await;
        let ids: Vec<&StopId> = stops.iter().map(|s| &s.id).collect();
        assert_eq!(ids, vec![&c.id, &a.id, &b.id]);
        assert!(is_contiguous(&stops));
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let (store, audit, mutator) = setup().await;
        let bus = VehicleId::from("bus_1");
        let a = mutator.insert_stop(&bus, NewStop::new("A", 11.0, 79.0), None).await.unwrap();
        mutator.insert_stop(&bus, NewStop::new("B", 11.1, 79.1), None).await.unwrap();

        mutator.remove_stop(&bus, &a.id).await.unwrap();
        let second = mutator.remove_stop(&bus, &a.id).await;
        assert!(matches!(second, Err(FleetError::NotFound { entity: "stop", .. })));

        let stops = stops_of(&store).await;
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].order, 1);
        assert_eq!(audit.count_from(AUDIT_SOURCE), 1);
    }

    #[tokio::test]
    async fn test_rename_and_validation() {
        let (_, _, mutator) = setup().await;
        let bus = VehicleId::from("bus_1");
        let a = mutator.insert_stop(&bus, NewStop::new("A", 11.0, 79.0), None).await.unwrap();

        let renamed = mutator.rename_stop(&bus, &a.id, "Main Gate").await.unwrap();
        assert_eq!(renamed.name, "Main Gate");
        assert_eq!(renamed.order, 1);

        assert!(matches!(
            mutator.rename_stop(&bus, &a.id, "  ").await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            mutator.insert_stop(&bus, NewStop::new("X", f64::NAN, 0.0), None).await,
            Err(FleetError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_vehicle() {
        let (_, _, mutator) = setup().await;
        let result =
            mutator.insert_stop(&VehicleId::from("nope"), NewStop::new("A", 1.0, 1.0), None).await;
        assert!(matches!(result, Err(FleetError::NotFound { entity: "vehicle", .. })));
    }

    #[tokio::test]
    async fn test_retries_through_conflicts() {
        let (store, _, mutator) = setup().await;
        let bus = VehicleId::from("bus_1");
        store.inject_conflicts(&bus, 2);

        let stop = mutator.insert_stop(&bus, NewStop::new("A", 11.0, 79.0), None).await.unwrap();
        assert_eq!(stop.order, 1);
        assert_eq!(mutator.metrics.conflict_retries_total(), 2);
    }

    #[tokio::test]
    async fn test_conflict_after_max_attempts() {
        let (store, audit, mutator) = setup().await;
        let bus = VehicleId::from("bus_1");
        store.inject_conflicts(&bus, 10);

        let result = mutator.insert_stop(&bus, NewStop::new("A", 11.0, 79.0), None).await;
        assert!(matches!(result, Err(FleetError::Conflict { attempts: 3, .. })));
        assert!(stops_of(&store).await.is_empty());
        assert_eq!(audit.events()[0].kind, Some(crate::domain::error::ErrorKind::ConflictError));
    }

    #[tokio::test]
    async fn test_store_call_timeout() {
        let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(200)));
        store.create_vehicle(Vehicle::new(VehicleId::from("bus_1"), "B1", "")).await.unwrap();
        let mutator = StopListMutator::new(
            store,
            Arc::new(MemoryAuditSink::new()),
            Arc::new(Metrics::new()),
            MutationSettings { txn_timeout: Duration::from_millis(20), ..settings() },
        );

        let result =
            mutator.insert_stop(&VehicleId::from("bus_1"), NewStop::new("A", 1.0, 1.0), None).await;
        assert!(matches!(result, Err(FleetError::Timeout { operation: "insert_stop", .. })));
    }
}
