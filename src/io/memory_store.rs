//! In-process `RemoteStore`
//!
//! Backs the CLI (loaded from and saved to a JSON snapshot file) and every
//! test. Watchers are fed under the state lock, so each collection's feed
//! sees commits in exactly the order they were applied.

use crate::domain::error::StoreError;
use crate::domain::snapshot::Snapshot;
use crate::domain::types::{
    CollectionKind, Guardian, GuardianId, Operator, OperatorId, PositionFix, Vehicle, VehicleId,
};
use crate::io::store::{BatchWrite, ChangeFeed, FeedEvent, RemoteStore, Versioned};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// On-disk form of the whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub vehicles: Vec<Vehicle>,
    #[serde(default)]
    pub operators: Vec<Operator>,
    #[serde(default)]
    pub guardians: Vec<Guardian>,
    #[serde(default)]
    pub positions: Vec<PositionFix>,
}

#[derive(Debug, Clone)]
struct Doc<T> {
    value: T,
    version: u64,
}

impl<T> Doc<T> {
    fn new(value: T) -> Self {
        Self { value, version: 1 }
    }

    fn replace(&mut self, value: T) {
        self.value = value;
        self.version += 1;
    }
}

#[derive(Default)]
struct State {
    vehicles: BTreeMap<VehicleId, Doc<Vehicle>>,
    operators: BTreeMap<OperatorId, Doc<Operator>>,
    guardians: BTreeMap<GuardianId, Doc<Guardian>>,
    positions: BTreeMap<VehicleId, PositionFix>,
    watchers: [Vec<mpsc::UnboundedSender<FeedEvent>>; 3],
    unavailable: Option<String>,
    /// Pending simulated competing writes per vehicle
    forced_conflicts: FxHashMap<VehicleId, u32>,
}

impl State {
    fn snapshot(&self, kind: CollectionKind) -> Snapshot {
        match kind {
            CollectionKind::Vehicles => {
                Snapshot::from(self.vehicles.values().map(|d| d.value.clone()).collect::<Vec<_>>())
            }
            CollectionKind::Operators => Snapshot::from(
                self.operators.values().map(|d| d.value.clone()).collect::<Vec<_>>(),
            ),
            CollectionKind::Guardians => Snapshot::from(
                self.guardians.values().map(|d| d.value.clone()).collect::<Vec<_>>(),
            ),
        }
    }

    /// Push the current snapshot to every live watcher of `kind`
    fn broadcast(&mut self, kind: CollectionKind) {
        if self.watchers[kind.index()].is_empty() {
            return;
        }
        let snapshot = self.snapshot(kind);
        self.watchers[kind.index()]
            .retain(|tx| tx.send(FeedEvent::Snapshot(snapshot.clone())).is_ok());
    }

    fn check_available(&self) -> Result<(), StoreError> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn apply(&mut self, write: BatchWrite, touched: &mut [bool; 3]) {
        match write {
            BatchWrite::PutVehicle(vehicle) => {
                upsert(&mut self.vehicles, vehicle.id.clone(), vehicle);
                touched[CollectionKind::Vehicles.index()] = true;
            }
            BatchWrite::PutOperator(operator) => {
                upsert(&mut self.operators, operator.id.clone(), operator);
                touched[CollectionKind::Operators.index()] = true;
            }
            BatchWrite::PutGuardian(guardian) => {
                upsert(&mut self.guardians, guardian.id.clone(), guardian);
                touched[CollectionKind::Guardians.index()] = true;
            }
            BatchWrite::DeleteOperator(id) => {
                self.operators.remove(&id);
                touched[CollectionKind::Operators.index()] = true;
            }
            BatchWrite::DeleteGuardian(id) => {
                self.guardians.remove(&id);
                touched[CollectionKind::Guardians.index()] = true;
            }
            BatchWrite::SetVehicleOperator { vehicle_id, operator } => {
                if let Some(doc) = self.vehicles.get_mut(&vehicle_id) {
                    let mut vehicle = doc.value.clone();
                    vehicle.operator = operator;
                    doc.replace(vehicle);
                    touched[CollectionKind::Vehicles.index()] = true;
                }
            }
            BatchWrite::SetOperatorVehicle { operator_id, vehicle_id } => {
                if let Some(doc) = self.operators.get_mut(&operator_id) {
                    let mut operator = doc.value.clone();
                    operator.assigned_vehicle = vehicle_id;
                    operator.updated_at = Some(chrono::Utc::now());
                    doc.replace(operator);
                    touched[CollectionKind::Operators.index()] = true;
                }
            }
        }
    }

    /// Field patches need their target document to exist
    fn check_target(&self, write: &BatchWrite) -> Result<(), StoreError> {
        match write {
            BatchWrite::SetVehicleOperator { vehicle_id, .. }
                if !self.vehicles.contains_key(vehicle_id) =>
            {
                Err(StoreError::Missing { collection: "vehicles", id: vehicle_id.to_string() })
            }
            BatchWrite::SetOperatorVehicle { operator_id, .. }
                if !self.operators.contains_key(operator_id) =>
            {
                Err(StoreError::Missing { collection: "operators", id: operator_id.to_string() })
            }
            _ => Ok(()),
        }
    }
}

fn upsert<K: Ord, T>(map: &mut BTreeMap<K, Doc<T>>, key: K, value: T) {
    match map.get_mut(&key) {
        Some(doc) => doc.replace(value),
        None => {
            map.insert(key, Doc::new(value));
        }
    }
}

/// Shared-state document store living in this process
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (exercises call timeouts)
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for v in snapshot.vehicles {
                state.vehicles.insert(v.id.clone(), Doc::new(v));
            }
            for o in snapshot.operators {
                state.operators.insert(o.id.clone(), Doc::new(o));
            }
            for g in snapshot.guardians {
                state.guardians.insert(g.id.clone(), Doc::new(g));
            }
            for p in snapshot.positions {
                state.positions.insert(p.vehicle_id.clone(), p);
            }
        }
        store
    }

    pub fn to_snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock();
        StoreSnapshot {
            vehicles: state.vehicles.values().map(|d| d.value.clone()).collect(),
            operators: state.operators.values().map(|d| d.value.clone()).collect(),
            guardians: state.guardians.values().map(|d| d.value.clone()).collect(),
            positions: state.positions.values().cloned().collect(),
        }
    }

    /// Load from a JSON snapshot; a missing file yields an empty store
    pub fn load_snapshot<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(file = %path.display(), "store_snapshot_missing_starting_empty");
            return Ok(Self::new());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read store snapshot {}", path.display()))?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse store snapshot {}", path.display()))?;
        info!(
            file = %path.display(),
            vehicles = %snapshot.vehicles.len(),
            operators = %snapshot.operators.len(),
            guardians = %snapshot.guardians.len(),
            "store_snapshot_loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(&self.to_snapshot())?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write store snapshot {}", path.display()))?;
        debug!(file = %path.display(), "store_snapshot_saved");
        Ok(())
    }

    /// Every login key already taken by an operator or guardian
    pub fn login_keys(&self) -> Vec<String> {
        let state = self.state.lock();
        state
            .operators
            .values()
            .map(|d| d.value.login_key.clone())
            .chain(state.guardians.values().map(|d| d.value.login_key.clone()))
            .filter(|k| !k.is_empty())
            .collect()
    }

    /// Make every call fail with `Unavailable` until cleared with `None`
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.state.lock().unavailable = reason.map(str::to_string);
    }

    /// Terminate every open feed of `kind` with an error event
    pub fn fail_stream(&self, kind: CollectionKind, message: &str) {
        let mut state = self.state.lock();
        for tx in state.watchers[kind.index()].drain(..) {
            let _ = tx.send(FeedEvent::Error(message.to_string()));
        }
    }

    /// Close every open feed of `kind` without an error event
    pub fn disconnect(&self, kind: CollectionKind) {
        self.state.lock().watchers[kind.index()].clear();
    }

    pub fn watcher_count(&self, kind: CollectionKind) -> usize {
        self.state.lock().watchers[kind.index()].iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Simulate `n` competing writers committing to `vehicle_id` first
    ///
    /// Each of the next `n` compare-and-swap writes bumps the stored version
    /// and fails with a version mismatch.
    pub fn inject_conflicts(&self, vehicle_id: &VehicleId, n: u32) {
        self.state.lock().forced_conflicts.insert(vehicle_id.clone(), n);
    }

    pub fn vehicle_version(&self, vehicle_id: &VehicleId) -> Option<u64> {
        self.state.lock().vehicles.get(vehicle_id).map(|d| d.version)
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn watch(&self, kind: CollectionKind) -> Result<ChangeFeed, StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        // Initial snapshot goes out before any later commit can be sent
        let _ = tx.send(FeedEvent::Snapshot(state.snapshot(kind)));
        state.watchers[kind.index()].push(tx);
        debug!(kind = %kind, "store_watch_opened");
        Ok(rx)
    }

    async fn read_vehicle(&self, id: &VehicleId) -> Result<Option<Versioned<Vehicle>>, StoreError> {
        self.delay().await;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state
            .vehicles
            .get(id)
            .map(|d| Versioned { value: d.value.clone(), version: d.version }))
    }

    async fn write_vehicle_if(
        &self,
        vehicle: Vehicle,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;

        let forced = match state.forced_conflicts.get_mut(&vehicle.id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };

        let id = vehicle.id.clone();
        let doc = state
            .vehicles
            .get_mut(&id)
            .ok_or_else(|| StoreError::Missing { collection: "vehicles", id: id.to_string() })?;

        if forced {
            doc.version += 1;
        }
        if doc.version != expected_version {
            return Err(StoreError::VersionMismatch {
                collection: "vehicles",
                id: id.to_string(),
                expected: expected_version,
                actual: doc.version,
            });
        }

        doc.replace(vehicle);
        let version = doc.version;
        state.broadcast(CollectionKind::Vehicles);
        Ok(version)
    }

    async fn create_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;
        if state.vehicles.contains_key(&vehicle.id) {
            return Err(StoreError::AlreadyExists {
                collection: "vehicles",
                id: vehicle.id.to_string(),
            });
        }
        state.vehicles.insert(vehicle.id.clone(), Doc::new(vehicle));
        state.broadcast(CollectionKind::Vehicles);
        Ok(())
    }

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>, StoreError> {
        self.delay().await;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.vehicles.values().map(|d| d.value.clone()).collect())
    }

    async fn read_operator(&self, id: &OperatorId) -> Result<Option<Operator>, StoreError> {
        self.delay().await;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.operators.get(id).map(|d| d.value.clone()))
    }

    async fn put_operator(&self, operator: Operator) -> Result<(), StoreError> {
        self.commit_batch(vec![BatchWrite::PutOperator(operator)]).await
    }

    async fn delete_operator(&self, id: &OperatorId) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;
        if state.operators.remove(id).is_none() {
            return Err(StoreError::Missing { collection: "operators", id: id.to_string() });
        }
        state.broadcast(CollectionKind::Operators);
        Ok(())
    }

    async fn read_guardian(&self, id: &GuardianId) -> Result<Option<Guardian>, StoreError> {
        self.delay().await;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.guardians.get(id).map(|d| d.value.clone()))
    }

    async fn put_guardian(&self, guardian: Guardian) -> Result<(), StoreError> {
        self.commit_batch(vec![BatchWrite::PutGuardian(guardian)]).await
    }

    async fn delete_guardian(&self, id: &GuardianId) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;
        if state.guardians.remove(id).is_none() {
            return Err(StoreError::Missing { collection: "guardians", id: id.to_string() });
        }
        state.broadcast(CollectionKind::Guardians);
        Ok(())
    }

    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;
        for write in &writes {
            state.check_target(write)?;
        }

        let mut touched = [false; 3];
        let count = writes.len();
        for write in writes {
            state.apply(write, &mut touched);
        }
        for kind in CollectionKind::ALL {
            if touched[kind.index()] {
                state.broadcast(kind);
            }
        }
        debug!(writes = %count, "store_batch_committed");
        Ok(())
    }

    async fn put_position(&self, fix: PositionFix) -> Result<(), StoreError> {
        self.delay().await;
        let mut state = self.state.lock();
        state.check_available()?;
        state.positions.insert(fix.vehicle_id.clone(), fix);
        Ok(())
    }

    async fn read_positions(&self) -> Result<Vec<PositionFix>, StoreError> {
        self.delay().await;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.positions.values().cloned().collect())
    }
}
