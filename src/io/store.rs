//! Remote document store interface
//!
//! The store owns every entity. Readers either watch a collection (push-based
//! change feed) or do point reads; writers use point puts, field-level
//! batches, or a compare-and-swap write on a versioned vehicle document.

use crate::domain::error::StoreError;
use crate::domain::snapshot::Snapshot;
use crate::domain::types::{
    CollectionKind, Guardian, GuardianId, Operator, OperatorId, OperatorRef, PositionFix,
    Vehicle, VehicleId,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Document plus the version it was read at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Item delivered on a change feed
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Full contents of the collection after a commit
    Snapshot(Snapshot),
    /// The feed failed; no further events follow
    Error(String),
}

/// Change feed for one collection; the first event is the current snapshot
pub type ChangeFeed = mpsc::UnboundedReceiver<FeedEvent>;

/// Field-level write applied as part of a batch
///
/// The `Set*` variants patch a single field and leave the rest of the
/// document alone, so they never clobber concurrent stop edits.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchWrite {
    PutVehicle(Vehicle),
    PutOperator(Operator),
    PutGuardian(Guardian),
    DeleteOperator(OperatorId),
    DeleteGuardian(GuardianId),
    SetVehicleOperator { vehicle_id: VehicleId, operator: Option<OperatorRef> },
    SetOperatorVehicle { operator_id: OperatorId, vehicle_id: Option<VehicleId> },
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Open a change feed for one collection
    async fn watch(&self, kind: CollectionKind) -> Result<ChangeFeed, StoreError>;

    async fn read_vehicle(&self, id: &VehicleId) -> Result<Option<Versioned<Vehicle>>, StoreError>;

    /// Replace the vehicle only if it is still at `expected_version`
    ///
    /// Returns the new version. A stale version yields
    /// `StoreError::VersionMismatch` and nothing is written.
    async fn write_vehicle_if(
        &self,
        vehicle: Vehicle,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Create a vehicle; fails with `AlreadyExists` on an id clash
    async fn create_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError>;

    async fn list_vehicles(&self) -> Result<Vec<Vehicle>, StoreError>;

    async fn read_operator(&self, id: &OperatorId) -> Result<Option<Operator>, StoreError>;

    async fn put_operator(&self, operator: Operator) -> Result<(), StoreError>;

    async fn delete_operator(&self, id: &OperatorId) -> Result<(), StoreError>;

    async fn read_guardian(&self, id: &GuardianId) -> Result<Option<Guardian>, StoreError>;

    async fn put_guardian(&self, guardian: Guardian) -> Result<(), StoreError>;

    async fn delete_guardian(&self, id: &GuardianId) -> Result<(), StoreError>;

    /// Apply several writes in one round trip
    ///
    /// Not a multi-document transaction: readers may observe a partial batch.
    async fn commit_batch(&self, writes: Vec<BatchWrite>) -> Result<(), StoreError>;

    /// Overwrite the single live-position slot of a vehicle
    async fn put_position(&self, fix: PositionFix) -> Result<(), StoreError>;

    async fn read_positions(&self) -> Result<Vec<PositionFix>, StoreError>;
}
