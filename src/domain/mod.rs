//! Domain models - core business types for the fleet directory
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - Vehicle, Stop, Operator, Guardian and their identifiers
//! - `stops` - pure ordered stop-list edits (insert/remove/rename + renumber)
//! - `snapshot` - immutable per-collection snapshots delivered by the cache
//! - `records` - bulk-import rows, aliasing, and the import report
//! - `error` - error taxonomy shared by every service

pub mod error;
pub mod records;
pub mod snapshot;
pub mod stops;
pub mod types;

// Re-export commonly used types at module level
pub use error::{ErrorKind, FleetError, FleetResult, IdentityError, StoreError};
pub use records::{ImportFailure, ImportOutcome, ImportReport, RawRecord, Table};
pub use snapshot::Snapshot;
pub use stops::{StopEdit, StopEditError};
pub use types::{
    CollectionKind, GeoPoint, Guardian, GuardianId, Operator, OperatorId, OperatorRef,
    PositionFix, Stop, StopId, Vehicle, VehicleId,
};
