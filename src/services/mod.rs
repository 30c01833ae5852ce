//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `cache` - change-stream cache with observer fan-out
//! - `stop_mutator` - optimistic stop-list transactions
//! - `assignment` - operator/vehicle reassignment batches
//! - `pipeline` - bulk guardian provisioning from tabular records
//! - `reference` - reference sheet and import template export
//! - `directory` - single-record administration and guardian search
//! - `live_feed` - live vehicle position reporting and board

pub mod assignment;
pub mod cache;
pub mod directory;
pub mod live_feed;
pub mod pipeline;
pub mod reference;
pub mod stop_mutator;

// Re-export commonly used types
pub use assignment::OperatorAssignment;
pub use cache::{ChangeStreamCache, Lifecycle, SubscriptionHandle};
pub use directory::FleetDirectory;
pub use live_feed::LivePositionFeed;
pub use pipeline::{PipelineSettings, ProvisioningPipeline};
pub use stop_mutator::{MutationSettings, NewStop, StopListMutator};

use crate::domain::error::{FleetError, FleetResult};
use std::future::Future;
use std::time::Duration;

/// Run `fut` with a deadline, mapping expiry to `FleetError::Timeout`
pub(crate) async fn bounded<F, T>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> FleetResult<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(after, fut).await.map_err(|_| FleetError::Timeout { operation, after })
}
