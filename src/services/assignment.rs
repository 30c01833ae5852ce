//! Operator to vehicle assignment
//!
//! Keeps the "one operator per vehicle, one vehicle per operator" pairing in
//! step on both sides with a single batch of field-level patches. The batch
//! is not atomic across documents; a reader may briefly see one side updated
//! and the other not.

use crate::domain::error::{FleetError, FleetResult};
use crate::domain::types::{OperatorId, OperatorRef, VehicleId};
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::store::{BatchWrite, RemoteStore};
use crate::services::bounded;
use crate::services::stop_mutator::MutationSettings;
use std::sync::Arc;
use tracing::info;

const AUDIT_SOURCE: &str = "assignment";

pub struct OperatorAssignment {
    store: Arc<dyn RemoteStore>,
    audit: Arc<dyn AuditSink>,
    settings: MutationSettings,
}

impl OperatorAssignment {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        audit: Arc<dyn AuditSink>,
        settings: MutationSettings,
    ) -> Self {
        Self { store, audit, settings }
    }

    /// Put `operator_id` on `vehicle_id`, or take them off every vehicle with `None`
    ///
    /// Any other vehicle pointing at the operator is cleared, and the
    /// vehicle's previous operator loses its back-reference.
    pub async fn assign(
        &self,
        operator_id: &OperatorId,
        vehicle_id: Option<&VehicleId>,
    ) -> FleetResult<()> {
        let result = self.build_and_commit(operator_id, vehicle_id).await;
        if let Err(err) = &result {
            self.audit.record(AuditEvent::error(
                AUDIT_SOURCE,
                err.kind(),
                operator_id.as_str(),
                err.to_string(),
            ));
        }
        result
    }

    async fn build_and_commit(
        &self,
        operator_id: &OperatorId,
        vehicle_id: Option<&VehicleId>,
    ) -> FleetResult<()> {
        let timeout = self.settings.txn_timeout;

        let operator = bounded("assign_operator", timeout, self.store.read_operator(operator_id))
            .await??
            .ok_or_else(|| FleetError::not_found("operator", operator_id))?;
        let vehicles = bounded("assign_operator", timeout, self.store.list_vehicles()).await??;

        let target = match vehicle_id {
            Some(id) => Some(
                vehicles
                    .iter()
                    .find(|v| &v.id == id)
                    .ok_or_else(|| FleetError::not_found("vehicle", id))?,
            ),
            None => None,
        };

        let mut writes = Vec::new();

        for vehicle in &vehicles {
            if vehicle.operator_id() == Some(operator_id) && Some(&vehicle.id) != vehicle_id {
                writes.push(BatchWrite::SetVehicleOperator {
                    vehicle_id: vehicle.id.clone(),
                    operator: None,
                });
            }
        }

        if let Some(target) = target {
            if let Some(previous) = target.operator_id().filter(|prev| *prev != operator_id) {
                // The previous operator may have been deleted already
                let exists =
                    bounded("assign_operator", timeout, self.store.read_operator(previous))
                        .await??
                        .is_some();
                if exists {
                    writes.push(BatchWrite::SetOperatorVehicle {
                        operator_id: previous.clone(),
                        vehicle_id: None,
                    });
                }
            }
            writes.push(BatchWrite::SetVehicleOperator {
                vehicle_id: target.id.clone(),
                operator: Some(OperatorRef {
                    id: operator.id.clone(),
                    name: operator.name.clone(),
                    phone: operator.phone.clone(),
                }),
            });
        }

        writes.push(BatchWrite::SetOperatorVehicle {
            operator_id: operator_id.clone(),
            vehicle_id: vehicle_id.cloned(),
        });

        let count = writes.len();
        bounded("assign_operator", timeout, self.store.commit_batch(writes)).await??;

        info!(
            operator_id = %operator_id,
            vehicle_id = %vehicle_id.map(|v| v.as_str()).unwrap_or("-"),
            writes = %count,
            "operator_assigned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Operator, Vehicle};
    use crate::io::audit::MemoryAuditSink;
    use crate::io::memory_store::MemoryStore;

    fn operator(id: &str) -> Operator {
        Operator {
            id: OperatorId::from(id),
            name: format!("Driver {id}"),
            phone: "9000000000".into(),
            login_key: format!("{id}@example.com"),
            assigned_vehicle: None,
            created_at: None,
            updated_at: None,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, OperatorAssignment) {
        let store = Arc::new(MemoryStore::new());
        for id in ["bus_1", "bus_2"] {
            store.create_vehicle(Vehicle::new(VehicleId::from(id), id, "")).await.unwrap();
        }
        for id in ["op_x", "op_y"] {
            store.put_operator(operator(id)).await.unwrap();
        }
        let assignment = OperatorAssignment::new(
            store.clone(),
            Arc::new(MemoryAuditSink::new()),
            MutationSettings::default(),
        );
        (store, assignment)
    }

    async fn vehicle_operator(store: &MemoryStore, id: &str) -> Option<OperatorId> {
        let v = store.read_vehicle(&VehicleId::from(id)).await.unwrap().unwrap().value;
        v.operator_id().cloned()
    }

    async fn operator_vehicle(store: &MemoryStore, id: &str) -> Option<VehicleId> {
        store.read_operator(&OperatorId::from(id)).await.unwrap().unwrap().assigned_vehicle
    }

    #[tokio::test]
    async fn test_moving_operator_clears_old_vehicle() {
        let (store, assignment) = setup().await;
        let x = OperatorId::from("op_x");

        assignment.assign(&x, Some(&VehicleId::from("bus_1"))).await.unwrap();
        assignment.assign(&x, Some(&VehicleId::from("bus_2"))).await.unwrap();

        assert_eq!(vehicle_operator(&store, "bus_1").await, None);
        assert_eq!(vehicle_operator(&store, "bus_2").await, Some(x.clone()));
        assert_eq!(operator_vehicle(&store, "op_x").await, Some(VehicleId::from("bus_2")));
    }

    #[tokio::test]
    async fn test_taking_over_vehicle_clears_previous_operator() {
        let (store, assignment) = setup().await;
        let bus = VehicleId::from("bus_1");

        assignment.assign(&OperatorId::from("op_y"), Some(&bus)).await.unwrap();
        assignment.assign(&OperatorId::from("op_x"), Some(&bus)).await.unwrap();

        assert_eq!(vehicle_operator(&store, "bus_1").await, Some(OperatorId::from("op_x")));
        assert_eq!(operator_vehicle(&store, "op_y").await, None);
    }

    #[tokio::test]
    async fn test_unassign() {
        let (store, assignment) = setup().await;
        let x = OperatorId::from("op_x");
        assignment.assign(&x, Some(&VehicleId::from("bus_1"))).await.unwrap();
        assignment.assign(&x, None).await.unwrap();

        assert_eq!(vehicle_operator(&store, "bus_1").await, None);
        assert_eq!(operator_vehicle(&store, "op_x").await, None);
    }

    #[tokio::test]
    async fn test_missing_entities_fail_before_writing() {
        let (store, assignment) = setup().await;
        let missing_vehicle =
            assignment.assign(&OperatorId::from("op_x"), Some(&VehicleId::from("ghost"))).await;
        assert!(matches!(missing_vehicle, Err(FleetError::NotFound { entity: "vehicle", .. })));

        let missing_operator =
            assignment.assign(&OperatorId::from("ghost"), Some(&VehicleId::from("bus_1"))).await;
        assert!(matches!(missing_operator, Err(FleetError::NotFound { entity: "operator", .. })));
        assert_eq!(vehicle_operator(&store, "bus_1").await, None);
    }
}
