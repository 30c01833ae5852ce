//! Integration tests for single-record administration and reference export

use fleet_admin::domain::types::{CollectionKind, OperatorId, StopId, VehicleId};
use fleet_admin::domain::{ErrorKind, FleetError};
use fleet_admin::infra::Metrics;
use fleet_admin::io::{MemoryAuditSink, MemoryIdentityProvider, MemoryStore, RemoteStore};
use fleet_admin::services::directory::{DirectorySettings, GuardianForm, NewOperator, NewVehicle};
use fleet_admin::services::{
    reference, ChangeStreamCache, FleetDirectory, MutationSettings, NewStop, StopListMutator,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<MemoryStore>,
    identity: Arc<MemoryIdentityProvider>,
    audit: Arc<MemoryAuditSink>,
    cache: ChangeStreamCache,
}

impl Harness {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let cache = ChangeStreamCache::new(
            store.clone(),
            audit.clone(),
            Arc::new(Metrics::new()),
            Duration::from_millis(20),
        );
        cache.init();
        for kind in CollectionKind::ALL {
            assert!(cache.wait_synced(kind, Duration::from_secs(2)).await);
        }
        Self { store, identity: Arc::new(MemoryIdentityProvider::new()), audit, cache }
    }

    fn directory(&self) -> FleetDirectory<'_> {
        FleetDirectory::new(
            &self.cache,
            self.store.clone(),
            self.identity.clone(),
            self.audit.clone(),
            DirectorySettings::default(),
        )
    }

    fn mutator(&self) -> StopListMutator {
        StopListMutator::new(
            self.store.clone(),
            self.audit.clone(),
            Arc::new(Metrics::new()),
            MutationSettings::default(),
        )
    }

    /// Wait for the cache to pick up a remote write
    async fn settle(&self, check: impl Fn(&ChangeStreamCache) -> bool) {
        for _ in 0..200 {
            if check(&self.cache) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cache did not converge");
    }
}

fn vehicle_form(number: &str) -> NewVehicle {
    NewVehicle { number: number.into(), route_name: "North".into(), ..Default::default() }
}

fn operator_form(phone: &str) -> NewOperator {
    NewOperator { name: "Ravi".into(), phone: phone.into(), vehicle: None }
}

#[tokio::test]
async fn test_operator_lifecycle_keeps_pairing_consistent() {
    let h = Harness::new().await;
    let dir = h.directory();

    let b1 = dir.create_vehicle(vehicle_form("B1")).await.unwrap();
    let b2 = dir.create_vehicle(vehicle_form("B2")).await.unwrap();

    let op = dir
        .create_operator(NewOperator {
            vehicle: Some(b1.id.clone()),
            ..operator_form("9000000001")
        })
        .await
        .unwrap();
    assert_eq!(op.login_key, "9000000001@traqerr.com");

    let on_b1 = h.store.read_vehicle(&b1.id).await.unwrap().unwrap().value;
    assert_eq!(on_b1.operator_id(), Some(&op.id));
    assert_eq!(on_b1.operator.as_ref().map(|o| o.name.as_str()), Some("Ravi"));

    dir.update_operator(&op.id, "Ravi K", "9000000001", Some(&b2.id)).await.unwrap();
    let on_b1 = h.store.read_vehicle(&b1.id).await.unwrap().unwrap().value;
    let on_b2 = h.store.read_vehicle(&b2.id).await.unwrap().unwrap().value;
    assert_eq!(on_b1.operator, None);
    assert_eq!(on_b2.operator.as_ref().map(|o| o.name.as_str()), Some("Ravi K"));

    dir.delete_operator(&op.id).await.unwrap();
    let on_b2 = h.store.read_vehicle(&b2.id).await.unwrap().unwrap().value;
    assert_eq!(on_b2.operator, None);
    assert!(h.store.read_operator(&op.id).await.unwrap().is_none());

    let again = dir.delete_operator(&op.id).await;
    assert!(matches!(again, Err(FleetError::NotFound { entity: "operator", .. })));
}

#[tokio::test]
async fn test_vehicle_created_with_operator() {
    let h = Harness::new().await;
    let dir = h.directory();

    let op = dir.create_operator(operator_form("9000000002")).await.unwrap();
    let bus = dir
        .create_vehicle(NewVehicle { operator: Some(op.id.clone()), ..vehicle_form("B7") })
        .await
        .unwrap();

    let stored = h.store.read_operator(&op.id).await.unwrap().unwrap();
    assert_eq!(stored.assigned_vehicle, Some(bus.id));

    let duplicate = dir.create_operator(operator_form("9000000002")).await;
    assert!(matches!(duplicate, Err(FleetError::Provisioning(_))));
    assert!(matches!(
        dir.create_vehicle(vehicle_form("  ")).await,
        Err(FleetError::Validation(_))
    ));
    assert!(matches!(
        dir.create_operator(operator_form("123")).await,
        Err(FleetError::Validation(_))
    ));
    assert_eq!(h.audit.count_from("directory"), 3);
}

#[tokio::test]
async fn test_guardian_form_path_and_search() {
    let h = Harness::new().await;
    let dir = h.directory();

    let bus = dir.create_vehicle(vehicle_form("B1")).await.unwrap();
    let gate =
        h.mutator().insert_stop(&bus.id, NewStop::new("Gate", 11.9, 79.8), None).await.unwrap();
    let market =
        h.mutator().insert_stop(&bus.id, NewStop::new("Market", 11.8, 79.7), None).await.unwrap();
    h.settle(|c| c.find_vehicle(&bus.id).map(|v| v.stops.len()) == Some(2)).await;

    let form = GuardianForm {
        guardian_name: "Priya".into(),
        phone: "98765 43210".into(),
        student_name: "Arun".into(),
        student_class: "5".into(),
        vehicle_id: bus.id.clone(),
        stop_id: gate.id.clone(),
    };
    let guardian = dir.create_guardian(form.clone()).await.unwrap();
    assert_eq!(guardian.phone, "9876543210");
    assert_eq!(guardian.stop_name, "Gate");
    assert_eq!(guardian.vehicle_number, "B1");

    let moved = dir
        .update_guardian(&guardian.id, GuardianForm { stop_id: market.id.clone(), ..form.clone() })
        .await
        .unwrap();
    assert_eq!(moved.stop_name, "Market");
    assert_eq!(moved.login_key, guardian.login_key);

    let bad_stop = dir
        .create_guardian(GuardianForm { stop_id: StopId::from("nowhere"), ..form.clone() })
        .await;
    assert_eq!(bad_stop.unwrap_err().kind(), ErrorKind::ResolutionError);
    let bad_vehicle = dir
        .create_guardian(GuardianForm { vehicle_id: VehicleId::from("ghost"), ..form })
        .await;
    assert_eq!(bad_vehicle.unwrap_err().kind(), ErrorKind::ResolutionError);

    h.settle(|c| c.guardians().len() == 1).await;
    assert_eq!(dir.search_guardians("arun").len(), 1);
    assert_eq!(dir.search_guardians("PRI").len(), 1);
    assert_eq!(dir.search_guardians("43210").len(), 1);
    assert!(dir.search_guardians("zzz").is_empty());

    dir.delete_guardian(&guardian.id).await.unwrap();
    let again = dir.delete_guardian(&guardian.id).await;
    assert!(matches!(again, Err(FleetError::NotFound { entity: "guardian", .. })));
}

#[tokio::test]
async fn test_reference_export_from_cache() {
    let h = Harness::new().await;
    let dir = h.directory();

    let b1 = dir.create_vehicle(vehicle_form("B1")).await.unwrap();
    dir.create_vehicle(vehicle_form("B2")).await.unwrap();
    h.mutator().insert_stop(&b1.id, NewStop::new("Gate", 11.9, 79.8), None).await.unwrap();
    h.mutator().insert_stop(&b1.id, NewStop::new("Depot", 11.7, 79.6), Some(1)).await.unwrap();
    h.settle(|c| c.vehicles().iter().map(|v| v.stops.len()).sum::<usize>() == 2).await;

    let table = reference::export_from_cache(&h.cache);
    assert_eq!(table.headers, reference::REFERENCE_HEADERS.to_vec());
    assert_eq!(table.len(), 3);

    let b1_stops: Vec<&str> = table
        .rows
        .iter()
        .filter(|r| r[1] == "B1")
        .map(|r| r[4].as_str())
        .collect();
    assert_eq!(b1_stops, vec!["Depot", "Gate"]);
    let b2_row = table.rows.iter().find(|r| r[1] == "B2").unwrap();
    assert_eq!(&b2_row[3..], ["", ""]);

    let unknown = OperatorId::from("nobody");
    assert!(dir.delete_operator(&unknown).await.is_err());
}
