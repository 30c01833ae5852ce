//! Single-record administration
//!
//! Form-style create/update/delete for vehicles, operators and guardians,
//! plus guardian search over the cached snapshot. Operator pairing always
//! goes through [`OperatorAssignment`] so both sides stay in step.

use crate::domain::error::{FleetError, FleetResult, StoreError};
use crate::domain::types::{
    generate_id, Guardian, GuardianId, Operator, OperatorId, StopId, Vehicle, VehicleId,
};
use crate::infra::config::Config;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::identity::IdentityProvider;
use crate::io::store::RemoteStore;
use crate::services::assignment::OperatorAssignment;
use crate::services::bounded;
use crate::services::cache::ChangeStreamCache;
use crate::services::pipeline::validate_phone;
use crate::services::stop_mutator::MutationSettings;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const AUDIT_SOURCE: &str = "directory";

#[derive(Debug, Clone, PartialEq)]
pub struct DirectorySettings {
    pub identity_domain: String,
    pub guardian_credential: String,
    pub operator_credential: String,
    pub call_timeout: Duration,
    pub mutations: MutationSettings,
}

impl From<&Config> for DirectorySettings {
    fn from(config: &Config) -> Self {
        Self {
            identity_domain: config.identity_domain().to_string(),
            guardian_credential: config.guardian_credential().to_string(),
            operator_credential: config.operator_credential().to_string(),
            call_timeout: config.import_call_timeout(),
            mutations: MutationSettings::from(config),
        }
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewVehicle {
    pub number: String,
    pub route_name: String,
    pub capacity: Option<u32>,
    pub color_code: Option<String>,
    pub operator: Option<OperatorId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewOperator {
    pub name: String,
    pub phone: String,
    pub vehicle: Option<VehicleId>,
}

/// Single guardian form; vehicle and stop are picked by id
#[derive(Debug, Clone, PartialEq)]
pub struct GuardianForm {
    pub guardian_name: String,
    pub phone: String,
    pub student_name: String,
    pub student_class: String,
    pub vehicle_id: VehicleId,
    pub stop_id: StopId,
}

pub struct FleetDirectory<'a> {
    cache: &'a ChangeStreamCache,
    store: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    audit: Arc<dyn AuditSink>,
    assignment: OperatorAssignment,
    settings: DirectorySettings,
}

impl<'a> FleetDirectory<'a> {
    pub fn new(
        cache: &'a ChangeStreamCache,
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        audit: Arc<dyn AuditSink>,
        settings: DirectorySettings,
    ) -> Self {
        let assignment = OperatorAssignment::new(store.clone(), audit.clone(), settings.mutations);
        Self { cache, store, identity, audit, assignment, settings }
    }

    pub async fn create_vehicle(&self, form: NewVehicle) -> FleetResult<Vehicle> {
        let result = self.create_vehicle_inner(form).await;
        self.audited("vehicle", result)
    }

    async fn create_vehicle_inner(&self, form: NewVehicle) -> FleetResult<Vehicle> {
        let number = form.number.trim();
        if number.is_empty() {
            return Err(FleetError::Validation("missing vehicle number".to_string()));
        }

        let mut vehicle =
            Vehicle::new(VehicleId::new(generate_id("bus")), number, form.route_name.trim());
        vehicle.capacity = form.capacity;
        vehicle.color_code = form.color_code.filter(|c| !c.trim().is_empty());

        self.call("create_vehicle", self.store.create_vehicle(vehicle.clone())).await??;
        info!(vehicle_id = %vehicle.id, number = %vehicle.number, "vehicle_created");

        if let Some(operator_id) = &form.operator {
            self.assignment.assign(operator_id, Some(&vehicle.id)).await?;
        }
        Ok(vehicle)
    }

    pub async fn create_operator(&self, form: NewOperator) -> FleetResult<Operator> {
        let result = self.create_operator_inner(form).await;
        self.audited("operator", result)
    }

    async fn create_operator_inner(&self, form: NewOperator) -> FleetResult<Operator> {
        let name = required(&form.name, "operator name")?;
        let phone = validate_phone(&form.phone)?;

        let login_key = format!("{}@{}", phone, self.settings.identity_domain);
        let identity_id = self
            .call(
                "create_identity",
                self.identity.create_identity(&login_key, &self.settings.operator_credential),
            )
            .await??;

        let now = Utc::now();
        let operator = Operator {
            id: OperatorId::new(identity_id),
            name,
            phone,
            login_key,
            assigned_vehicle: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.call("put_operator", self.store.put_operator(operator.clone())).await??;
        info!(operator_id = %operator.id, "operator_created");

        if let Some(vehicle_id) = &form.vehicle {
            self.assignment.assign(&operator.id, Some(vehicle_id)).await?;
        }
        Ok(operator)
    }

    /// Update contact fields, then (re)assign or unassign the vehicle
    pub async fn update_operator(
        &self,
        id: &OperatorId,
        name: &str,
        phone: &str,
        vehicle: Option<&VehicleId>,
    ) -> FleetResult<()> {
        let result = self.update_operator_inner(id, name, phone, vehicle).await;
        self.audited(id.as_str(), result)
    }

    async fn update_operator_inner(
        &self,
        id: &OperatorId,
        name: &str,
        phone: &str,
        vehicle: Option<&VehicleId>,
    ) -> FleetResult<()> {
        let name = required(name, "operator name")?;
        let phone = validate_phone(phone)?;

        let mut operator = self
            .call("read_operator", self.store.read_operator(id))
            .await??
            .ok_or_else(|| FleetError::not_found("operator", id))?;
        operator.name = name;
        operator.phone = phone;
        operator.updated_at = Some(Utc::now());
        self.call("put_operator", self.store.put_operator(operator)).await??;

        self.assignment.assign(id, vehicle).await?;
        info!(operator_id = %id, "operator_updated");
        Ok(())
    }

    pub async fn delete_operator(&self, id: &OperatorId) -> FleetResult<()> {
        let result = self.delete_operator_inner(id).await;
        self.audited(id.as_str(), result)
    }

    async fn delete_operator_inner(&self, id: &OperatorId) -> FleetResult<()> {
        self.assignment.assign(id, None).await?;
        self.call("delete_operator", self.store.delete_operator(id))
            .await?
            .map_err(|e| missing_as_not_found(e, "operator", id))?;
        info!(operator_id = %id, "operator_deleted");
        Ok(())
    }

    pub async fn create_guardian(&self, form: GuardianForm) -> FleetResult<Guardian> {
        let result = self.create_guardian_inner(form).await;
        self.audited("guardian", result)
    }

    async fn create_guardian_inner(&self, form: GuardianForm) -> FleetResult<Guardian> {
        let name = required(&form.guardian_name, "guardian name")?;
        let student_name = required(&form.student_name, "student name")?;
        let phone = validate_phone(&form.phone)?;
        let (vehicle, stop_name) = self.resolve_form(&form)?;

        let login_key = format!("{}@{}", phone, self.settings.identity_domain);
        let identity_id = self
            .call(
                "create_identity",
                self.identity.create_identity(&login_key, &self.settings.guardian_credential),
            )
            .await??;

        let now = Utc::now();
        let guardian = Guardian {
            id: GuardianId::new(identity_id),
            name,
            phone,
            login_key,
            student_name,
            student_class: form.student_class.trim().to_string(),
            vehicle_id: vehicle.id.clone(),
            stop_id: form.stop_id,
            vehicle_number: vehicle.number,
            route_name: vehicle.route_name,
            stop_name,
            created_at: Some(now),
            updated_at: Some(now),
        };
        self.call("put_guardian", self.store.put_guardian(guardian.clone())).await??;
        info!(guardian_id = %guardian.id, "guardian_created");
        Ok(guardian)
    }

    /// Rewrite a guardian from the form; login key and identity stay as they were
    pub async fn update_guardian(
        &self,
        id: &GuardianId,
        form: GuardianForm,
    ) -> FleetResult<Guardian> {
        let result = self.update_guardian_inner(id, form).await;
        self.audited(id.as_str(), result)
    }

    async fn update_guardian_inner(
        &self,
        id: &GuardianId,
        form: GuardianForm,
    ) -> FleetResult<Guardian> {
        let name = required(&form.guardian_name, "guardian name")?;
        let student_name = required(&form.student_name, "student name")?;
        let phone = validate_phone(&form.phone)?;
        let (vehicle, stop_name) = self.resolve_form(&form)?;

        let mut guardian = self
            .call("read_guardian", self.store.read_guardian(id))
            .await??
            .ok_or_else(|| FleetError::not_found("guardian", id))?;
        guardian.name = name;
        guardian.phone = phone;
        guardian.student_name = student_name;
        guardian.student_class = form.student_class.trim().to_string();
        guardian.vehicle_id = vehicle.id;
        guardian.stop_id = form.stop_id;
        guardian.vehicle_number = vehicle.number;
        guardian.route_name = vehicle.route_name;
        guardian.stop_name = stop_name;
        guardian.updated_at = Some(Utc::now());

        self.call("put_guardian", self.store.put_guardian(guardian.clone())).await??;
        info!(guardian_id = %id, "guardian_updated");
        Ok(guardian)
    }

    pub async fn delete_guardian(&self, id: &GuardianId) -> FleetResult<()> {
        let result = self.delete_guardian_inner(id).await;
        self.audited(id.as_str(), result)
    }

    async fn delete_guardian_inner(&self, id: &GuardianId) -> FleetResult<()> {
        self.call("delete_guardian", self.store.delete_guardian(id))
            .await?
            .map_err(|e| missing_as_not_found(e, "guardian", id))?;
        info!(guardian_id = %id, "guardian_deleted");
        Ok(())
    }

    /// Search the cached guardians; see [`search_guardians`]
    pub fn search_guardians(&self, query: &str) -> Vec<Guardian> {
        search_guardians(&self.cache.guardians(), query)
    }

    /// Vehicle and stop name for the form's ids, from the cache
    fn resolve_form(&self, form: &GuardianForm) -> FleetResult<(Vehicle, String)> {
        let vehicle = self.cache.find_vehicle(&form.vehicle_id).ok_or_else(|| {
            FleetError::Resolution(format!("unknown vehicle \"{}\"", form.vehicle_id))
        })?;
        let stop_name = vehicle
            .stop(&form.stop_id)
            .map(|s| s.name.clone())
            .ok_or_else(|| {
                FleetError::Resolution(format!(
                    "unknown stop \"{}\" for vehicle {}",
                    form.stop_id,
                    vehicle.label()
                ))
            })?;
        Ok((vehicle, stop_name))
    }

    async fn call<F, T>(&self, operation: &'static str, fut: F) -> FleetResult<T>
    where
        F: std::future::Future<Output = T>,
    {
        bounded(operation, self.settings.call_timeout, fut).await
    }

    fn audited<T>(&self, subject: &str, result: FleetResult<T>) -> FleetResult<T> {
        if let Err(err) = &result {
            self.audit
                .record(AuditEvent::error(AUDIT_SOURCE, err.kind(), subject, err.to_string()));
        }
        result
    }
}

fn missing_as_not_found(
    err: StoreError,
    entity: &'static str,
    id: impl std::fmt::Display,
) -> FleetError {
    match err {
        StoreError::Missing { .. } => FleetError::not_found(entity, id),
        other => FleetError::Store(other),
    }
}

fn required(value: &str, field: &str) -> FleetResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(FleetError::Validation(format!("missing {field}")));
    }
    Ok(value.to_string())
}

/// Case-insensitive substring match on student or guardian name, plain
/// substring on phone. An empty query matches everything.
pub fn search_guardians(guardians: &[Guardian], query: &str) -> Vec<Guardian> {
    let query = query.trim();
    if query.is_empty() {
        return guardians.to_vec();
    }
    let needle = query.to_lowercase();
    guardians
        .iter()
        .filter(|g| {
            g.student_name.to_lowercase().contains(&needle)
                || g.name.to_lowercase().contains(&needle)
                || g.phone.contains(query)
        })
        .cloned()
        .collect()
}
