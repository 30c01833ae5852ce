//! Bulk guardian provisioning
//!
//! Turns raw tabular rows into committed guardians, one row at a time:
//! normalize aliases, validate, resolve vehicle and stop against the cache,
//! provision an identity, persist the guardian. A failing row is recorded and
//! the run moves on; nothing aborts the batch except cancellation, which is
//! checked between rows.
//!
//! Re-running a file is not idempotent: rows that committed before now fail
//! at identity provisioning because the login already exists.

use crate::domain::error::{FleetError, FleetResult};
use crate::domain::records::{
    normalize_phone, CanonicalRecord, ImportFailure, ImportOutcome, ImportReport, RawRecord,
    MIN_PHONE_DIGITS,
};
use crate::domain::types::{Guardian, GuardianId, Stop, Vehicle};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::identity::IdentityProvider;
use crate::io::store::RemoteStore;
use crate::services::bounded;
use crate::services::cache::ChangeStreamCache;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

const AUDIT_SOURCE: &str = "pipeline";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSettings {
    /// Login keys are `{phone}@{identity_domain}`
    pub identity_domain: String,
    pub guardian_credential: String,
    /// Pause after every row, success or failure
    pub row_delay: Duration,
    /// Bound on each identity and persist call
    pub call_timeout: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            identity_domain: config.identity_domain().to_string(),
            guardian_credential: config.guardian_credential().to_string(),
            row_delay: config.import_row_delay(),
            call_timeout: config.import_call_timeout(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Running totals handed to the progress callback after each row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

type ProgressFn<'a> = Box<dyn FnMut(Progress) + Send + 'a>;

pub struct ProvisioningPipeline<'a> {
    cache: &'a ChangeStreamCache,
    store: Arc<dyn RemoteStore>,
    identity: Arc<dyn IdentityProvider>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<Metrics>,
    settings: PipelineSettings,
    progress: Option<ProgressFn<'a>>,
}

impl<'a> ProvisioningPipeline<'a> {
    pub fn new(
        cache: &'a ChangeStreamCache,
        store: Arc<dyn RemoteStore>,
        identity: Arc<dyn IdentityProvider>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self { cache, store, identity, audit, metrics, settings, progress: None }
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: FnMut(Progress) + Send + 'a,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Process every record in order; returns the partial report if cancelled
    pub async fn run(
        &mut self,
        records: Vec<RawRecord>,
        mut cancel: watch::Receiver<bool>,
    ) -> ImportReport {
        let total = records.len();
        let mut report = ImportReport::default();
        info!(rows = %total, "import_started");

        for (i, record) in records.into_iter().enumerate() {
            if *cancel.borrow() {
                report.cancelled = true;
                info!(processed = %report.processed, total = %total, "import_cancelled");
                break;
            }

            let row = i + 1;
            let outcome = self.step(row, record).await;
            match &outcome {
                ImportOutcome::Committed(id) => {
                    info!(row = %row, guardian_id = %id, "import_row_committed");
                }
                ImportOutcome::Failed(failure) => {
                    warn!(
                        row = %row,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "import_row_failed"
                    );
                    self.audit.record(AuditEvent::error(
                        AUDIT_SOURCE,
                        failure.kind,
                        format!("row {row}"),
                        failure.reason.clone(),
                    ));
                }
            }
            self.metrics.record_import_row(outcome.is_committed());
            report.record(outcome);

            if let Some(progress) = self.progress.as_mut() {
                progress(Progress {
                    processed: report.processed,
                    total,
                    succeeded: report.succeeded,
                    failed: report.failed,
                });
            }

            if !self.settings.row_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.row_delay) => {}
                    Ok(_) = cancel.wait_for(|cancelled| *cancelled) => {}
                }
            }
        }

        let summary = report.summary_line();
        info!(
            processed = %report.processed,
            succeeded = %report.succeeded,
            failed = %report.failed,
            cancelled = %report.cancelled,
            "import_finished"
        );
        self.audit.record(AuditEvent::info(AUDIT_SOURCE, "import", summary));
        report
    }

    /// Process one record against the latest cached vehicles
    pub async fn step(&self, row: usize, record: RawRecord) -> ImportOutcome {
        match self.process(&record).await {
            Ok(id) => ImportOutcome::Committed(id),
            Err(err) => ImportOutcome::Failed(ImportFailure {
                row,
                kind: err.kind(),
                reason: err.to_string(),
                record,
            }),
        }
    }

    async fn process(&self, record: &RawRecord) -> FleetResult<GuardianId> {
        let fields = record.canonical();
        let phone = validate(&fields)?;

        let vehicles = self.cache.vehicles();
        let vehicle = resolve_vehicle(&vehicles, &fields.vehicle_ref)?;
        let stop = resolve_stop(vehicle, &fields.stop_ref)?;

        let login_key = format!("{}@{}", phone, self.settings.identity_domain);
        let started = Instant::now();
        let created = bounded(
            "create_identity",
            self.settings.call_timeout,
            self.identity.create_identity(&login_key, &self.settings.guardian_credential),
        )
        .await;
        self.metrics.record_identity_latency(started.elapsed().as_micros() as u64);
        let identity_id = created.map_err(as_provisioning)??;

        let now = Utc::now();
        let guardian = Guardian {
            id: GuardianId::new(identity_id),
            name: fields.guardian_name,
            phone,
            login_key,
            student_name: fields.student_name,
            student_class: fields.student_class,
            vehicle_id: vehicle.id.clone(),
            stop_id: stop.id.clone(),
            vehicle_number: vehicle.number.clone(),
            route_name: vehicle.route_name.clone(),
            stop_name: stop.name.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        let id = guardian.id.clone();

        bounded("persist_guardian", self.settings.call_timeout, self.store.put_guardian(guardian))
            .await
            .map_err(as_provisioning)?
            .map_err(|e| FleetError::Provisioning(format!("guardian not saved: {e}")))?;

        Ok(id)
    }
}

/// Timeouts during commit count as provisioning failures for the row
fn as_provisioning(err: FleetError) -> FleetError {
    match err {
        FleetError::Provisioning(_) => err,
        other => FleetError::Provisioning(other.to_string()),
    }
}

/// Check required fields; returns the normalized phone
pub fn validate(fields: &CanonicalRecord) -> FleetResult<String> {
    if fields.guardian_name.is_empty() {
        return Err(FleetError::Validation("missing guardian name".to_string()));
    }
    if fields.student_name.is_empty() {
        return Err(FleetError::Validation("missing student name".to_string()));
    }
    validate_phone(&fields.phone)
}

/// Normalized phone, or `Validation` when empty or too short
pub fn validate_phone(raw: &str) -> FleetResult<String> {
    if raw.trim().is_empty() {
        return Err(FleetError::Validation("missing phone".to_string()));
    }
    let phone = normalize_phone(raw);
    if phone.len() < MIN_PHONE_DIGITS {
        return Err(FleetError::Validation(format!(
            "phone \"{}\" has fewer than {} digits",
            raw.trim(),
            MIN_PHONE_DIGITS
        )));
    }
    Ok(phone)
}

/// Match on display number (trimmed, case-insensitive), then exact id
pub fn resolve_vehicle<'v>(vehicles: &'v [Vehicle], reference: &str) -> FleetResult<&'v Vehicle> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(FleetError::Resolution("missing vehicle reference".to_string()));
    }
    let wanted = reference.to_lowercase();
    vehicles
        .iter()
        .find(|v| v.number.trim().to_lowercase() == wanted)
        .or_else(|| vehicles.iter().find(|v| v.id.as_str() == reference))
        .ok_or_else(|| FleetError::Resolution(format!("unknown vehicle \"{reference}\"")))
}

/// Match on stop name (trimmed, case-insensitive) within one vehicle
pub fn resolve_stop<'v>(vehicle: &'v Vehicle, reference: &str) -> FleetResult<&'v Stop> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(FleetError::Resolution(format!(
            "missing stop reference for vehicle {}",
            vehicle.label()
        )));
    }
    let wanted = reference.to_lowercase();
    vehicle
        .stops
        .iter()
        .find(|s| s.name.trim().to_lowercase() == wanted)
        .ok_or_else(|| {
            FleetError::Resolution(format!(
                "unknown stop \"{reference}\" for vehicle {}",
                vehicle.label()
            ))
        })
}
