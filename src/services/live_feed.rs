//! Live vehicle positions
//!
//! Each vehicle owns a single position slot; the latest report wins. The
//! board filters out fixes without coordinates and fixes older than the
//! configured staleness window.

use crate::domain::error::{FleetError, FleetResult};
use crate::domain::types::{epoch_ms, GeoPoint, PositionFix, VehicleId};
use crate::infra::config::Config;
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::store::RemoteStore;
use crate::services::bounded;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const AUDIT_SOURCE: &str = "live";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionExtras {
    pub vehicle_number: Option<String>,
    pub operator_name: Option<String>,
}

/// One plotted vehicle
#[derive(Debug, Clone, PartialEq)]
pub struct LiveMarker {
    pub vehicle_id: VehicleId,
    pub location: GeoPoint,
    pub timestamp: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveBoard {
    pub markers: Vec<LiveMarker>,
    pub status: String,
}

pub struct LivePositionFeed {
    store: Arc<dyn RemoteStore>,
    audit: Arc<dyn AuditSink>,
    stale_after: Option<Duration>,
    call_timeout: Duration,
}

impl LivePositionFeed {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        audit: Arc<dyn AuditSink>,
        stale_after: Option<Duration>,
        call_timeout: Duration,
    ) -> Self {
        Self { store, audit, stale_after, call_timeout }
    }

    pub fn from_config(
        store: Arc<dyn RemoteStore>,
        audit: Arc<dyn AuditSink>,
        config: &Config,
    ) -> Self {
        Self::new(store, audit, config.live_stale_after(), config.mutation_txn_timeout())
    }

    /// Record the vehicle's current position, replacing any earlier fix
    pub async fn report(
        &self,
        vehicle_id: &VehicleId,
        lat: f64,
        lng: f64,
        extras: PositionExtras,
    ) -> FleetResult<PositionFix> {
        let result = self.report_inner(vehicle_id, lat, lng, extras).await;
        if let Err(err) = &result {
            self.audit.record(AuditEvent::error(
                AUDIT_SOURCE,
                err.kind(),
                vehicle_id.as_str(),
                err.to_string(),
            ));
        }
        result
    }

    async fn report_inner(
        &self,
        vehicle_id: &VehicleId,
        lat: f64,
        lng: f64,
        extras: PositionExtras,
    ) -> FleetResult<PositionFix> {
        if vehicle_id.as_str().trim().is_empty() {
            return Err(FleetError::Validation("missing vehicle id".to_string()));
        }
        if !GeoPoint::new(lat, lng).is_valid() {
            return Err(FleetError::Validation(format!("invalid coordinate ({lat}, {lng})")));
        }

        let fix = PositionFix {
            vehicle_id: vehicle_id.clone(),
            lat: Some(lat),
            lng: Some(lng),
            timestamp: epoch_ms(),
            vehicle_number: extras.vehicle_number.filter(|s| !s.trim().is_empty()),
            operator_name: extras.operator_name.filter(|s| !s.trim().is_empty()),
        };
        bounded("put_position", self.call_timeout, self.store.put_position(fix.clone())).await??;
        debug!(vehicle_id = %vehicle_id, lat = %lat, lng = %lng, "position_reported");
        Ok(fix)
    }

    pub async fn board(&self) -> FleetResult<LiveBoard> {
        let fixes =
            bounded("read_positions", self.call_timeout, self.store.read_positions()).await??;
        Ok(build_board(fixes, epoch_ms(), self.stale_after))
    }
}

/// Markers for every fresh fix with coordinates, sorted by vehicle id
pub fn build_board(
    fixes: Vec<PositionFix>,
    now_ms: u64,
    stale_after: Option<Duration>,
) -> LiveBoard {
    let max_age_ms = stale_after.map(|d| d.as_millis() as u64);
    let mut markers: Vec<LiveMarker> = fixes
        .into_iter()
        .filter(|fix| match max_age_ms {
            Some(max) => now_ms.saturating_sub(fix.timestamp) <= max,
            None => true,
        })
        .filter_map(|fix| {
            let location = GeoPoint::new(fix.lat?, fix.lng?);
            let label = fix.vehicle_number.clone().unwrap_or_else(|| fix.vehicle_id.to_string());
            Some(LiveMarker {
                vehicle_id: fix.vehicle_id,
                location,
                timestamp: fix.timestamp,
                label,
            })
        })
        .collect();
    markers.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));

    let status = if markers.is_empty() {
        "No live vehicles".to_string()
    } else {
        format!("{} active", markers.len())
    };
    LiveBoard { markers, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::audit::MemoryAuditSink;
    use crate::io::memory_store::MemoryStore;

    fn fix(id: &str, lat: Option<f64>, timestamp: u64) -> PositionFix {
        PositionFix {
            vehicle_id: VehicleId::from(id),
            lat,
            lng: Some(79.8),
            timestamp,
            vehicle_number: None,
            operator_name: None,
        }
    }

    #[test]
    fn test_board_filters_and_sorts() {
        let fixes = vec![
            fix("bus_2", Some(11.9), 9_000),
            fix("bus_1", Some(11.8), 10_000),
            fix("bus_3", None, 10_000),
            fix("bus_4", Some(11.7), 1_000),
        ];
        let board = build_board(fixes, 10_000, Some(Duration::from_secs(5)));
        let ids: Vec<&str> = board.markers.iter().map(|m| m.vehicle_id.as_str()).collect();
        assert_eq!(ids, vec!["bus_1", "bus_2"]);
        assert_eq!(board.status, "2 active");
    }

    #[test]
    fn test_board_without_staleness_keeps_old_fixes() {
        let board = build_board(vec![fix("bus_1", Some(1.0), 0)], u64::MAX, None);
        assert_eq!(board.markers.len(), 1);
        assert_eq!(build_board(Vec::new(), 0, None).status, "No live vehicles");
    }

    #[tokio::test]
    async fn test_report_overwrites_slot() {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let feed = LivePositionFeed::new(store, audit.clone(), None, Duration::from_secs(1));
        let bus = VehicleId::from("bus_1");

        feed.report(&bus, 11.0, 79.0, PositionExtras::default()).await.unwrap();
        let extras = PositionExtras { vehicle_number: Some("B1".into()), operator_name: None };
        feed.report(&bus, 12.0, 80.0, extras).await.unwrap();

        let board = feed.board().await.unwrap();
        assert_eq!(board.markers.len(), 1);
        assert_eq!(board.markers[0].location, GeoPoint::new(12.0, 80.0));
        assert_eq!(board.markers[0].label, "B1");

        let invalid = feed.report(&bus, 95.0, 0.0, PositionExtras::default()).await;
        assert!(matches!(invalid, Err(FleetError::Validation(_))));
        assert_eq!(audit.count_from("live"), 1);
    }
}
