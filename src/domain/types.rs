//! Shared entity types for the fleet directory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a string-backed identifier newtype
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Vehicle document id
    VehicleId
);
string_id!(
    /// Stop id, unique within its vehicle
    StopId
);
string_id!(
    /// Operator document id (equal to the operator's identity id)
    OperatorId
);
string_id!(
    /// Guardian document id (equal to the guardian's identity id)
    GuardianId
);

/// Generate a prefixed, time-sortable id (e.g. `stop_0190...`)
pub fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::now_v7().simple())
}

/// The remote collections mirrored by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Vehicles,
    Operators,
    Guardians,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] =
        [CollectionKind::Vehicles, CollectionKind::Operators, CollectionKind::Guardians];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::Vehicles => "vehicles",
            CollectionKind::Operators => "operators",
            CollectionKind::Guardians => "guardians",
        }
    }

    /// Dense index for per-kind arrays
    #[inline]
    pub(crate) fn index(&self) -> usize {
        match self {
            CollectionKind::Vehicles => 0,
            CollectionKind::Operators => 1,
            CollectionKind::Guardians => 2,
        }
    }
}

impl std::fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and within the WGS84 range
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A named stop with its 1-based position on the vehicle's route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub name: String,
    pub location: GeoPoint,
    pub order: u32,
}

/// Denormalized operator reference held on a vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRef {
    pub id: OperatorId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: VehicleId,
    /// Display number painted on the vehicle (e.g. "B1")
    pub number: String,
    #[serde(default)]
    pub route_name: String,
    #[serde(default)]
    pub stops: Vec<Stop>,
    #[serde(default)]
    pub operator: Option<OperatorRef>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub color_code: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Vehicle {
    pub fn new(id: VehicleId, number: impl Into<String>, route_name: impl Into<String>) -> Self {
        Self {
            id,
            number: number.into(),
            route_name: route_name.into(),
            stops: Vec::new(),
            operator: None,
            capacity: None,
            color_code: None,
            created_at: Some(Utc::now()),
        }
    }

    pub fn stop(&self, stop_id: &StopId) -> Option<&Stop> {
        self.stops.iter().find(|s| &s.id == stop_id)
    }

    pub fn operator_id(&self) -> Option<&OperatorId> {
        self.operator.as_ref().map(|o| &o.id)
    }

    /// Label used in listings: display number, falling back to the id
    pub fn label(&self) -> &str {
        if self.number.trim().is_empty() {
            self.id.as_str()
        } else {
            &self.number
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub id: OperatorId,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub login_key: String,
    #[serde(default)]
    pub assigned_vehicle: Option<VehicleId>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guardian {
    pub id: GuardianId,
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub login_key: String,
    pub student_name: String,
    #[serde(default)]
    pub student_class: String,
    pub vehicle_id: VehicleId,
    pub stop_id: StopId,
    /// Display copies taken at write time; not refreshed when the source changes
    #[serde(default)]
    pub vehicle_number: String,
    #[serde(default)]
    pub route_name: String,
    #[serde(default)]
    pub stop_name: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Last reported position of a vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionFix {
    pub vehicle_id: VehicleId,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    /// Epoch milliseconds
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_name: Option<String>,
}

/// Current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_prefix_and_uniqueness() {
        let a = generate_id("stop");
        let b = generate_id("stop");
        assert!(a.starts_with("stop_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(11.94, 79.80).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -181.0).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_vehicle_serializes_camel_case() {
        let mut vehicle = Vehicle::new(VehicleId::from("bus_1"), "B1", "North loop");
        vehicle.created_at = None;
        let json = serde_json::to_value(&vehicle).unwrap();
        assert_eq!(json["id"], "bus_1");
        assert_eq!(json["routeName"], "North loop");
        assert!(json["stops"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_vehicle_label_falls_back_to_id() {
        let vehicle = Vehicle::new(VehicleId::from("bus_9"), "  ", "");
        assert_eq!(vehicle.label(), "bus_9");
    }

    #[test]
    fn test_collection_kind_index_is_dense() {
        let indexes: Vec<usize> = CollectionKind::ALL.iter().map(|k| k.index()).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }
}
