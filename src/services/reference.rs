//! Reference sheet and bulk-input template
//!
//! The reference sheet lists every vehicle with its stops so that whoever
//! fills in an import file can copy exact bus numbers and stop names.

use crate::domain::records::Table;
use crate::domain::types::Vehicle;
use crate::services::cache::ChangeStreamCache;

pub const REFERENCE_HEADERS: [&str; 5] =
    ["BusDocId", "BusNumber", "RouteName", "StopId", "StopName"];

pub const TEMPLATE_HEADERS: [&str; 6] =
    ["StudentName", "ParentName", "Phone", "Class", "BusNumber", "BusStop"];

const TEMPLATE_SAMPLE: [&str; 6] = ["Student A", "Parent A", "9876543210", "5", "", ""];

/// One row per stop in route order; a vehicle without stops still gets a row
pub fn reference_rows(vehicles: &[Vehicle]) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    for vehicle in vehicles {
        let head = [vehicle.id.to_string(), vehicle.number.clone(), vehicle.route_name.clone()];
        if vehicle.stops.is_empty() {
            let mut row = head.to_vec();
            row.extend([String::new(), String::new()]);
            rows.push(row);
            continue;
        }

        let mut stops: Vec<_> = vehicle.stops.iter().collect();
        stops.sort_by_key(|s| s.order);
        for stop in stops {
            let mut row = head.to_vec();
            row.extend([stop.id.to_string(), stop.name.clone()]);
            rows.push(row);
        }
    }
    rows
}

pub fn reference_table(vehicles: &[Vehicle]) -> Table {
    let mut table = Table::new(REFERENCE_HEADERS.iter().map(|h| h.to_string()).collect());
    for row in reference_rows(vehicles) {
        table.push_row(row);
    }
    table
}

pub fn template_table() -> Table {
    let mut table = Table::new(TEMPLATE_HEADERS.iter().map(|h| h.to_string()).collect());
    table.push_row(TEMPLATE_SAMPLE.iter().map(|c| c.to_string()).collect());
    table
}

/// Reference table from the latest cached vehicles
pub fn export_from_cache(cache: &ChangeStreamCache) -> Table {
    reference_table(&cache.vehicles())
}
