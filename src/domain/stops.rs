//! Ordered stop-list edits
//!
//! Every function here is pure: it takes the current list and returns a new
//! one whose `order` values are exactly 1..N in list order. Storage and retry
//! live in `services::stop_mutator`.

use crate::domain::types::{GeoPoint, Stop, StopId};
use thiserror::Error;

/// A single edit to a vehicle's stop list
#[derive(Debug, Clone, PartialEq)]
pub enum StopEdit {
    /// Insert `stop` at the 1-based `position` (clamped), or append when `None`
    Insert { stop: Stop, position: Option<i64> },
    Remove { stop_id: StopId },
    Rename { stop_id: StopId, name: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StopEditError {
    #[error("stop not found: {0}")]
    StopNotFound(StopId),

    #[error("stop id already present: {0}")]
    DuplicateStop(StopId),

    #[error("stop name must not be empty")]
    EmptyName,

    #[error("invalid stop coordinate ({lat}, {lng})")]
    InvalidLocation { lat: f64, lng: f64 },
}

/// 0-based index at which an insert lands: `clamp(position - 1, 0, len)`
#[inline]
pub fn insertion_index(len: usize, position: Option<i64>) -> usize {
    match position {
        None => len,
        Some(p) => p.saturating_sub(1).clamp(0, len as i64) as usize,
    }
}

/// Assign orders 1..N following list order
pub fn renumber(stops: &mut [Stop]) {
    for (i, stop) in stops.iter_mut().enumerate() {
        stop.order = (i + 1) as u32;
    }
}

/// True when orders are exactly 1..N in list order
pub fn is_contiguous(stops: &[Stop]) -> bool {
    stops.iter().enumerate().all(|(i, s)| s.order == (i + 1) as u32)
}

/// Stable-sort by stored order, then renumber
///
/// Documents written by older clients may hold gaps or be out of order.
pub fn normalize(stops: &[Stop]) -> Vec<Stop> {
    let mut sorted = stops.to_vec();
    sorted.sort_by_key(|s| s.order);
    renumber(&mut sorted);
    sorted
}

/// Apply one edit, returning the new list
pub fn apply_edit(stops: &[Stop], edit: &StopEdit) -> Result<Vec<Stop>, StopEditError> {
    let mut list = normalize(stops);

    match edit {
        StopEdit::Insert { stop, position } => {
            validate_name(&stop.name)?;
            validate_location(&stop.location)?;
            if list.iter().any(|s| s.id == stop.id) {
                return Err(StopEditError::DuplicateStop(stop.id.clone()));
            }
            let idx = insertion_index(list.len(), *position);
            let mut new_stop = stop.clone();
            new_stop.name = new_stop.name.trim().to_string();
            list.insert(idx, new_stop);
        }
        StopEdit::Remove { stop_id } => {
            let idx = position_of(&list, stop_id)?;
            list.remove(idx);
        }
        StopEdit::Rename { stop_id, name } => {
            validate_name(name)?;
            let idx = position_of(&list, stop_id)?;
            list[idx].name = name.trim().to_string();
        }
    }

    renumber(&mut list);
    Ok(list)
}

fn position_of(stops: &[Stop], stop_id: &StopId) -> Result<usize, StopEditError> {
    stops
        .iter()
        .position(|s| &s.id == stop_id)
        .ok_or_else(|| StopEditError::StopNotFound(stop_id.clone()))
}

fn validate_name(name: &str) -> Result<(), StopEditError> {
    if name.trim().is_empty() {
        return Err(StopEditError::EmptyName);
    }
    Ok(())
}

fn validate_location(location: &GeoPoint) -> Result<(), StopEditError> {
    if !location.is_valid() {
        return Err(StopEditError::InvalidLocation { lat: location.lat, lng: location.lng });
    }
    Ok(())
}
