//! Immutable per-collection snapshots handed to cache observers

use crate::domain::types::{CollectionKind, Guardian, Operator, Vehicle};
use std::sync::Arc;

/// Latest known contents of one collection
///
/// Cloning is cheap: entities sit behind a shared slice.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Vehicles(Arc<[Vehicle]>),
    Operators(Arc<[Operator]>),
    Guardians(Arc<[Guardian]>),
}

impl Snapshot {
    pub fn empty(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Vehicles => Snapshot::Vehicles(Arc::from(Vec::new())),
            CollectionKind::Operators => Snapshot::Operators(Arc::from(Vec::new())),
            CollectionKind::Guardians => Snapshot::Guardians(Arc::from(Vec::new())),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        match self {
            Snapshot::Vehicles(_) => CollectionKind::Vehicles,
            Snapshot::Operators(_) => CollectionKind::Operators,
            Snapshot::Guardians(_) => CollectionKind::Guardians,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Vehicles(v) => v.len(),
            Snapshot::Operators(o) => o.len(),
            Snapshot::Guardians(g) => g.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vehicles(&self) -> Option<&Arc<[Vehicle]>> {
        match self {
            Snapshot::Vehicles(v) => Some(v),
            _ => None,
        }
    }

    pub fn operators(&self) -> Option<&Arc<[Operator]>> {
        match self {
            Snapshot::Operators(o) => Some(o),
            _ => None,
        }
    }

    pub fn guardians(&self) -> Option<&Arc<[Guardian]>> {
        match self {
            Snapshot::Guardians(g) => Some(g),
            _ => None,
        }
    }
}

impl From<Vec<Vehicle>> for Snapshot {
    fn from(v: Vec<Vehicle>) -> Self {
        Snapshot::Vehicles(Arc::from(v))
    }
}

impl From<Vec<Operator>> for Snapshot {
    fn from(o: Vec<Operator>) -> Self {
        Snapshot::Operators(Arc::from(o))
    }
}

impl From<Vec<Guardian>> for Snapshot {
    fn from(g: Vec<Guardian>) -> Self {
        Snapshot::Guardians(Arc::from(g))
    }
}
