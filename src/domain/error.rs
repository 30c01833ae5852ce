//! Error taxonomy shared by the mutation engine, pipeline and directory

use crate::domain::stops::StopEditError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Classification used for audit events and import failure rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    ValidationError,
    ResolutionError,
    NotFoundError,
    ConflictError,
    ProvisioningError,
    TimeoutError,
    StoreError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "ValidationError",
            ErrorKind::ResolutionError => "ResolutionError",
            ErrorKind::NotFoundError => "NotFoundError",
            ErrorKind::ConflictError => "ConflictError",
            ErrorKind::ProvisioningError => "ProvisioningError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::StoreError => "StoreError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures reported by a remote store implementation
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("version mismatch on {collection}/{id}: expected {expected}, found {actual}")]
    VersionMismatch { collection: &'static str, id: String, expected: u64, actual: u64 },

    #[error("document {collection}/{id} does not exist")]
    Missing { collection: &'static str, id: String },

    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: &'static str, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures reported by the identity-provisioning collaborator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IdentityError {
    #[error("identity already exists for {0}")]
    AlreadyExists(String),

    #[error("identity rejected: {0}")]
    Rejected(String),

    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Resolution(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflicting writes on {entity} {id}: gave up after {attempts} attempts")]
    Conflict { entity: &'static str, id: String, attempts: u32 },

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FleetError {
    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        FleetError::NotFound { entity, id: id.to_string() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Validation(_) => ErrorKind::ValidationError,
            FleetError::Resolution(_) => ErrorKind::ResolutionError,
            FleetError::NotFound { .. } => ErrorKind::NotFoundError,
            FleetError::Conflict { .. } => ErrorKind::ConflictError,
            FleetError::Provisioning(_) => ErrorKind::ProvisioningError,
            FleetError::Timeout { .. } => ErrorKind::TimeoutError,
            FleetError::Store(_) => ErrorKind::StoreError,
        }
    }
}

impl From<IdentityError> for FleetError {
    fn from(err: IdentityError) -> Self {
        FleetError::Provisioning(err.to_string())
    }
}

impl From<StopEditError> for FleetError {
    fn from(err: StopEditError) -> Self {
        match err {
            StopEditError::StopNotFound(id) => FleetError::not_found("stop", id),
            other => FleetError::Validation(other.to_string()),
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(FleetError::Validation("x".into()).kind(), ErrorKind::ValidationError);
        assert_eq!(FleetError::not_found("vehicle", "bus_1").kind(), ErrorKind::NotFoundError);
        assert_eq!(
            FleetError::from(IdentityError::AlreadyExists("a@b".into())).kind(),
            ErrorKind::ProvisioningError
        );
        assert_eq!(
            FleetError::from(StoreError::Unavailable("down".into())).kind(),
            ErrorKind::StoreError
        );
    }

    #[test]
    fn test_stop_edit_mapping() {
        let err = FleetError::from(StopEditError::StopNotFound("s9".into()));
        assert_eq!(err.kind(), ErrorKind::NotFoundError);
        assert_eq!(FleetError::from(StopEditError::EmptyName).kind(), ErrorKind::ValidationError);
    }

    #[test]
    fn test_not_found_message() {
        let err = FleetError::not_found("stop", "stop_1");
        assert_eq!(err.to_string(), "stop not found: stop_1");
    }
}
