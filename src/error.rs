//! Error types for metacluster operations
//!
//! Recoverable classes (capacity exhaustion, restore collisions, not-found
//! during cleanup) are matched by variant at the call sites that expect them.
//! Anything else propagates and aborts the run.

use std::fmt;

use crate::model::TenantId;

/// Errors surfaced by the directory, data-cluster, and backup APIs
#[derive(Debug, Clone)]
pub enum MetaclusterError {
    /// Transient transaction conflict; retried transparently by `with_retry`
    TransactionConflict,

    /// No data cluster has spare group capacity for a new tenant
    MetaclusterNoCapacity,

    /// The tenant's assigned cluster has no spare group capacity
    ClusterNoCapacity { cluster: String },

    /// A tenant with this name already exists in the directory
    TenantAlreadyExists { name: String },

    /// No tenant with this name exists in the directory
    TenantNotFound { name: String },

    /// A tenant group constraint was violated
    InvalidTenantConfiguration { reason: String },

    /// A data cluster with this name is already registered
    ClusterAlreadyExists { name: String },

    /// No data cluster with this name is registered
    ClusterNotFound { name: String },

    /// The data cluster belongs to a different metacluster; joining requires force
    ClusterAlreadyRegistered { name: String },

    /// The management cluster already carries a metacluster registration
    MetaclusterAlreadyExists,

    /// A backup for this cluster is already running
    BackupAlreadyRunning { cluster: String },

    /// No backup stored under this location
    BackupNotFound { location: String },

    /// The caller is not allowed to act on this tenant
    PermissionDenied { tenant: TenantId },

    /// Failed to serialize or deserialize cluster state
    SerializationError { reason: String },
}

impl MetaclusterError {
    /// Whether the transaction helper may transparently retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, MetaclusterError::TransactionConflict)
    }
}

impl fmt::Display for MetaclusterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaclusterError::TransactionConflict => {
                write!(f, "Transaction conflict")
            }
            MetaclusterError::MetaclusterNoCapacity => {
                write!(f, "No data cluster has spare tenant group capacity")
            }
            MetaclusterError::ClusterNoCapacity { cluster } => {
                write!(f, "Data cluster '{}' has no spare tenant group capacity", cluster)
            }
            MetaclusterError::TenantAlreadyExists { name } => {
                write!(f, "Tenant '{}' already exists", name)
            }
            MetaclusterError::TenantNotFound { name } => {
                write!(f, "Tenant '{}' not found", name)
            }
            MetaclusterError::InvalidTenantConfiguration { reason } => {
                write!(f, "Invalid tenant configuration: {}", reason)
            }
            MetaclusterError::ClusterAlreadyExists { name } => {
                write!(f, "Data cluster '{}' is already registered", name)
            }
            MetaclusterError::ClusterNotFound { name } => {
                write!(f, "Data cluster '{}' not found", name)
            }
            MetaclusterError::ClusterAlreadyRegistered { name } => {
                write!(
                    f,
                    "Data cluster '{}' is registered to a different metacluster",
                    name
                )
            }
            MetaclusterError::MetaclusterAlreadyExists => {
                write!(f, "A metacluster registration already exists")
            }
            MetaclusterError::BackupAlreadyRunning { cluster } => {
                write!(f, "A backup is already running for cluster '{}'", cluster)
            }
            MetaclusterError::BackupNotFound { location } => {
                write!(f, "No backup stored at location '{}'", location)
            }
            MetaclusterError::PermissionDenied { tenant } => {
                write!(f, "Caller is not authorized to act on tenant {}", tenant)
            }
            MetaclusterError::SerializationError { reason } => {
                write!(f, "Failed to serialize cluster state: {}", reason)
            }
        }
    }
}

impl std::error::Error for MetaclusterError {}

pub type Result<T> = std::result::Result<T, MetaclusterError>;
