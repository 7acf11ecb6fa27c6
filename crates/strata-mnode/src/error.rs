//! Error types for vgroup management.

use strata_types::{DnodeId, MAX_REPLICAS, StatusCode, VGroupId};
use thiserror::Error;

/// Vgroup management errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VGroupError {
    /// The owning database of a record could not be resolved.
    #[error("database {0} not found")]
    InvalidDatabase(String),

    /// The per-vgroup table-slot structures could not be sized.
    #[error("vgroup {vg_id}: failed to allocate {capacity} table slots")]
    AllocationFailure { vg_id: VGroupId, capacity: u32 },

    /// Placement could not satisfy the replication factor.
    #[error("not enough dnodes to place {needed} replicas ({available} available)")]
    InsufficientNodes { needed: usize, available: usize },

    /// The object store rejected an insert, update or delete.
    #[error("object store error: {0}")]
    Storage(String),

    /// A table lookup hit something that does not live in a vgroup.
    #[error("invalid table reference: {0}")]
    InvalidTableReference(String),

    /// A dnode asked about a replica the controller does not know.
    #[error("dnode {dnode_id} has no active replica of vgroup {vg_id}")]
    NotActiveReplica { dnode_id: DnodeId, vg_id: VGroupId },

    /// Replication factor outside `1..=MAX_REPLICAS`.
    #[error("replica count {0} outside 1..={MAX_REPLICAS}")]
    InvalidReplicaCount(usize),

    /// A record's membership disagrees with its replication factor.
    #[error("vgroup {vg_id} has {slots} replica slots but replica count {replica_count}")]
    MembershipMismatch {
        vg_id: VGroupId,
        replica_count: usize,
        slots: usize,
    },

    /// A replacement record tried to move a vgroup to another database.
    #[error("vgroup {vg_id} belongs to {current}, not {requested}")]
    DatabaseChange {
        vg_id: VGroupId,
        current: String,
        requested: String,
    },

    #[error("vgroup {0} not found")]
    UnknownVGroup(VGroupId),

    /// A membership change is already running for this vgroup.
    #[error("vgroup {0} is already being reconfigured")]
    ReconfigurationInProgress(VGroupId),

    /// A dnode answered with a non-success code.
    #[error("dnode returned {0}")]
    Remote(StatusCode),

    /// A fan-out did not collect all responses before its deadline.
    #[error("fan-out for vgroup {0} timed out")]
    Timeout(VGroupId),

    /// Persisted row or wire message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl VGroupError {
    /// Wire code reported to callers and dnodes for this error.
    pub fn code(&self) -> StatusCode {
        match self {
            VGroupError::InvalidDatabase(_) => StatusCode::InvalidDb,
            VGroupError::AllocationFailure { .. } => StatusCode::OutOfMemory,
            VGroupError::InsufficientNodes { .. } => StatusCode::NoEnoughDnodes,
            VGroupError::Storage(_) => StatusCode::SdbError,
            VGroupError::InvalidTableReference(_) => StatusCode::InvalidTableId,
            VGroupError::NotActiveReplica { .. } => StatusCode::NotActiveVnode,
            VGroupError::InvalidReplicaCount(_) | VGroupError::MembershipMismatch { .. } => {
                StatusCode::InvalidReplica
            }
            VGroupError::DatabaseChange { .. } => StatusCode::InvalidDb,
            VGroupError::UnknownVGroup(_) | VGroupError::ReconfigurationInProgress(_) => {
                StatusCode::InvalidVgroupId
            }
            VGroupError::Remote(code) => *code,
            VGroupError::Timeout(_) => StatusCode::Timeout,
            VGroupError::Codec(_) => StatusCode::CodecError,
        }
    }

    /// Converts the first failure a fan-out observed into the caller's error.
    pub fn from_status(code: StatusCode, vg_id: VGroupId) -> Self {
        match code {
            StatusCode::Timeout => VGroupError::Timeout(vg_id),
            other => VGroupError::Remote(other),
        }
    }
}

/// Result type for vgroup operations.
pub type Result<T> = std::result::Result<T, VGroupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_status_maps_to_timeout_error() {
        let err = VGroupError::from_status(StatusCode::Timeout, VGroupId::new(4));
        assert_eq!(err, VGroupError::Timeout(VGroupId::new(4)));
        assert_eq!(err.code(), StatusCode::Timeout);
    }

    #[test]
    fn remote_codes_pass_through() {
        let code = StatusCode::Other(0x2001);
        let err = VGroupError::from_status(code, VGroupId::new(1));
        assert_eq!(err.code(), code);
    }

    #[test]
    fn storage_error_uses_sdb_code() {
        let err = VGroupError::Storage("disk full".to_string());
        assert_eq!(err.code(), StatusCode::SdbError);
        assert_eq!(err.to_string(), "object store error: disk full");
    }
}
