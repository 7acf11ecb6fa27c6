//! # strata-types: Core types for `Strata`
//!
//! This crate contains shared types used across the `Strata` controller:
//! - Entity IDs ([`DnodeId`], [`VGroupId`], [`TableId`], [`SlotId`])
//! - Replica state ([`ReplicaRole`], [`VGroupStatus`])
//! - Wire result codes ([`StatusCode`])
//! - Cluster limits ([`MAX_REPLICAS`])

use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

// ============================================================================
// Limits
// ============================================================================

/// Upper bound on the number of replica slots in one vgroup.
pub const MAX_REPLICAS: usize = 5;

// ============================================================================
// Entity IDs - All Copy (cheap 4/8-byte values)
// ============================================================================

/// Identifier of a storage node (dnode) in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DnodeId(u32);

impl DnodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for DnodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DnodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<DnodeId> for u32 {
    fn from(id: DnodeId) -> Self {
        id.0
    }
}

/// Identifier of a virtual group, assigned by the object store on insert.
///
/// Zero is never handed out; a record carrying `VGroupId::UNASSIGNED` has
/// not been inserted yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct VGroupId(u32);

impl VGroupId {
    pub const UNASSIGNED: VGroupId = VGroupId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns true once the object store has assigned this id.
    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }

    /// Returns the id that follows this one, or `None` once the id space
    /// is exhausted.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl Display for VGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for VGroupId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<VGroupId> for u32 {
    fn from(id: VGroupId) -> Self {
        id.0
    }
}

/// Unique identifier of a child table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(u64);

impl TableId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TableId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<TableId> for u64 {
    fn from(id: TableId) -> Self {
        id.0
    }
}

/// Position of a table inside its vgroup's table-slot array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(u32);

impl SlotId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Converts a raw wire slot id; negative values mean "no slot".
    pub fn from_raw(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }

    /// Returns the slot as a `usize` for indexing.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SlotId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

// ============================================================================
// Replica State
// ============================================================================

/// Runtime role of one replica, as reported by the dnode hosting it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum ReplicaRole {
    /// No report yet, or the replica has not caught up.
    #[default]
    Unsynced,
    Follower,
    Leader,
}

impl ReplicaRole {
    /// Name used by the administrative read path.
    pub fn as_str(self) -> &'static str {
        match self {
            ReplicaRole::Unsynced => "unsynced",
            ReplicaRole::Follower => "follower",
            ReplicaRole::Leader => "leader",
        }
    }
}

impl Display for ReplicaRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a vgroup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum VGroupStatus {
    #[default]
    Ready,
    /// Membership change in flight.
    Updating,
}

impl VGroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VGroupStatus::Ready => "ready",
            VGroupStatus::Updating => "updating",
        }
    }
}

impl Display for VGroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Result code exchanged with dnodes and delivered to waiting callers.
///
/// Known codes have their own variant; anything else a dnode sends back is
/// kept verbatim in [`StatusCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Success,
    InvalidDb,
    OutOfMemory,
    NoEnoughDnodes,
    SdbError,
    InvalidTableId,
    NotActiveVnode,
    InvalidReplica,
    Timeout,
    NetworkUnavailable,
    CodecError,
    InvalidVgroupId,
    Other(i32),
}

impl StatusCode {
    const TABLE: [(StatusCode, i32); 12] = [
        (StatusCode::Success, 0),
        (StatusCode::InvalidDb, 0x0100),
        (StatusCode::OutOfMemory, 0x0101),
        (StatusCode::NoEnoughDnodes, 0x0102),
        (StatusCode::SdbError, 0x0103),
        (StatusCode::InvalidTableId, 0x0104),
        (StatusCode::NotActiveVnode, 0x0105),
        (StatusCode::InvalidReplica, 0x0106),
        (StatusCode::Timeout, 0x0107),
        (StatusCode::NetworkUnavailable, 0x0108),
        (StatusCode::CodecError, 0x0109),
        (StatusCode::InvalidVgroupId, 0x010A),
    ];

    /// Decodes a raw wire code.
    pub fn from_raw(raw: i32) -> Self {
        Self::TABLE
            .iter()
            .find(|(_, code)| *code == raw)
            .map_or(StatusCode::Other(raw), |(status, _)| *status)
    }

    /// Encodes this status as a raw wire code.
    pub fn as_raw(self) -> i32 {
        match self {
            StatusCode::Other(raw) => raw,
            known => Self::TABLE
                .iter()
                .find(|(status, _)| *status == known)
                .map_or(-1, |(_, code)| *code),
        }
    }

    pub fn is_success(self) -> bool {
        self == StatusCode::Success
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusCode::Success => f.write_str("success"),
            StatusCode::InvalidDb => f.write_str("invalid database"),
            StatusCode::OutOfMemory => f.write_str("out of memory"),
            StatusCode::NoEnoughDnodes => f.write_str("not enough dnodes"),
            StatusCode::SdbError => f.write_str("object store error"),
            StatusCode::InvalidTableId => f.write_str("invalid table id"),
            StatusCode::NotActiveVnode => f.write_str("vnode not active"),
            StatusCode::InvalidReplica => f.write_str("invalid replica count"),
            StatusCode::Timeout => f.write_str("timed out"),
            StatusCode::NetworkUnavailable => f.write_str("network unavailable"),
            StatusCode::CodecError => f.write_str("codec error"),
            StatusCode::InvalidVgroupId => f.write_str("invalid vgroup id"),
            StatusCode::Other(raw) => write!(f, "code {raw:#06x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(ReplicaRole::Unsynced, "unsynced")]
    #[test_case(ReplicaRole::Follower, "follower")]
    #[test_case(ReplicaRole::Leader, "leader")]
    fn replica_role_names(role: ReplicaRole, expected: &str) {
        assert_eq!(role.as_str(), expected);
        assert_eq!(role.to_string(), expected);
    }

    #[test_case(VGroupStatus::Ready, "ready")]
    #[test_case(VGroupStatus::Updating, "updating")]
    fn vgroup_status_names(status: VGroupStatus, expected: &str) {
        assert_eq!(status.as_str(), expected);
    }

    #[test]
    fn default_role_is_unsynced() {
        assert_eq!(ReplicaRole::default(), ReplicaRole::Unsynced);
    }

    #[test]
    fn negative_raw_slot_is_none() {
        assert_eq!(SlotId::from_raw(-1), None);
        assert_eq!(SlotId::from_raw(7), Some(SlotId::new(7)));
    }

    #[test]
    fn unassigned_vgroup_id() {
        assert!(!VGroupId::UNASSIGNED.is_assigned());
        assert_eq!(VGroupId::UNASSIGNED.next(), Some(VGroupId::new(1)));
        assert!(VGroupId::UNASSIGNED.next().is_some_and(VGroupId::is_assigned));
        assert_eq!(VGroupId::new(u32::MAX).next(), None);
    }

    #[test]
    fn known_status_codes_keep_their_variant() {
        for (status, raw) in StatusCode::TABLE {
            assert_eq!(StatusCode::from_raw(raw), status);
            assert_eq!(status.as_raw(), raw);
        }
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        let json = serde_json::to_string(&VGroupId::new(12)).unwrap();
        assert_eq!(json, "12");
    }

    proptest! {
        #[test]
        fn prop_unknown_raw_codes_survive(raw in 0x1000i32..0x7fff_ffff) {
            let status = StatusCode::from_raw(raw);
            prop_assert_eq!(status, StatusCode::Other(raw));
            prop_assert_eq!(status.as_raw(), raw);
            prop_assert!(!status.is_success());
        }
    }
}
