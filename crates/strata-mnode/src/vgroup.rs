//! VGroup records and their replica slots.
//!
//! A [`VGroup`] has a persisted part (id, database, membership, status,
//! stats) and a runtime part rebuilt by the lifecycle hooks on every insert
//! or update: each slot's weak dnode reference and role, the leader index,
//! the owning database and the table-slot allocator.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use strata_types::{DnodeId, MAX_REPLICAS, ReplicaRole, VGroupId, VGroupStatus};

use crate::db::Database;
use crate::dnode::{Dnode, DnodeRegistry};
use crate::error::{Result, VGroupError};
use crate::slots::TableSlots;

// ============================================================================
// Replica Slot
// ============================================================================

/// One (dnode, role) member of a vgroup.
#[derive(Debug, Clone, Default)]
pub struct ReplicaSlot {
    pub dnode_id: DnodeId,
    pub role: ReplicaRole,
    dnode: Option<Weak<Dnode>>,
}

impl ReplicaSlot {
    pub fn new(dnode_id: DnodeId) -> Self {
        Self {
            dnode_id,
            role: ReplicaRole::Unsynced,
            dnode: None,
        }
    }

    /// Looks the dnode up and, if found, counts this slot against it.
    ///
    /// Any previous resolution is released first so a slot never counts
    /// twice.
    pub(crate) fn resolve(&mut self, registry: &DnodeRegistry) -> bool {
        self.release();
        match registry.get(self.dnode_id) {
            Some(dnode) => {
                dnode.inc_open_vnodes();
                self.dnode = Some(Arc::downgrade(&dnode));
                true
            }
            None => {
                tracing::warn!(dnode = %self.dnode_id, "replica slot references unknown dnode");
                false
            }
        }
    }

    /// Drops the weak reference and undoes its counter increment. Unresolved
    /// slots and dnodes that no longer exist are skipped.
    pub(crate) fn release(&mut self) {
        if let Some(dnode) = self.dnode.take().and_then(|weak| weak.upgrade()) {
            dnode.dec_open_vnodes();
        }
    }

    /// Live dnode behind this slot.
    pub fn dnode(&self) -> Option<Arc<Dnode>> {
        self.dnode.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_resolved(&self) -> bool {
        self.dnode().is_some()
    }

    pub fn is_hosted_on(&self, dnode: &Arc<Dnode>) -> bool {
        self.dnode
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(dnode)))
    }
}

// ============================================================================
// VGroup
// ============================================================================

/// Cumulative storage statistics, as last reported by the leader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VGroupStats {
    pub total_storage: i64,
    pub comp_storage: i64,
    pub points_written: i64,
}

/// A virtual group: one replicated storage unit.
#[derive(Debug, Default)]
pub struct VGroup {
    pub vg_id: VGroupId,
    pub db_name: String,
    pub replica_count: usize,
    pub slots: Vec<ReplicaSlot>,
    pub leader_index: Option<usize>,
    pub status: VGroupStatus,
    pub created_at_ms: u64,
    pub stats: VGroupStats,
    pub(crate) db: Option<Arc<Database>>,
    pub(crate) tables: Option<TableSlots>,
}

impl VGroup {
    /// A fresh, unplaced record. Slots are filled by the placement policy.
    pub fn new(db_name: impl Into<String>, replica_count: usize, created_at_ms: u64) -> Self {
        Self {
            db_name: db_name.into(),
            replica_count,
            created_at_ms,
            ..Self::default()
        }
    }

    /// A record with the given membership, as if placement had run.
    pub fn with_members(
        db_name: impl Into<String>,
        members: &[DnodeId],
        created_at_ms: u64,
    ) -> Self {
        let mut vgroup = Self::new(db_name, members.len(), created_at_ms);
        vgroup.slots = members.iter().copied().map(ReplicaSlot::new).collect();
        vgroup
    }

    pub fn table_count(&self) -> u32 {
        self.tables.as_ref().map_or(0, TableSlots::len)
    }

    pub fn table_capacity(&self) -> u32 {
        self.tables.as_ref().map_or(0, TableSlots::capacity)
    }

    pub fn tables(&self) -> Option<&TableSlots> {
        self.tables.as_ref()
    }

    /// Owning database, once inserted.
    pub fn database(&self) -> Option<&Arc<Database>> {
        self.db.as_ref()
    }

    pub fn member_ids(&self) -> Vec<DnodeId> {
        self.slots.iter().map(|slot| slot.dnode_id).collect()
    }

    /// Live dnodes of every resolved slot, in slot order.
    pub fn resolved_dnodes(&self) -> Vec<Arc<Dnode>> {
        self.slots.iter().filter_map(ReplicaSlot::dnode).collect()
    }

    /// Index of the slot hosted on `dnode`.
    pub fn slot_of(&self, dnode: &Arc<Dnode>) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_hosted_on(dnode))
    }

    /// Marks slot `idx` as leader, demoting any other slot still marked so.
    pub fn set_leader(&mut self, idx: usize) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if i == idx {
                slot.role = ReplicaRole::Leader;
            } else if slot.role == ReplicaRole::Leader {
                slot.role = ReplicaRole::Follower;
            }
        }
        self.leader_index = Some(idx);
    }

    /// A detached copy of the persisted fields, with no runtime state.
    pub fn persisted_copy(&self) -> Self {
        Self::from_row(self.to_row())
    }

    /// Persisted projection.
    pub fn to_row(&self) -> VGroupRow {
        VGroupRow {
            vg_id: self.vg_id,
            db_name: self.db_name.clone(),
            replica_count: self.replica_count,
            members: self.member_ids(),
            status: self.status,
            created_at_ms: self.created_at_ms,
            stats: self.stats,
        }
    }

    /// Rebuilds a record from its projection. Roles, node links, leader and
    /// tables stay empty until the insert hook resolves them.
    pub fn from_row(row: VGroupRow) -> Self {
        Self {
            vg_id: row.vg_id,
            db_name: row.db_name,
            replica_count: row.replica_count,
            slots: row.members.into_iter().map(ReplicaSlot::new).collect(),
            leader_index: None,
            status: row.status,
            created_at_ms: row.created_at_ms,
            stats: row.stats,
            db: None,
            tables: None,
        }
    }

    /// Copies the persisted fields of `other` into `self`, leaving runtime
    /// state alone.
    pub(crate) fn overwrite_persisted(&mut self, other: VGroup) {
        self.db_name = other.db_name;
        self.replica_count = other.replica_count;
        self.slots = other
            .slots
            .into_iter()
            .map(|slot| ReplicaSlot::new(slot.dnode_id))
            .collect();
        self.leader_index = None;
        self.status = other.status;
        self.created_at_ms = other.created_at_ms;
        self.stats = other.stats;
    }

    /// Fails unless there are exactly `replica_count` slots and the count is
    /// within `1..=MAX_REPLICAS`.
    pub fn check_membership(&self) -> Result<()> {
        if !(1..=MAX_REPLICAS).contains(&self.replica_count) {
            return Err(VGroupError::InvalidReplicaCount(self.replica_count));
        }
        if self.slots.len() != self.replica_count {
            return Err(VGroupError::MembershipMismatch {
                vg_id: self.vg_id,
                replica_count: self.replica_count,
                slots: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Swaps in the membership of `other`, moving counter increments from
    /// the old dnodes to the new ones. Status, stats and tables stay.
    pub(crate) fn adopt_membership(&mut self, other: &VGroup, registry: &DnodeRegistry) {
        self.release_slots();
        self.replica_count = other.replica_count;
        self.slots = other
            .slots
            .iter()
            .map(|slot| ReplicaSlot::new(slot.dnode_id))
            .collect();
        self.leader_index = None;
        self.resolve_slots(registry);
    }

    pub(crate) fn resolve_slots(&mut self, registry: &DnodeRegistry) {
        for slot in &mut self.slots {
            slot.resolve(registry);
        }
    }

    pub(crate) fn release_slots(&mut self) {
        for slot in &mut self.slots {
            slot.release();
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(&self.to_row()).map_err(|e| VGroupError::Codec(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes::<VGroupRow>(bytes)
            .map(Self::from_row)
            .map_err(|e| VGroupError::Codec(e.to_string()))
    }
}

/// The part of a [`VGroup`] that is persisted.
///
/// Members are stored by id only; roles and dnode links are never trusted
/// from storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VGroupRow {
    pub vg_id: VGroupId,
    pub db_name: String,
    pub replica_count: usize,
    pub members: Vec<DnodeId>,
    pub status: VGroupStatus,
    pub created_at_ms: u64,
    pub stats: VGroupStats,
}
