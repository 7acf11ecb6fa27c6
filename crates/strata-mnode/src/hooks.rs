//! Lifecycle hooks that keep a vgroup's runtime state in step with its
//! persisted projection.

use std::sync::Arc;

use bytes::Bytes;
use strata_types::VGroupId;

use crate::db::DatabaseRegistry;
use crate::dnode::DnodeRegistry;
use crate::error::{Result, VGroupError};
use crate::sdb::TableActions;
use crate::slots::TableSlots;
use crate::vgroup::VGroup;

/// The vgroup table's hooks.
pub struct VGroupActions {
    dbs: Arc<DatabaseRegistry>,
    dnodes: Arc<DnodeRegistry>,
}

impl VGroupActions {
    pub fn new(dbs: Arc<DatabaseRegistry>, dnodes: Arc<DnodeRegistry>) -> Self {
        Self { dbs, dnodes }
    }

    /// Follows a change of the database's per-vgroup capacity.
    fn resize_tables(vgroup: &mut VGroup) -> Result<()> {
        let Some(db) = vgroup.db.as_ref() else {
            return Ok(());
        };
        let wanted = db.max_tables_per_vgroup();
        let vg_id = vgroup.vg_id;
        match vgroup.tables.as_mut() {
            Some(tables) if tables.capacity() != wanted => {
                let old = tables.capacity();
                let dropped = tables.resize(vg_id, wanted)?;
                tracing::info!(
                    vg_id = %vg_id,
                    old_capacity = old,
                    new_capacity = wanted,
                    dropped,
                    "vgroup table capacity changed"
                );
            }
            Some(_) => {}
            None => vgroup.tables = Some(TableSlots::with_capacity(vg_id, wanted)?),
        }
        Ok(())
    }
}

impl TableActions for VGroupActions {
    type Key = VGroupId;
    type Row = VGroup;
    const NAME: &'static str = "vgroups";

    fn key(&self, row: &VGroup) -> Option<VGroupId> {
        row.vg_id.is_assigned().then_some(row.vg_id)
    }

    fn assign_key(&self, row: &mut VGroup, key: VGroupId) {
        row.vg_id = key;
    }

    fn next_key(&self, last: Option<VGroupId>) -> Option<VGroupId> {
        last.unwrap_or(VGroupId::UNASSIGNED).next()
    }

    fn on_insert(&self, vgroup: &mut VGroup) -> Result<()> {
        let db = self
            .dbs
            .get(&vgroup.db_name)
            .ok_or_else(|| VGroupError::InvalidDatabase(vgroup.db_name.clone()))?;
        vgroup.check_membership()?;

        // A row put back after a failed reload keeps its table slots.
        let tables = match vgroup.tables.take() {
            Some(tables) => tables,
            None => TableSlots::with_capacity(vgroup.vg_id, db.max_tables_per_vgroup())?,
        };

        vgroup.resolve_slots(&self.dnodes);
        db.link_vgroup(vgroup.vg_id);
        vgroup.tables = Some(tables);
        vgroup.db = Some(db);

        tracing::debug!(
            vg_id = %vgroup.vg_id,
            db = %vgroup.db_name,
            replicas = vgroup.replica_count,
            "vgroup inserted"
        );
        Ok(())
    }

    fn on_delete(&self, vgroup: &mut VGroup) {
        if let Some(db) = vgroup.db.take() {
            db.unlink_vgroup(vgroup.vg_id);
        }
        vgroup.release_slots();
        tracing::debug!(vg_id = %vgroup.vg_id, "vgroup deleted");
    }

    fn on_update(&self, vgroup: &mut VGroup, replacement: Option<VGroup>) -> Result<()> {
        if let Some(new) = replacement {
            if new.db_name != vgroup.db_name {
                return Err(VGroupError::DatabaseChange {
                    vg_id: vgroup.vg_id,
                    current: vgroup.db_name.clone(),
                    requested: new.db_name,
                });
            }
            new.check_membership()?;
            vgroup.release_slots();
            vgroup.overwrite_persisted(new);
            vgroup.resolve_slots(&self.dnodes);
        }
        Self::resize_tables(vgroup)?;
        tracing::trace!(vg_id = %vgroup.vg_id, status = %vgroup.status, "vgroup updated");
        Ok(())
    }

    fn encode(&self, vgroup: &VGroup) -> Result<Bytes> {
        vgroup.encode().map(Bytes::from)
    }

    fn decode(&self, bytes: &[u8]) -> Result<VGroup> {
        VGroup::decode(bytes)
    }

    fn destroy(&self, mut vgroup: VGroup) {
        vgroup.tables = None;
        tracing::trace!(vg_id = %vgroup.vg_id, "vgroup destroyed");
    }
}
