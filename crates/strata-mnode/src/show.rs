//! Administrative listing of a database's vgroups.

use strata_types::{DnodeId, VGroupId};

use crate::error::{Result, VGroupError};
use crate::manager::VGroupManager;
use crate::sdb::lock_row;

const NULL: &str = "null";

/// Kind of table a listing is narrowed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Super tables are templates and live in no vgroup.
    Super,
    Child { vg_id: VGroupId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowFilter {
    All,
    /// Only the vgroup holding this table.
    Table(TableKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaShow {
    pub dnode_id: Option<DnodeId>,
    pub addr: String,
    pub role: String,
}

impl ReplicaShow {
    fn null() -> Self {
        Self {
            dnode_id: None,
            addr: NULL.to_string(),
            role: NULL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VGroupShowRow {
    pub vg_id: VGroupId,
    pub tables: u32,
    pub status: String,
    pub replicas: Vec<ReplicaShow>,
}

impl VGroupManager {
    /// Lists the vgroups of `db_name`, head of its index first. Every row
    /// has as many replica columns as the widest vgroup listed.
    pub fn show_vgroups(&self, db_name: &str, filter: ShowFilter) -> Result<Vec<VGroupShowRow>> {
        let db = self
            .dbs
            .get(db_name)
            .ok_or_else(|| VGroupError::InvalidDatabase(db_name.to_string()))?;

        let ids = match filter {
            ShowFilter::All => db.vgroup_ids(),
            ShowFilter::Table(TableKind::Super) => {
                return Err(VGroupError::InvalidTableReference(
                    "super tables are not placed in vgroups".to_string(),
                ));
            }
            ShowFilter::Table(TableKind::Child { vg_id }) => {
                if self.store.get(vg_id).is_none() {
                    return Err(VGroupError::InvalidTableReference(format!(
                        "table refers to unknown vgroup {vg_id}"
                    )));
                }
                vec![vg_id]
            }
        };

        let port = self.config.dnode_mgmt_port;
        let mut rows: Vec<VGroupShowRow> = ids
            .into_iter()
            .filter_map(|vg_id| self.store.get(vg_id))
            .map(|row| {
                let vgroup = lock_row(&row);
                let replicas = vgroup
                    .slots
                    .iter()
                    .map(|slot| match slot.dnode() {
                        Some(dnode) => ReplicaShow {
                            dnode_id: Some(slot.dnode_id),
                            addr: format!("{}:{port}", dnode.private_addr),
                            role: slot.role.as_str().to_string(),
                        },
                        None => ReplicaShow {
                            dnode_id: Some(slot.dnode_id),
                            ..ReplicaShow::null()
                        },
                    })
                    .collect();
                VGroupShowRow {
                    vg_id: vgroup.vg_id,
                    tables: vgroup.table_count(),
                    status: vgroup.status.as_str().to_string(),
                    replicas,
                }
            })
            .collect();

        let width = rows.iter().map(|row| row.replicas.len()).max().unwrap_or(0);
        for row in &mut rows {
            row.replicas.resize_with(width, ReplicaShow::null);
        }
        Ok(rows)
    }
}
