//! Folding dnode load reports into vgroup records.

use strata_types::ReplicaRole;

use crate::fanout::FanoutKind;
use crate::manager::VGroupManager;
use crate::messages::VnodeLoad;
use crate::sdb::lock_row;
use crate::vgroup::VGroupStats;

/// What a load report led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Role (and, for a leader, stats) recorded.
    Applied,
    /// Recorded, and the reporter's replica count disagreed, so the current
    /// membership was announced again.
    Repushed,
    /// The reporter is not a member (or the vgroup is unknown); its vnode
    /// was told to drop.
    OrphanDropped,
    /// The reporting dnode is not registered. Nothing was done.
    UnknownDnode,
}

impl VGroupManager {
    /// Applies one load report.
    pub fn process_load_report(&self, load: &VnodeLoad) -> ReconcileOutcome {
        let Some(dnode) = self.dnodes.get(load.dnode_id) else {
            tracing::warn!(dnode = %load.dnode_id, vg_id = %load.vg_id, "load report from unknown dnode");
            return ReconcileOutcome::UnknownDnode;
        };
        let Some(row) = self.store.get(load.vg_id) else {
            tracing::warn!(dnode = %dnode.id, vg_id = %load.vg_id, "dnode reports unknown vgroup, dropping it");
            self.drop_orphan(&dnode, load.vg_id);
            return ReconcileOutcome::OrphanDropped;
        };

        let (drift, leader_changed) = {
            let mut vgroup = lock_row(&row);
            let slot = vgroup.slot_of(&dnode);
            let Some(idx) = slot else {
                drop(vgroup);
                tracing::error!(dnode = %dnode.id, vg_id = %load.vg_id, "dnode is not a member of vgroup, dropping its vnode");
                self.drop_orphan(&dnode, load.vg_id);
                return ReconcileOutcome::OrphanDropped;
            };

            let leader_changed = load.role == ReplicaRole::Leader;
            if leader_changed {
                vgroup.set_leader(idx);
                vgroup.stats = VGroupStats {
                    total_storage: load.total_storage,
                    comp_storage: load.comp_storage,
                    points_written: load.points_written,
                };
            } else {
                vgroup.slots[idx].role = load.role;
                if vgroup.leader_index == Some(idx) {
                    vgroup.leader_index = None;
                }
            }
            tracing::trace!(vg_id = %load.vg_id, dnode = %dnode.id, role = %load.role, "load report applied");

            let drift = usize::from(load.replica) != vgroup.replica_count;
            if drift {
                tracing::warn!(
                    vg_id = %load.vg_id,
                    dnode = %dnode.id,
                    seen = load.replica,
                    expected = vgroup.replica_count,
                    "replica count drift, re-announcing membership"
                );
            }
            (drift, leader_changed)
        };

        if leader_changed {
            // Persist the stats just taken from the leader.
            if let Err(err) = self.store.update(load.vg_id, None) {
                tracing::warn!(vg_id = %load.vg_id, error = %err, "failed to persist vgroup stats");
            }
        }

        if drift {
            self.create_all(&row, FanoutKind::Announce, None);
            return ReconcileOutcome::Repushed;
        }
        ReconcileOutcome::Applied
    }
}
