//! Replica placement.

use std::sync::Arc;

use crate::dnode::DnodeRegistry;
use crate::error::{Result, VGroupError};
use crate::vgroup::{ReplicaSlot, VGroup};

/// Picks the dnodes that host a vgroup's replicas.
pub trait Placement: Send + Sync {
    /// Fills `vgroup.slots` up to `vgroup.replica_count`. Existing slots are
    /// kept. On error the vgroup is left unchanged.
    fn allocate_replicas(&self, vgroup: &mut VGroup) -> Result<()>;
}

/// Places each new replica on the distinct dnode with the fewest open
/// vnodes, breaking ties by id.
pub struct LeastLoadedPlacement {
    dnodes: Arc<DnodeRegistry>,
}

impl LeastLoadedPlacement {
    pub fn new(dnodes: Arc<DnodeRegistry>) -> Self {
        Self { dnodes }
    }
}

impl Placement for LeastLoadedPlacement {
    fn allocate_replicas(&self, vgroup: &mut VGroup) -> Result<()> {
        let needed = vgroup.replica_count.saturating_sub(vgroup.slots.len());
        if needed == 0 {
            return Ok(());
        }

        let taken = vgroup.member_ids();
        let mut candidates: Vec<_> = self
            .dnodes
            .all()
            .into_iter()
            .filter(|dnode| !taken.contains(&dnode.id))
            .collect();
        if candidates.len() < needed {
            return Err(VGroupError::InsufficientNodes {
                needed: vgroup.replica_count,
                available: candidates.len() + taken.len(),
            });
        }

        candidates.sort_by_key(|dnode| (dnode.open_vnodes(), dnode.id));
        vgroup.slots.extend(
            candidates
                .iter()
                .take(needed)
                .map(|dnode| ReplicaSlot::new(dnode.id)),
        );
        tracing::debug!(
            db = %vgroup.db_name,
            members = ?vgroup.member_ids(),
            "replicas placed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnode::Dnode;
    use std::net::Ipv4Addr;
    use strata_types::DnodeId;

    fn registry(n: u32) -> Arc<DnodeRegistry> {
        let registry = Arc::new(DnodeRegistry::new());
        for id in 1..=n {
            registry.register(Dnode::new(DnodeId::new(id), format!("dn{id}"), Ipv4Addr::LOCALHOST));
        }
        registry
    }

    #[test]
    fn prefers_least_loaded_nodes() {
        let dnodes = registry(3);
        dnodes.get(DnodeId::new(1)).unwrap().inc_open_vnodes();

        let mut vgroup = VGroup::new("db1", 2, 0);
        LeastLoadedPlacement::new(dnodes).allocate_replicas(&mut vgroup).unwrap();
        assert_eq!(vgroup.member_ids(), vec![DnodeId::new(2), DnodeId::new(3)]);
    }

    #[test]
    fn growth_skips_existing_members() {
        let mut vgroup = VGroup::with_members("db1", &[DnodeId::new(2)], 0);
        vgroup.replica_count = 3;
        LeastLoadedPlacement::new(registry(3)).allocate_replicas(&mut vgroup).unwrap();
        assert_eq!(
            vgroup.member_ids(),
            vec![DnodeId::new(2), DnodeId::new(1), DnodeId::new(3)]
        );
    }

    #[test]
    fn not_enough_nodes_leaves_vgroup_untouched() {
        let mut vgroup = VGroup::new("db1", 3, 0);
        let err = LeastLoadedPlacement::new(registry(2))
            .allocate_replicas(&mut vgroup)
            .unwrap_err();
        assert_eq!(err, VGroupError::InsufficientNodes { needed: 3, available: 2 });
        assert!(vgroup.slots.is_empty());
    }
}
