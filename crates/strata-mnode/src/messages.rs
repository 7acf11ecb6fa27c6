//! Messages exchanged with dnodes.
//!
//! Requests go out through [`crate::transport::DnodeTransport`]; reports
//! come back as [`VnodeLoad`] and [`ConfigVnodeMsg`]. All of them travel as
//! postcard.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strata_config::{DatabaseConfig, Precision, VGroupConfig};
use strata_types::{DnodeId, ReplicaRole, VGroupId};

use crate::dnode::Dnode;
use crate::error::{Result, VGroupError};
use crate::vgroup::VGroup;

// ============================================================================
// Addressing
// ============================================================================

/// Destination of a request: candidate addresses and the one to try first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSet {
    pub addrs: Vec<Ipv4Addr>,
    pub in_use: usize,
    pub port: u16,
}

impl IpSet {
    /// Addresses a single dnode.
    pub fn single(dnode: &Dnode, port: u16) -> Self {
        Self {
            addrs: vec![dnode.private_addr],
            in_use: 0,
            port,
        }
    }

    /// Addresses every resolved member of `vgroup`, preferring the leader.
    pub fn for_vgroup(vgroup: &VGroup, port: u16) -> Self {
        let mut addrs = Vec::with_capacity(vgroup.slots.len());
        let mut in_use = 0;
        for (idx, slot) in vgroup.slots.iter().enumerate() {
            let Some(dnode) = slot.dnode() else { continue };
            if vgroup.leader_index == Some(idx) {
                in_use = addrs.len();
            }
            addrs.push(dnode.private_addr);
        }
        Self { addrs, in_use, port }
    }

    pub fn primary(&self) -> Option<Ipv4Addr> {
        self.addrs.get(self.in_use).copied()
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Settings a vnode is created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnodeCfg {
    pub vg_id: VGroupId,
    pub max_tables: u32,
    pub max_cache_size: u64,
    pub days_per_file: u32,
    pub days_to_keep: u32,
    pub days_to_keep1: u32,
    pub days_to_keep2: u32,
    pub commit_time_secs: u32,
    pub precision: Precision,
    pub compression: u8,
    pub commit_log: u8,
    pub wals: u8,
    pub replications: u8,
    pub quorum: u8,
    pub arbitrator_addr: Option<Ipv4Addr>,
}

/// One member of the vnode's replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnodeDesc {
    pub node_id: DnodeId,
    pub node_addr: Ipv4Addr,
    pub node_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVnodeMsg {
    pub cfg: VnodeCfg,
    pub nodes: Vec<VnodeDesc>,
}

impl CreateVnodeMsg {
    /// Builds the create request for `vgroup` from its database settings.
    ///
    /// Every member gets the same message so each vnode learns its peers.
    pub fn build(vgroup: &VGroup, db: &DatabaseConfig, settings: &VGroupConfig) -> Self {
        let nodes: Vec<VnodeDesc> = vgroup
            .resolved_dnodes()
            .iter()
            .map(|dnode| VnodeDesc {
                node_id: dnode.id,
                node_addr: dnode.private_addr,
                node_name: dnode.name.clone(),
            })
            .collect();

        let cfg = VnodeCfg {
            vg_id: vgroup.vg_id,
            max_tables: db.max_tables_per_vgroup,
            max_cache_size: db.max_cache_size(),
            days_per_file: db.days_per_file,
            days_to_keep: db.days_to_keep,
            days_to_keep1: db.days_to_keep1,
            days_to_keep2: db.days_to_keep2,
            commit_time_secs: db.commit_time_secs,
            precision: db.precision,
            compression: db.compression,
            commit_log: db.commit_log,
            wals: settings.wals,
            replications: u8::try_from(vgroup.replica_count).unwrap_or(u8::MAX),
            quorum: settings.quorum,
            arbitrator_addr: nodes.first().map(|n| n.node_addr),
        };

        Self { cfg, nodes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropVnodeMsg {
    pub vg_id: VGroupId,
}

/// A request sent to one dnode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnodeRequest {
    CreateVnode(CreateVnodeMsg),
    DropVnode(DropVnodeMsg),
}

impl DnodeRequest {
    pub fn vg_id(&self) -> VGroupId {
        match self {
            DnodeRequest::CreateVnode(msg) => msg.cfg.vg_id,
            DnodeRequest::DropVnode(msg) => msg.vg_id,
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self, DnodeRequest::CreateVnode(_))
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Periodic load report for one vnode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnodeLoad {
    pub dnode_id: DnodeId,
    pub vg_id: VGroupId,
    pub role: ReplicaRole,
    /// Replica count as the reporting vnode sees it.
    pub replica: u8,
    pub total_storage: i64,
    pub comp_storage: i64,
    pub points_written: i64,
}

/// A dnode asking the controller to confirm one of its vnodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVnodeMsg {
    pub dnode_id: DnodeId,
    pub vg_id: VGroupId,
}

// ============================================================================
// Codec
// ============================================================================

pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(msg).map_err(|e| VGroupError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(|e| VGroupError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dnode::DnodeRegistry;

    fn resolved_vgroup() -> (DnodeRegistry, VGroup) {
        let registry = DnodeRegistry::new();
        for id in 1..=3u8 {
            registry.register(Dnode::new(DnodeId::new(u32::from(id)), format!("dn{id}"), Ipv4Addr::new(10, 0, 0, id)));
        }
        let mut vgroup = VGroup::with_members(
            "db1",
            &[DnodeId::new(1), DnodeId::new(9), DnodeId::new(3)],
            0,
        );
        vgroup.vg_id = VGroupId::new(5);
        vgroup.resolve_slots(&registry);
        (registry, vgroup)
    }

    #[test]
    fn create_message_lists_resolved_members() {
        let (_registry, mut vgroup) = resolved_vgroup();
        let db = DatabaseConfig {
            max_tables_per_vgroup: 4,
            days_per_file: 7,
            ..DatabaseConfig::default()
        };
        let msg = CreateVnodeMsg::build(&vgroup, &db, &VGroupConfig::default());

        assert_eq!(msg.cfg.vg_id, VGroupId::new(5));
        assert_eq!(msg.cfg.max_tables, 4);
        assert_eq!(msg.cfg.days_per_file, 7);
        assert_eq!(msg.cfg.replications, 3);
        assert_eq!(msg.cfg.wals, 3);
        assert_eq!(msg.cfg.arbitrator_addr, Some(Ipv4Addr::new(10, 0, 0, 1)));
        let ids: Vec<_> = msg.nodes.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![DnodeId::new(1), DnodeId::new(3)]);

        vgroup.release_slots();
    }

    #[test]
    fn ip_set_prefers_leader() {
        let (_registry, mut vgroup) = resolved_vgroup();
        vgroup.set_leader(2);
        let set = IpSet::for_vgroup(&vgroup, 6035);
        assert_eq!(set.addrs.len(), 2);
        assert_eq!(set.primary(), Some(Ipv4Addr::new(10, 0, 0, 3)));
        vgroup.release_slots();
    }

    #[test]
    fn requests_survive_the_codec() {
        let request = DnodeRequest::DropVnode(DropVnodeMsg { vg_id: VGroupId::new(3) });
        let decoded: DnodeRequest = decode(&encode(&request).unwrap()).unwrap();
        assert_eq!(decoded.vg_id(), VGroupId::new(3));
        assert!(!decoded.is_create());
    }

    #[test]
    fn truncated_report_is_a_codec_error() {
        let load = VnodeLoad {
            dnode_id: DnodeId::new(1),
            vg_id: VGroupId::new(2),
            role: ReplicaRole::Leader,
            replica: 3,
            total_storage: 10,
            comp_storage: 5,
            points_written: 100,
        };
        let bytes = encode(&load).unwrap();
        assert!(matches!(
            decode::<VnodeLoad>(&bytes[..2]),
            Err(VGroupError::Codec(_))
        ));
    }
}
