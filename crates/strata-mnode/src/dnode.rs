//! Storage node registry.
//!
//! A [`Dnode`] is shared through `Arc`; replica slots only hold a `Weak`
//! to it and bump [`Dnode::open_vnodes`] while resolved.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use strata_types::DnodeId;

/// A storage node known to the controller.
#[derive(Debug)]
pub struct Dnode {
    pub id: DnodeId,
    pub name: String,
    pub private_addr: Ipv4Addr,
    open_vnodes: AtomicI32,
}

impl Dnode {
    pub fn new(id: DnodeId, name: impl Into<String>, private_addr: Ipv4Addr) -> Self {
        Self {
            id,
            name: name.into(),
            private_addr,
            open_vnodes: AtomicI32::new(0),
        }
    }

    /// Number of resolved replica slots currently referencing this node.
    pub fn open_vnodes(&self) -> i32 {
        self.open_vnodes.load(Ordering::Acquire)
    }

    pub(crate) fn inc_open_vnodes(&self) {
        self.open_vnodes.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_open_vnodes(&self) {
        self.open_vnodes.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Keyed lookup of live storage nodes.
#[derive(Debug, Default)]
pub struct DnodeRegistry {
    nodes: RwLock<BTreeMap<DnodeId, Arc<Dnode>>>,
}

impl DnodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node, replacing any previous entry with the same id.
    pub fn register(&self, dnode: Dnode) -> Arc<Dnode> {
        let dnode = Arc::new(dnode);
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(dnode.id, Arc::clone(&dnode));
        dnode
    }

    pub fn get(&self, id: DnodeId) -> Option<Arc<Dnode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Removes a node. Slots still pointing at it stop resolving once the
    /// last strong reference is gone.
    pub fn remove(&self, id: DnodeId) -> Option<Arc<Dnode>> {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Snapshot of all registered nodes in id order.
    pub fn all(&self) -> Vec<Arc<Dnode>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
