//! # strata-mnode: VGroup lifecycle management for `Strata`
//!
//! The controller side of virtual groups (vgroups): replicated shards made
//! of one replica slot per hosting dnode. This crate places vgroups on
//! dnodes, creates and drops their replicas through fan-out requests,
//! folds dnode load reports back into the records, and packs tables into
//! vgroups as they fill.
//!
//! ## Architecture
//!
//! - [`vgroup`]: the record, its replica slots and its persisted projection
//! - [`hooks`]: lifecycle callbacks registered with the object store
//! - [`sdb`]: object store traits and the in-memory store
//! - [`slots`]: per-vgroup table-slot allocator
//! - [`db`], [`dnode`]: database and dnode registries
//! - [`fanout`]: response aggregation for multi-replica operations
//! - [`manager`]: entry points for lifecycle, tables and dnode traffic
//! - [`reconcile`]: load report handling and drift repair
//! - [`show`]: administrative listing
//!
//! ## Example
//!
//! ```ignore
//! let (caller, done) = CallerHandle::channel();
//! let vg_id = manager.create_vgroup(&db, caller)?;
//! // Dnode responses arrive through `on_create_vnode_rsp`.
//! done.await??;
//! ```

pub mod clock;
pub mod db;
pub mod dnode;
pub mod error;
pub mod fanout;
pub mod hooks;
pub mod manager;
pub mod messages;
pub mod placement;
pub mod reconcile;
pub mod sdb;
pub mod show;
pub mod slots;
pub mod transport;
pub mod vgroup;


pub use clock::{Clock, SystemClock};
pub use db::{Database, DatabaseRegistry};
pub use dnode::{Dnode, DnodeRegistry};
pub use error::{Result, VGroupError};
pub use fanout::{CallerHandle, OpId, Outcome};
pub use hooks::VGroupActions;
pub use manager::{Services, VGroupManager, VGroupRef};
pub use messages::{ConfigVnodeMsg, DnodeRequest, IpSet, VnodeLoad};
pub use placement::{LeastLoadedPlacement, Placement};
pub use reconcile::ReconcileOutcome;
pub use sdb::{MemStore, ObjectStore, RowRef, TableActions, lock_row};
pub use show::{ShowFilter, TableKind, VGroupShowRow};
pub use slots::{TableRef, TableSlots};
pub use transport::{DnodeTransport, TransportError};
pub use vgroup::{ReplicaSlot, VGroup, VGroupRow, VGroupStats};
