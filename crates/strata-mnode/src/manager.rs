//! VGroup lifecycle manager.
//!
//! Entry points for creating, dropping, altering and updating vgroups, for
//! packing tables into them, and for the dnode responses that drive
//! in-flight fan-outs to completion. Every handler runs to completion
//! without waiting on the network: requests go out fire-and-forget and the
//! last response (or the timeout sweeper) finishes the operation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use strata_config::VGroupConfig;
use strata_types::{MAX_REPLICAS, SlotId, StatusCode, TableId, VGroupId, VGroupStatus};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::db::{Database, DatabaseRegistry};
use crate::dnode::{Dnode, DnodeRegistry};
use crate::error::{Result, VGroupError};
use crate::fanout::{
    CallerHandle, Completion, FanoutKind, FanoutSpec, FanoutTracker, OpId, Outcome, Reconfigure,
    Registration,
};
use crate::hooks::VGroupActions;
use crate::messages::{ConfigVnodeMsg, CreateVnodeMsg, DnodeRequest, DropVnodeMsg, IpSet};
use crate::placement::Placement;
use crate::sdb::{ObjectStore, RowRef, lock_row};
use crate::slots::{TableRef, TableSlots};
use crate::transport::DnodeTransport;
use crate::vgroup::{ReplicaSlot, VGroup};

/// Shared handle to a live vgroup record.
pub type VGroupRef = RowRef<VGroup>;

/// Collaborators the manager is wired with.
pub struct Services {
    pub store: Arc<dyn ObjectStore<VGroupActions>>,
    pub dbs: Arc<DatabaseRegistry>,
    pub dnodes: Arc<DnodeRegistry>,
    pub placement: Arc<dyn Placement>,
    pub transport: Arc<dyn DnodeTransport>,
    pub clock: Arc<dyn Clock>,
}

pub struct VGroupManager {
    pub(crate) config: VGroupConfig,
    pub(crate) store: Arc<dyn ObjectStore<VGroupActions>>,
    pub(crate) dbs: Arc<DatabaseRegistry>,
    pub(crate) dnodes: Arc<DnodeRegistry>,
    placement: Arc<dyn Placement>,
    transport: Arc<dyn DnodeTransport>,
    clock: Arc<dyn Clock>,
    fanout: FanoutTracker,
}

impl VGroupManager {
    pub fn new(config: VGroupConfig, services: Services) -> Self {
        Self {
            config,
            store: services.store,
            dbs: services.dbs,
            dnodes: services.dnodes,
            placement: services.placement,
            transport: services.transport,
            clock: services.clock,
            fanout: FanoutTracker::new(),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Creates a vgroup for `db` and starts creating its replicas.
    ///
    /// Placement and insert failures are reported to `caller` right away and
    /// returned. Otherwise the caller hears back once every replica has
    /// answered; if any failed, the record is deleted again.
    pub fn create_vgroup(&self, db: &Database, caller: CallerHandle) -> Result<VGroupId> {
        let replica_count = usize::from(db.replications());
        if !(1..=MAX_REPLICAS).contains(&replica_count) {
            return fail(caller, VGroupError::InvalidReplicaCount(replica_count));
        }

        let mut vgroup = VGroup::new(&db.name, replica_count, self.clock.now_ms());
        let placed = self
            .placement
            .allocate_replicas(&mut vgroup)
            .and_then(|()| vgroup.check_membership());
        if let Err(err) = placed {
            tracing::warn!(db = %db.name, error = %err, "vgroup placement failed");
            return fail(caller, err);
        }

        let row = match self.store.insert(vgroup) {
            Ok(row) => row,
            Err(err) => {
                tracing::error!(db = %db.name, error = %err, "failed to insert vgroup");
                return fail(caller, as_storage_error(err));
            }
        };

        let vg_id = {
            let vgroup = lock_row(&row);
            tracing::info!(
                vg_id = %vgroup.vg_id,
                db = %db.name,
                members = ?vgroup.member_ids(),
                "vgroup created"
            );
            vgroup.vg_id
        };
        self.create_all(&row, FanoutKind::Create, Some(caller));
        Ok(vg_id)
    }

    /// Drops a vgroup.
    ///
    /// With a caller, the record is deleted once every replica has answered.
    /// Without one (cascading drops), drop requests go out untracked and the
    /// record is deleted immediately.
    pub fn drop_vgroup(&self, vg_id: VGroupId, caller: Option<CallerHandle>) -> Result<()> {
        let Some(row) = self.store.get(vg_id) else {
            let err = VGroupError::UnknownVGroup(vg_id);
            if let Some(caller) = caller {
                caller.complete(Err(err.clone()));
            }
            return Err(err);
        };

        let requests = Self::drop_requests(&lock_row(&row), self.config.dnode_mgmt_port);
        match caller {
            Some(caller) => {
                self.fan_out(&row, vg_id, FanoutKind::Drop, Some(caller), requests);
                Ok(())
            }
            None => {
                for (target, request) in requests {
                    self.send_untracked(&target, request);
                }
                self.store.delete(vg_id).map_err(as_storage_error)?;
                tracing::info!(vg_id = %vg_id, "vgroup dropped without waiting for dnodes");
                Ok(())
            }
        }
    }

    /// Brings a vgroup's membership in line with its database's replication
    /// factor.
    ///
    /// Matching counts complete the caller right away. Otherwise the live
    /// record switches to the new membership with status `Updating` in one
    /// step, is persisted, and the membership is announced; the caller hears
    /// back when the announcement finishes. Success drops the retired
    /// replicas and returns the vgroup to `Ready`; failure restores the
    /// previous membership.
    pub fn alter_vgroup(&self, vg_id: VGroupId, caller: CallerHandle) -> Result<()> {
        let Some(row) = self.store.get(vg_id) else {
            return fail(caller, VGroupError::UnknownVGroup(vg_id));
        };

        let (previous, retired) = {
            let mut vgroup = lock_row(&row);
            let Some(db) = vgroup.database().cloned() else {
                return fail(caller, VGroupError::InvalidDatabase(vgroup.db_name.clone()));
            };

            if vgroup.status == VGroupStatus::Updating {
                return fail(caller, VGroupError::ReconfigurationInProgress(vg_id));
            }
            let target = usize::from(db.replications());
            if target == vgroup.replica_count {
                caller.complete(Ok(()));
                return Ok(());
            }
            if !(1..=MAX_REPLICAS).contains(&target) {
                return fail(caller, VGroupError::InvalidReplicaCount(target));
            }

            let previous = vgroup.persisted_copy();
            let mut next = vgroup.persisted_copy();
            next.replica_count = target;
            let mut retired = Vec::new();
            if target > vgroup.replica_count {
                let placed = self
                    .placement
                    .allocate_replicas(&mut next)
                    .and_then(|()| next.check_membership());
                if let Err(err) = placed {
                    return fail(caller, err);
                }
            } else {
                let (keep, leaving) = Self::split_for_shrink(&vgroup, target);
                next.slots = keep.iter().map(|idx| ReplicaSlot::new(vgroup.slots[*idx].dnode_id)).collect();
                retired = leaving
                    .iter()
                    .filter_map(|idx| vgroup.slots[*idx].dnode())
                    .map(|dnode| IpSet::single(&dnode, self.config.dnode_mgmt_port))
                    .collect();
            }

            tracing::info!(
                vg_id = %vg_id,
                from = ?vgroup.member_ids(),
                to = ?next.member_ids(),
                "vgroup reconfiguration started"
            );
            vgroup.status = VGroupStatus::Updating;
            vgroup.adopt_membership(&next, &self.dnodes);
            (previous, retired)
        };

        if let Err(err) = self.store.update(vg_id, None) {
            let mut vgroup = lock_row(&row);
            vgroup.adopt_membership(&previous, &self.dnodes);
            vgroup.status = VGroupStatus::Ready;
            return fail(caller, as_storage_error(err));
        }

        let kind = FanoutKind::Reconfigure(Box::new(Reconfigure { previous, retired }));
        self.create_all(&row, kind, Some(caller));
        Ok(())
    }

    /// Deletes every vgroup whose database name starts with `db_name` and
    /// sends untracked drop requests to its replicas. Returns how many
    /// vgroups were removed.
    pub fn drop_all_vgroups_of(&self, db_name: &str) -> usize {
        let port = self.config.dnode_mgmt_port;
        let mut victims = Vec::new();
        let mut cursor = None;
        while let Some((vg_id, row)) = self.store.fetch_next(cursor) {
            cursor = Some(vg_id);
            let vgroup = lock_row(&row);
            if vgroup.db_name.starts_with(db_name) {
                victims.push((vg_id, Self::drop_requests(&vgroup, port)));
            }
        }

        let mut dropped = 0;
        for (vg_id, requests) in victims {
            if let Err(err) = self.store.delete(vg_id) {
                tracing::warn!(vg_id = %vg_id, error = %err, "failed to delete vgroup");
                continue;
            }
            for (target, request) in requests {
                self.send_untracked(&target, request);
            }
            dropped += 1;
        }

        tracing::info!(db = %db_name, dropped, "dropped all vgroups of database");
        dropped
    }

    /// Applies a replacement record and re-announces the membership.
    pub fn update_vgroup(&self, replacement: VGroup) -> Result<()> {
        let vg_id = replacement.vg_id;
        let row = self
            .store
            .get(vg_id)
            .ok_or(VGroupError::UnknownVGroup(vg_id))?;
        self.store.update(vg_id, Some(replacement))?;
        tracing::info!(vg_id = %vg_id, "vgroup updated");
        self.create_all(&row, FanoutKind::Announce, None);
        Ok(())
    }

    /// Runs an in-place update on every vgroup of `db`, so table capacity
    /// follows the database's current configuration.
    pub fn refresh_vgroups_of(&self, db: &Database) -> Result<usize> {
        let ids = db.vgroup_ids();
        for vg_id in &ids {
            self.store.update(*vg_id, None)?;
        }
        Ok(ids.len())
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Puts `table` into its stamped slot. Returns false (not an error) when
    /// the table has no slot or the slot is taken.
    pub fn add_table(&self, vg_id: VGroupId, table: TableRef) -> Result<bool> {
        let row = self.row(vg_id)?;
        let mut vgroup = lock_row(&row);
        let added = match (table.slot, vgroup.tables.as_mut()) {
            (Some(slot), Some(tables)) => tables.occupy(slot, table.table_id),
            _ => false,
        };
        if added {
            tracing::trace!(vg_id = %vg_id, table = %table.table_id, "table added to vgroup");
        }
        Self::deprioritize_if_full(&vgroup);
        Ok(added)
    }

    /// Frees the slot `table` occupies, or its unfilled reservation. Returns
    /// true only when a table was removed. The full-vgroup check runs here
    /// too.
    pub fn remove_table(&self, vg_id: VGroupId, table: TableRef) -> Result<bool> {
        let row = self.row(vg_id)?;
        let mut vgroup = lock_row(&row);
        let removed = match (table.slot, vgroup.tables.as_mut()) {
            (Some(slot), Some(tables)) => {
                let removed = tables.release(slot).is_some();
                if !removed && tables.cancel_reservation(slot) {
                    tracing::trace!(vg_id = %vg_id, slot = %slot, "table slot reservation returned");
                }
                removed
            }
            _ => false,
        };
        if removed {
            tracing::trace!(vg_id = %vg_id, table = %table.table_id, "table removed from vgroup");
        }
        Self::deprioritize_if_full(&vgroup);
        Ok(removed)
    }

    /// Reserves the lowest free table slot of a vgroup, for stamping a new
    /// table. The slot stays taken until [`add_table`](Self::add_table)
    /// fills it or [`remove_table`](Self::remove_table) gives it back.
    pub fn reserve_table_slot(&self, vg_id: VGroupId) -> Result<SlotId> {
        let row = self.row(vg_id)?;
        let mut vgroup = lock_row(&row);
        let capacity = vgroup.table_capacity();
        let slot = vgroup
            .tables
            .as_mut()
            .and_then(TableSlots::reserve)
            .ok_or(VGroupError::AllocationFailure { vg_id, capacity })?;
        tracing::trace!(vg_id = %vg_id, slot = %slot, "table slot reserved");
        Ok(slot)
    }

    /// Reserves the lowest free slot and puts `table_id` into it in one step.
    pub fn assign_table_slot(&self, vg_id: VGroupId, table_id: TableId) -> Result<TableRef> {
        let row = self.row(vg_id)?;
        let mut vgroup = lock_row(&row);
        let capacity = vgroup.table_capacity();
        let slot = vgroup
            .tables
            .as_mut()
            .and_then(|tables| {
                let slot = tables.lowest_free()?;
                tables.occupy(slot, table_id).then_some(slot)
            })
            .ok_or(VGroupError::AllocationFailure { vg_id, capacity })?;
        Self::deprioritize_if_full(&vgroup);
        Ok(TableRef::new(table_id, Some(slot)))
    }

    /// Preferred vgroup for a new table in `db`, if it has any.
    pub fn select_vgroup(&self, db: &Database) -> Option<VGroupRef> {
        db.head().and_then(|vg_id| self.store.get(vg_id))
    }

    // ========================================================================
    // Dnode traffic
    // ========================================================================

    /// Answers a dnode asking to (re)confirm one of its vnodes, then pushes
    /// the vnode's create request to it.
    pub fn process_config_vnode(&self, msg: ConfigVnodeMsg, reply: CallerHandle) -> Result<()> {
        let not_active = VGroupError::NotActiveReplica {
            dnode_id: msg.dnode_id,
            vg_id: msg.vg_id,
        };
        let Some(dnode) = self.dnodes.get(msg.dnode_id) else {
            tracing::warn!(dnode = %msg.dnode_id, vg_id = %msg.vg_id, "config request from unknown dnode");
            return fail(reply, not_active);
        };
        let Some(row) = self.store.get(msg.vg_id) else {
            tracing::warn!(dnode = %msg.dnode_id, vg_id = %msg.vg_id, "config request for unknown vgroup");
            return fail(reply, not_active);
        };

        reply.complete(Ok(()));
        let request = self.create_request(&lock_row(&row));
        if let Some(request) = request {
            self.send_untracked(&IpSet::single(&dnode, self.config.dnode_mgmt_port), request);
        }
        Ok(())
    }

    pub fn on_create_vnode_rsp(&self, op: OpId, code: StatusCode) {
        tracing::debug!(op = %op, code = %code, "create vnode response");
        if let Some(completion) = self.fanout.record(op, code) {
            self.finish(completion);
        }
    }

    pub fn on_drop_vnode_rsp(&self, op: OpId, code: StatusCode) {
        tracing::debug!(op = %op, code = %code, "drop vnode response");
        if let Some(completion) = self.fanout.record(op, code) {
            self.finish(completion);
        }
    }

    /// Fails every fan-out past its deadline. Returns how many were expired.
    pub fn expire_stale_ops(&self) -> usize {
        let expired = self.fanout.expire(self.clock.now_ms());
        let count = expired.len();
        for completion in expired {
            self.finish(completion);
        }
        count
    }

    /// Runs [`Self::expire_stale_ops`] every `sweep_interval_ms` until the
    /// manager is dropped.
    pub fn spawn_timeout_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let expired = manager.expire_stale_ops();
                if expired > 0 {
                    tracing::debug!(expired, "expired stale fan-outs");
                }
            }
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_vgroup(&self, vg_id: VGroupId) -> Option<VGroupRef> {
        self.store.get(vg_id)
    }

    /// Fan-outs still waiting for responses.
    pub fn pending_ops(&self) -> usize {
        self.fanout.pending()
    }

    /// Addresses of a vgroup's replicas, leader first in line.
    pub fn ip_set_of(&self, vg_id: VGroupId) -> Option<IpSet> {
        let row = self.store.get(vg_id)?;
        let vgroup = lock_row(&row);
        Some(IpSet::for_vgroup(&vgroup, self.config.dnode_mgmt_port))
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    /// Sends the create request to every resolved replica of `row`.
    pub(crate) fn create_all(
        &self,
        row: &VGroupRef,
        kind: FanoutKind,
        caller: Option<CallerHandle>,
    ) {
        let (vg_id, requests) = {
            let vgroup = lock_row(row);
            let requests = match self.create_request(&vgroup) {
                Some(request) => vgroup
                    .resolved_dnodes()
                    .iter()
                    .map(|dnode| (IpSet::single(dnode, self.config.dnode_mgmt_port), request.clone()))
                    .collect(),
                None => Vec::new(),
            };
            (vgroup.vg_id, requests)
        };
        self.fan_out(row, vg_id, kind, caller, requests);
    }

    fn fan_out(
        &self,
        row: &VGroupRef,
        vg_id: VGroupId,
        kind: FanoutKind,
        caller: Option<CallerHandle>,
        requests: Vec<(IpSet, DnodeRequest)>,
    ) {
        let name = kind.name();
        let registration = self.fanout.register(FanoutSpec {
            vgroup: Arc::clone(row),
            vg_id,
            kind,
            caller,
            expected: requests.len(),
            deadline_ms: self.clock.now_ms().saturating_add(self.config.fanout_timeout_ms),
        });
        let op = match registration {
            Registration::Pending(op) => op,
            Registration::Done(completion) => {
                tracing::warn!(vg_id = %vg_id, kind = name, "no reachable replicas for fan-out");
                self.finish(completion);
                return;
            }
        };

        tracing::debug!(vg_id = %vg_id, op = %op, kind = name, replicas = requests.len(), "fan-out started");
        for (target, request) in requests {
            tracing::trace!(vg_id = %vg_id, op = %op, addr = ?target.primary(), kind = name, "sending to dnode");
            if let Err(err) = self.transport.send(&target, request, Some(op)) {
                tracing::warn!(vg_id = %vg_id, op = %op, error = %err, "send to dnode failed");
                if let Some(completion) = self.fanout.record(op, StatusCode::NetworkUnavailable) {
                    self.finish(completion);
                }
            }
        }
    }

    /// Delivers the outcome of a finished fan-out.
    fn finish(&self, completion: Completion) {
        let ok = completion.is_success();
        let error = completion.error();
        let Completion {
            vg_id,
            vgroup,
            kind,
            caller,
            expected,
            succeeded,
            ..
        } = completion;

        let outcome: Outcome = match kind {
            FanoutKind::Create if ok => {
                tracing::info!(vg_id = %vg_id, replicas = expected, "vgroup replicas created");
                Ok(())
            }
            FanoutKind::Create => {
                tracing::warn!(
                    vg_id = %vg_id,
                    succeeded,
                    expected,
                    error = %error,
                    "vgroup creation failed, removing record"
                );
                if let Err(err) = self.store.delete(vg_id) {
                    tracing::error!(vg_id = %vg_id, error = %err, "failed to remove vgroup");
                }
                Err(error)
            }
            FanoutKind::Announce if ok => {
                tracing::debug!(vg_id = %vg_id, "vgroup membership announced");
                Ok(())
            }
            FanoutKind::Announce => {
                tracing::warn!(vg_id = %vg_id, succeeded, expected, error = %error, "vgroup announcement failed");
                Err(error)
            }
            FanoutKind::Drop => {
                if succeeded < expected {
                    tracing::debug!(vg_id = %vg_id, succeeded, expected, "some replicas failed to drop");
                }
                if let Err(err) = self.store.delete(vg_id) {
                    tracing::warn!(vg_id = %vg_id, error = %err, "failed to remove dropped vgroup");
                }
                tracing::info!(vg_id = %vg_id, "vgroup dropped");
                Ok(())
            }
            FanoutKind::Reconfigure(change) => self.finish_reconfigure(&vgroup, vg_id, *change, ok, error),
        };

        if let Some(caller) = caller {
            caller.complete(outcome);
        }
    }

    fn finish_reconfigure(
        &self,
        row: &VGroupRef,
        vg_id: VGroupId,
        change: Reconfigure,
        ok: bool,
        error: VGroupError,
    ) -> Outcome {
        if ok {
            for target in &change.retired {
                self.send_untracked(target, DnodeRequest::DropVnode(DropVnodeMsg { vg_id }));
            }
            lock_row(row).status = VGroupStatus::Ready;
            self.store.update(vg_id, None)?;
            tracing::info!(vg_id = %vg_id, retired = change.retired.len(), "vgroup reconfiguration finished");
            return Ok(());
        }

        tracing::warn!(vg_id = %vg_id, error = %error, "vgroup reconfiguration failed, restoring membership");
        {
            let mut vgroup = lock_row(row);
            vgroup.adopt_membership(&change.previous, &self.dnodes);
            vgroup.status = VGroupStatus::Ready;
        }
        match self.store.update(vg_id, None) {
            Ok(()) => self.create_all(row, FanoutKind::Announce, None),
            Err(err) => tracing::error!(vg_id = %vg_id, error = %err, "failed to restore vgroup membership"),
        }
        Err(error)
    }

    pub(crate) fn send_untracked(&self, target: &IpSet, request: DnodeRequest) {
        let vg_id = request.vg_id();
        tracing::trace!(vg_id = %vg_id, addr = ?target.primary(), create = request.is_create(), "sending untracked request");
        if let Err(err) = self.transport.send(target, request, None) {
            tracing::warn!(vg_id = %vg_id, error = %err, "untracked send to dnode failed");
        }
    }

    pub(crate) fn drop_orphan(&self, dnode: &Dnode, vg_id: VGroupId) {
        self.send_untracked(
            &IpSet::single(dnode, self.config.dnode_mgmt_port),
            DnodeRequest::DropVnode(DropVnodeMsg { vg_id }),
        );
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn row(&self, vg_id: VGroupId) -> Result<VGroupRef> {
        self.store.get(vg_id).ok_or(VGroupError::UnknownVGroup(vg_id))
    }

    fn create_request(&self, vgroup: &VGroup) -> Option<DnodeRequest> {
        let Some(db) = vgroup.database() else {
            tracing::warn!(vg_id = %vgroup.vg_id, "vgroup has no database, nothing to announce");
            return None;
        };
        Some(DnodeRequest::CreateVnode(CreateVnodeMsg::build(
            vgroup,
            &db.config(),
            &self.config,
        )))
    }

    fn drop_requests(vgroup: &VGroup, port: u16) -> Vec<(IpSet, DnodeRequest)> {
        let vg_id = vgroup.vg_id;
        vgroup
            .resolved_dnodes()
            .iter()
            .map(|dnode| {
                (
                    IpSet::single(dnode, port),
                    DnodeRequest::DropVnode(DropVnodeMsg { vg_id }),
                )
            })
            .collect()
    }

    /// Slot indices to keep and to retire when shrinking to `target`.
    /// Trailing slots go first; the leader is never retired.
    fn split_for_shrink(vgroup: &VGroup, target: usize) -> (Vec<usize>, Vec<usize>) {
        let mut keep: Vec<usize> = (0..vgroup.slots.len()).collect();
        let mut leaving = Vec::new();
        let mut idx = keep.len();
        while keep.len() > target && idx > 0 {
            idx -= 1;
            if vgroup.leader_index != Some(keep[idx]) {
                leaving.push(keep.remove(idx));
            }
        }
        (keep, leaving)
    }

    fn deprioritize_if_full(vgroup: &VGroup) {
        let Some(db) = vgroup.database() else { return };
        if vgroup.table_count() >= db.max_tables_per_vgroup() {
            db.move_to_tail(vgroup.vg_id);
            tracing::debug!(vg_id = %vgroup.vg_id, tables = vgroup.table_count(), "vgroup full, moved to tail");
        }
    }
}

fn fail<T>(caller: CallerHandle, err: VGroupError) -> Result<T> {
    caller.complete(Err(err.clone()));
    Err(err)
}

/// Reports any object store failure as a storage error.
fn as_storage_error(err: VGroupError) -> VGroupError {
    match err {
        VGroupError::Storage(_) => err,
        other => VGroupError::Storage(other.to_string()),
    }
}
