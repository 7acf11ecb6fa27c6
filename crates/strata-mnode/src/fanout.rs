//! Fan-out bookkeeping.
//!
//! A fan-out is one logical operation realised as one request per replica.
//! Each response bumps the counters of its [`FanoutOp`]; whoever records
//! the last expected response (or the sweeper, at the deadline) takes the
//! [`Completion`] and delivers the outcome. Each op completes exactly once.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strata_types::{StatusCode, VGroupId};
use tokio::sync::oneshot;

use crate::error::VGroupError;
use crate::messages::IpSet;
use crate::sdb::RowRef;
use crate::vgroup::VGroup;

/// Identifier of an in-flight fan-out, echoed back by dnodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(u64);

impl OpId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Outcome delivered to a waiting caller.
pub type Outcome = Result<(), VGroupError>;

/// The requester of an operation. Completing it consumes it, so
/// a caller hears back at most once.
#[derive(Debug)]
pub struct CallerHandle(oneshot::Sender<Outcome>);

impl CallerHandle {
    pub fn channel() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn complete(self, outcome: Outcome) {
        if self.0.send(outcome).is_err() {
            tracing::debug!("caller dropped before completion");
        }
    }
}

/// A membership change in flight.
#[derive(Debug)]
pub struct Reconfigure {
    /// Membership to restore if the new one cannot be created.
    pub previous: VGroup,
    /// Members leaving the vgroup; dropped once the change succeeds.
    pub retired: Vec<IpSet>,
}

/// What a fan-out does, and so how it is finished.
#[derive(Debug)]
pub enum FanoutKind {
    /// First creation of a vgroup's replicas. Failure deletes the record.
    Create,
    /// Re-announcement of an existing membership. Failure is only logged.
    Announce,
    /// Teardown. Always deletes the record.
    Drop,
    /// Announcement of a changed membership.
    Reconfigure(Box<Reconfigure>),
}

impl FanoutKind {
    pub fn name(&self) -> &'static str {
        match self {
            FanoutKind::Create => "create",
            FanoutKind::Announce => "announce",
            FanoutKind::Drop => "drop",
            FanoutKind::Reconfigure(_) => "reconfigure",
        }
    }

    /// Whether zero reachable replicas is a failure for this kind.
    fn needs_targets(&self) -> bool {
        !matches!(self, FanoutKind::Drop)
    }
}

#[derive(Debug)]
struct OpState {
    expected: usize,
    received: usize,
    succeeded: usize,
    first_failure: Option<StatusCode>,
    kind: Option<FanoutKind>,
    caller: Option<CallerHandle>,
    completed: bool,
}

/// Shared context of one fan-out.
#[derive(Debug)]
pub struct FanoutOp {
    pub id: OpId,
    pub vg_id: VGroupId,
    pub deadline_ms: u64,
    vgroup: RowRef<VGroup>,
    state: Mutex<OpState>,
}

impl FanoutOp {
    fn state(&self) -> MutexGuard<'_, OpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the outcome out of a finished op. Must be called at most once.
    fn take_completion(&self, state: &mut OpState) -> Completion {
        state.completed = true;
        Completion {
            op_id: self.id,
            vg_id: self.vg_id,
            vgroup: Arc::clone(&self.vgroup),
            kind: state.kind.take().unwrap_or(FanoutKind::Announce),
            caller: state.caller.take(),
            expected: state.expected,
            succeeded: state.succeeded,
            first_failure: state.first_failure,
        }
    }
}

/// The aggregated result of a fan-out, owned by whoever finishes it.
#[derive(Debug)]
pub struct Completion {
    pub op_id: OpId,
    pub vg_id: VGroupId,
    pub vgroup: RowRef<VGroup>,
    pub kind: FanoutKind,
    pub caller: Option<CallerHandle>,
    pub expected: usize,
    pub succeeded: usize,
    /// First non-success code, in arrival order.
    pub first_failure: Option<StatusCode>,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        self.first_failure.is_none() && self.succeeded == self.expected
    }

    /// Error to hand the caller when the fan-out failed.
    pub fn error(&self) -> VGroupError {
        VGroupError::from_status(
            self.first_failure.unwrap_or(StatusCode::NoEnoughDnodes),
            self.vg_id,
        )
    }
}

/// Result of registering a fan-out.
#[derive(Debug)]
pub enum Registration {
    /// Responses are expected for this op.
    Pending(OpId),
    /// Nothing to wait for; finish right away.
    Done(Completion),
}

/// Parameters of a new fan-out.
pub struct FanoutSpec {
    pub vgroup: RowRef<VGroup>,
    pub vg_id: VGroupId,
    pub kind: FanoutKind,
    pub caller: Option<CallerHandle>,
    pub expected: usize,
    pub deadline_ms: u64,
}

/// Registry of in-flight fan-outs.
#[derive(Debug, Default)]
pub struct FanoutTracker {
    next_id: AtomicU64,
    ops: Mutex<BTreeMap<OpId, Arc<FanoutOp>>>,
}

impl FanoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: FanoutSpec) -> Registration {
        let id = OpId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let first_failure = (spec.expected == 0 && spec.kind.needs_targets())
            .then_some(StatusCode::NoEnoughDnodes);

        let op = Arc::new(FanoutOp {
            id,
            vg_id: spec.vg_id,
            deadline_ms: spec.deadline_ms,
            vgroup: spec.vgroup,
            state: Mutex::new(OpState {
                expected: spec.expected,
                received: 0,
                succeeded: 0,
                first_failure,
                kind: Some(spec.kind),
                caller: spec.caller,
                completed: false,
            }),
        });

        if spec.expected == 0 {
            let mut state = op.state();
            return Registration::Done(op.take_completion(&mut state));
        }

        self.ops().insert(id, op);
        Registration::Pending(id)
    }

    /// Records one response. Returns the completion if it was the last one.
    pub fn record(&self, id: OpId, code: StatusCode) -> Option<Completion> {
        let Some(op) = self.ops().get(&id).cloned() else {
            tracing::debug!(op = %id, code = %code, "response for unknown or finished fan-out");
            return None;
        };

        let completion = {
            let mut state = op.state();
            if state.completed {
                return None;
            }
            state.received += 1;
            if code.is_success() {
                state.succeeded += 1;
            } else {
                state.first_failure.get_or_insert(code);
            }
            tracing::trace!(
                op = %id,
                vg_id = %op.vg_id,
                received = state.received,
                expected = state.expected,
                code = %code,
                "fan-out response"
            );
            (state.received >= state.expected).then(|| op.take_completion(&mut state))
        }?;

        self.ops().remove(&id);
        Some(completion)
    }

    /// Forces every op past its deadline to complete, counting each missing
    /// response as a timeout.
    pub fn expire(&self, now_ms: u64) -> Vec<Completion> {
        let mut ops = self.ops();
        let stale: Vec<OpId> = ops
            .values()
            .filter(|op| op.deadline_ms <= now_ms)
            .map(|op| op.id)
            .collect();

        let mut done = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(op) = ops.remove(&id) else { continue };
            let mut state = op.state();
            if state.completed {
                continue;
            }
            tracing::warn!(
                op = %id,
                vg_id = %op.vg_id,
                received = state.received,
                expected = state.expected,
                "fan-out timed out"
            );
            state.first_failure.get_or_insert(StatusCode::Timeout);
            state.received = state.expected;
            done.push(op.take_completion(&mut state));
        }
        done
    }

    /// Number of fan-outs still waiting for responses.
    pub fn pending(&self) -> usize {
        self.ops().len()
    }

    pub fn is_pending(&self, id: OpId) -> bool {
        self.ops().contains_key(&id)
    }

    fn ops(&self) -> MutexGuard<'_, BTreeMap<OpId, Arc<FanoutOp>>> {
        self.ops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
