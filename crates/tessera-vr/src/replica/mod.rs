//! VR replica state machine.
//!
//! This module implements the core Viewstamped Replication protocol as a
//! pure, deterministic state machine following the FCIS pattern.
//!
//! # Architecture
//!
//! The replica state machine is completely pure:
//! - Takes requests, replies and timer ticks as input
//! - Produces new state, outbound RPCs and commits as output
//! - No I/O, no clocks (time arrives inside events), no randomness beyond
//!   recovery nonces
//!
//! The runtime shell ([`crate::Replica`]) owns the lock around the state,
//! fans RPCs out to peers, feeds their replies back in, and hands commits to
//! a serial executor.
//!
//! # Protocol Overview
//!
//! ## Normal Operation
//!
//! ```text
//! Client ──Send──► Master
//!                    │
//!                    ├──Prepare──► Backup₁
//!                    ├──Prepare──► Backup₂
//!                    │              │
//!                    │◄─PrepareOk───┘ (quorum: commit locally)
//!                    │
//!                    ├──Commit───► All (heartbeat, renews the lease)
//!                    │
//! Client ◄──Reply────┘
//! ```
//!
//! ## View Change
//!
//! ```text
//! Backup ──StartViewChange──► All (on deadline)
//!           │
//!           ▼ (F votes)
//! Backup ──DoViewChange──► New Master
//!           │
//!           ▼ (F messages + own state)
//! New Master ──StartView──► All
//! ```
//!
//! ## Recovery
//!
//! ```text
//! Recovering ──Recovery──► All
//!           │
//!           ▼ (F+1 responses, one from the master of the highest view)
//! Recovering adopts the master's log and becomes a backup
//! ```
//!
//! # Key Types
//!
//! - [`ReplicaState`]: The core state machine state
//! - [`ReplicaOutput`]: Output from processing an event
//! - [`ReplicaEvent`]: Events that can trigger state transitions

mod lease;
mod normal;
mod recovery;
mod state;
mod state_transfer;
mod view_change;

pub use lease::MasterState;
pub use recovery::RecoveryState;
pub use state::*;
pub use view_change::ViewChangeState;

use crate::message::{Request, RpcResult};
use crate::snapshot::Snapshot;
use crate::types::{Command, LogEntry, Nonce, OpNumber, ReplicaId, Timestamp, ViewNumber};

// ============================================================================
// Replica Output
// ============================================================================

/// When a fanout has heard enough to release its caller.
///
/// Peers that have not answered yet keep being contacted in the background
/// regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Done once `op` is committed locally or the view has moved on.
    Commit { view: ViewNumber, op: OpNumber },

    /// Done after `n` successful replies.
    Quorum(usize),

    /// Done once the recovery identified by `nonce` is over.
    Recovery { nonce: Nonce },

    /// Done after the first reply of any kind.
    Any,
}

impl Completion {
    /// Evaluates the completion against the current state, given the number
    /// of successful replies seen so far.
    pub fn is_satisfied(&self, state: &ReplicaState, acks: usize) -> bool {
        match *self {
            Completion::Commit { view, op } => {
                state.commit_number().as_op_number() >= op || state.view() != view
            }
            Completion::Quorum(n) => acks >= n,
            Completion::Recovery { nonce } => !state.is_recovering_with(nonce),
            Completion::Any => true,
        }
    }
}

/// A request to fan out to a set of peers.
#[derive(Debug, Clone)]
pub struct OutboundRpc {
    pub targets: Vec<ReplicaId>,
    pub request: Request,
    pub completion: Completion,
}

/// Work for the serial commit executor, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apply {
    /// Apply the committed entry.
    Commit(LogEntry),

    /// Replace the application state with this snapshot.
    Install(Snapshot),
}

/// Output produced by the replica state machine.
///
/// The caller (runtime) is responsible for:
/// 1. Fanning out the RPCs
/// 2. Returning `reply` to the RPC caller, when the event was a request
/// 3. Handing `applies` to the executor in order
#[derive(Debug, Default)]
pub struct ReplicaOutput {
    /// RPCs to fan out to peers.
    pub rpcs: Vec<OutboundRpc>,

    /// Answer to the request being processed.
    pub reply: Option<RpcResult>,

    /// Commits and snapshot installs, in order.
    pub applies: Vec<Apply>,

    /// If Some, a submitted command was appended at this op in this view.
    pub submitted: Option<(OpNumber, ViewNumber)>,
}

impl ReplicaOutput {
    /// Creates an empty output.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates output answering a request.
    pub fn with_reply(reply: RpcResult) -> Self {
        Self {
            reply: Some(reply),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rpcs.is_empty()
            && self.reply.is_none()
            && self.applies.is_empty()
            && self.submitted.is_none()
    }

    /// Merges another output into this one.
    pub fn merge(&mut self, other: ReplicaOutput) {
        self.rpcs.extend(other.rpcs);
        self.applies.extend(other.applies);
        if other.reply.is_some() {
            self.reply = other.reply;
        }
        if other.submitted.is_some() {
            self.submitted = other.submitted;
        }
    }

    pub(crate) fn send(&mut self, targets: Vec<ReplicaId>, request: Request, completion: Completion) {
        if !targets.is_empty() {
            self.rpcs.push(OutboundRpc {
                targets,
                request,
                completion,
            });
        }
    }
}

// ============================================================================
// Replica Event
// ============================================================================

/// Events that can trigger replica state transitions.
#[derive(Debug, Clone)]
pub enum ReplicaEvent {
    /// The replica process started; begin recovery.
    Start { now: Timestamp },

    /// An inbound request from a peer or a client.
    Request { request: Request, now: Timestamp },

    /// A peer answered one of our outbound RPCs.
    Reply {
        from: ReplicaId,
        response: RpcResult,
        now: Timestamp,
    },

    /// Append a command (master only).
    Submit { command: Command, now: Timestamp },

    /// Periodic deadline check.
    Tick { now: Timestamp },

    /// The executor persisted a snapshot; the log may be compacted.
    SnapshotTaken { snapshot: Snapshot },
}
