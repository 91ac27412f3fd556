//! VR protocol messages.
//!
//! Every exchange is a request answered by exactly one [`RpcResult`].
//!
//! ## Normal Operation
//! - [`Prepare`] - Master → Backup: append this entry. Answered by [`PrepareOk`]
//! - [`Commit`] - Master → Backup: ops up to here are committed (also the heartbeat). Answered by [`CommitOk`]
//!
//! ## View Change
//! - [`StartViewChange`] - Replica → All: I think the master is gone
//! - [`DoViewChange`] - Replica → New Master: here is my state for the new view
//! - [`StartView`] - New Master → All: the new view has started. Answered by [`PrepareOk`]
//!
//! ## Recovery
//! - [`RecoveryRequest`] - Recovering → All. Answered by [`RecoveryResponse`]
//! - [`GetState`] - Lagging backup → Master. Answered by [`NewState`]
//!
//! ## Client
//! - `GetMaster` - Client → Any. Answered with the master's id
//! - [`ClientRequest`] - Client → Master. Answered with the encoded reply

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::client_sessions::ClientId;
use crate::error::RpcError;
use crate::log::Log;
use crate::snapshot::Snapshot;
use crate::types::{CommitNumber, LogEntry, Nonce, OpNumber, ReplicaId, Timestamp, ViewNumber};

/// Outcome of an RPC, as seen by the caller.
pub type RpcResult = Result<Response, RpcError>;

// ============================================================================
// Envelopes
// ============================================================================

/// An RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Prepare(Prepare),
    Commit(Commit),
    StartViewChange(StartViewChange),
    DoViewChange(DoViewChange),
    StartView(StartView),
    Recovery(RecoveryRequest),
    GetState(GetState),
    GetMaster,
    Send(ClientRequest),
}

impl Request {
    /// Returns the view number carried by this request, if any.
    pub fn view(&self) -> Option<ViewNumber> {
        match self {
            Request::Prepare(m) => Some(m.view),
            Request::Commit(m) => Some(m.view),
            Request::StartViewChange(m) => Some(m.view),
            Request::DoViewChange(m) => Some(m.view),
            Request::StartView(m) => Some(m.view),
            Request::GetState(m) => Some(m.view),
            Request::Recovery(_) | Request::GetMaster | Request::Send(_) => None,
        }
    }

    /// Returns the replica the request claims to come from, if it names one.
    pub fn sender(&self) -> Option<ReplicaId> {
        match self {
            Request::StartViewChange(m) => Some(m.replica),
            Request::DoViewChange(m) => Some(m.replica),
            Request::Recovery(m) => Some(m.replica),
            _ => None,
        }
    }

    /// Returns a human-readable name for the request type.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Prepare(_) => "Prepare",
            Request::Commit(_) => "Commit",
            Request::StartViewChange(_) => "StartViewChange",
            Request::DoViewChange(_) => "DoViewChange",
            Request::StartView(_) => "StartView",
            Request::Recovery(_) => "Recovery",
            Request::GetState(_) => "GetState",
            Request::GetMaster => "GetMaster",
            Request::Send(_) => "Send",
        }
    }
}

/// A successful RPC response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    PrepareOk(PrepareOk),
    CommitOk(CommitOk),
    /// Bare acknowledgement (view change messages).
    Ack,
    Recovery(RecoveryResponse),
    NewState(NewState),
    Master(ReplicaId),
    /// Encoded state-machine reply to a client command.
    Reply(Bytes),
}

impl Response {
    /// Returns the replica the response claims to come from, if it names one.
    pub fn sender(&self) -> Option<ReplicaId> {
        match self {
            Response::PrepareOk(m) => Some(m.replica),
            Response::CommitOk(m) => Some(m.replica),
            Response::Recovery(m) => Some(m.replica),
            _ => None,
        }
    }
}

// ============================================================================
// Log Transfer
// ============================================================================

/// A log shipped between replicas.
///
/// When the log has been compacted past what the receiver has applied, the
/// sender attaches the snapshot its log base refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTransfer {
    pub log: Log,
    pub snapshot: Option<Snapshot>,
}

impl LogTransfer {
    pub fn last_op(&self) -> OpNumber {
        self.log.last_op()
    }
}

// ============================================================================
// Normal Operation Messages
// ============================================================================

/// Master → Backup: append `entry` at `op_number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub view: ViewNumber,
    pub op_number: OpNumber,
    pub commit_number: CommitNumber,
    pub entry: LogEntry,
}

/// Backup → Master: my log reaches `op_number` in `view`.
///
/// `lease_expiry` is the backup's promise not to join a view change before
/// that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOk {
    pub view: ViewNumber,
    pub op_number: OpNumber,
    pub replica: ReplicaId,
    pub lease_expiry: Timestamp,
}

/// Master → Backup: everything up to `commit_number` is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub view: ViewNumber,
    pub commit_number: CommitNumber,
}

/// Backup → Master: heartbeat acknowledgement with a renewed promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOk {
    pub view: ViewNumber,
    pub replica: ReplicaId,
    pub lease_expiry: Timestamp,
}

// ============================================================================
// View Change Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartViewChange {
    pub view: ViewNumber,
    pub replica: ReplicaId,
}

/// Replica → new master: my state, for best-log selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoViewChange {
    pub view: ViewNumber,
    pub replica: ReplicaId,
    pub transfer: LogTransfer,
    /// Last view in which the sender was in normal status.
    pub normal_view: ViewNumber,
    pub op_number: OpNumber,
    pub commit_number: CommitNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartView {
    pub view: ViewNumber,
    pub transfer: LogTransfer,
    pub op_number: OpNumber,
    pub commit_number: CommitNumber,
}

// ============================================================================
// Recovery Messages
// ============================================================================

/// Recovering replica → All.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub replica: ReplicaId,
    pub nonce: Nonce,
    /// Every op up to here is already applied by the requester.
    pub snapshot_index: OpNumber,
}

/// Any → Recovering replica.
///
/// Only the master of `view`, in normal status, fills in `transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResponse {
    pub view: ViewNumber,
    pub nonce: Nonce,
    pub transfer: Option<LogTransfer>,
    pub op_number: OpNumber,
    pub commit_number: CommitNumber,
    pub replica: ReplicaId,
    pub is_normal: bool,
}

/// Lagging backup → Master: send me everything after `op_number`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetState {
    pub view: ViewNumber,
    pub op_number: OpNumber,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewState {
    pub view: ViewNumber,
    pub transfer: LogTransfer,
    pub op_number: OpNumber,
    pub commit_number: CommitNumber,
}

// ============================================================================
// Client Messages
// ============================================================================

/// A client command, deduplicated by `(client_id, request_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: ClientId,
    pub request_number: u64,
    pub payload: Bytes,
}
