//! Error types for the VR crate.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ReplicaId, ViewNumber};

/// Result type for replica operations.
pub type VrResult<T> = Result<T, VrError>;

/// Protocol-level rejection carried back to the caller of an RPC.
///
/// These travel over the wire, so they are plain data. A caller uses the
/// variant to decide whether to retry, redirect or give up.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RpcError {
    /// The message carried a view older than the receiver's.
    ///
    /// `normal` tells the caller whether the receiver has already established
    /// `current` (it is in normal status) or is still electing.
    #[error("wrong view: receiver is at {current} (normal: {normal})")]
    WrongView { current: ViewNumber, normal: bool },

    /// The receiver is not in normal status.
    #[error("replica is not in normal status")]
    NotNormal,

    /// The receiver is not the master of its view.
    #[error("not the master, try {master}")]
    NotMaster { master: ReplicaId },

    /// A view change or recovery is in progress, or the submitted command
    /// lost its slot to a different one.
    #[error("master failover in progress")]
    MasterFailover,

    /// The request number is below the last one committed for the client.
    #[error("request is older than the last committed request")]
    OldRequest,

    /// The receiver cannot accept the message without entries it lacks.
    #[error("missing log entries")]
    MissingEntries,

    /// The receiver is recovering and does not take part in the protocol.
    #[error("replica is recovering")]
    Recovering,

    /// The message names a replica outside the cluster.
    #[error("replica {replica} is not a member of the cluster")]
    UnknownReplica { replica: ReplicaId },

    /// The state machine could not process the command.
    #[error("state machine error: {0}")]
    StateMachine(String),
}

/// Network-level failures. These are the only errors the fanout engine retries.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The target is unreachable or refused the connection.
    #[error("replica {0} is unreachable")]
    Unreachable(ReplicaId),

    /// The connection was torn down while the call was in flight.
    #[error("connection to {0} was shut down")]
    Shutdown(ReplicaId),

    /// The call did not complete in time.
    #[error("call to {0} timed out")]
    Timeout(ReplicaId),

    /// The local transport is disconnected.
    #[error("transport is disconnected")]
    Disconnected,

    /// A frame could not be encoded or decoded.
    #[error("framing error: {0}")]
    Framing(String),

    /// I/O error on a socket.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors surfaced by the replica runtime.
#[derive(Debug, Error)]
pub enum VrError {
    /// Rejected by the protocol.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Network failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Snapshot file I/O failed.
    #[error("snapshot error at {path}: {source}")]
    Snapshot {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A snapshot file exists but is too short to hold its header.
    #[error("corrupt snapshot at {0}")]
    CorruptSnapshot(PathBuf),

    /// The application state machine failed.
    #[error("kernel error: {0}")]
    Kernel(#[from] tessera_kernel::KernelError),

    /// The submitted command was not committed in time.
    #[error("timed out waiting for commit")]
    Timeout,

    /// The replica has been shut down.
    #[error("replica is shut down")]
    Shutdown,

    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VrError {
    /// Returns the wire-level rejection for this error.
    pub fn into_rpc(self) -> RpcError {
        match self {
            VrError::Rpc(err) => err,
            VrError::Kernel(err) => RpcError::StateMachine(err.to_string()),
            _ => RpcError::MasterFailover,
        }
    }
}
