//! Error types for the Tessera client.

use tessera_kernel::{KernelError, QueueError, TreeError};
use tessera_vr::{ReplicaId, TransportError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The last replica asked pointed elsewhere and the retry budget ran out.
    #[error("not the master, last redirected to {master}")]
    NotMaster { master: ReplicaId },

    /// No master answered within the retry budget.
    #[error("request timed out")]
    TimedOut,

    /// The request number is older than the last one the cluster committed
    /// for this client.
    #[error("request is older than the last committed request")]
    OldRequest,

    /// The cluster refused the command.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Network failure on the last attempt.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A reply could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] KernelError),

    /// The server answered with a reply of the wrong shape.
    #[error("unexpected response: {0}")]
    Unexpected(String),

    /// The tree refused the command.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// The queue refused the command.
    #[error(transparent)]
    Queue(#[from] QueueError),
}
