//! The commit contract between the replica and an application.

use bytes::Bytes;

use crate::KernelError;

/// A deterministic command interpreter driven by committed log entries.
///
/// The replica calls [`apply`](StateMachine::apply) exactly once per committed
/// op number, in op-number order, from a single serial executor. Commands are
/// opaque to the replica; the state machine decodes them itself.
///
/// Implementations must be deterministic: two replicas that apply the same
/// sequence of commands must produce byte-identical snapshots.
pub trait StateMachine: Send + 'static {
    /// Applies a committed command and returns the encoded reply.
    ///
    /// A malformed command is not an error here: it is answered with an
    /// encoded failure reply so that every replica stays in lockstep.
    fn apply(&mut self, command: &[u8]) -> Result<Bytes, KernelError>;

    /// Returns true if `command` never mutates state.
    ///
    /// Read-only commands may be answered by a master holding a valid lease
    /// without going through the log.
    fn is_read_only(&self, command: &[u8]) -> bool;

    /// Answers a read-only command against the current state.
    fn query(&self, command: &[u8]) -> Result<Bytes, KernelError>;

    /// Serializes the complete state.
    fn snapshot(&self) -> Result<Bytes, KernelError>;

    /// Replaces the complete state with a previously taken snapshot.
    fn restore(&mut self, snapshot: &[u8]) -> Result<(), KernelError>;
}
