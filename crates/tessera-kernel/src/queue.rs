//! FIFO message queue with in-progress tracking.
//!
//! `Pop` does not discard a message: it moves it to the in-progress set,
//! where it stays until a worker acknowledges it with `Done`. Message ids are
//! assigned at push time and never reused.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{decode, encode};
use crate::{KernelError, StateMachine};

/// A command against the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueCommand {
    Push(String),
    Pop,
    Done(u64),
    Len,
    LenInProgress,
}

impl QueueCommand {
    /// Returns true if this command never mutates the queue.
    pub fn is_read_only(&self) -> bool {
        matches!(self, QueueCommand::Len | QueueCommand::LenInProgress)
    }
}

/// A queued message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: u64,
    pub value: String,
}

/// Successful result of a [`QueueCommand`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOutput {
    Pushed(u64),
    Popped(Option<QueueMessage>),
    Done,
    Len(u64),
}

/// Reply to a [`QueueCommand`].
pub type QueueReply = Result<QueueOutput, QueueError>;

/// Command-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum QueueError {
    #[error("message {0} is not in progress")]
    UnknownMessage(u64),

    #[error("malformed queue command")]
    Malformed,
}

/// The queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pending: VecDeque<QueueMessage>,
    in_progress: BTreeMap<u64, QueueMessage>,
    last_id: u64,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value and returns its message id.
    pub fn push(&mut self, value: String) -> u64 {
        self.last_id += 1;
        self.pending.push_back(QueueMessage {
            id: self.last_id,
            value,
        });
        self.last_id
    }

    /// Moves the head message to in-progress and returns it.
    pub fn pop(&mut self) -> Option<QueueMessage> {
        let message = self.pending.pop_front()?;
        self.in_progress.insert(message.id, message.clone());
        Some(message)
    }

    /// Acknowledges an in-progress message.
    pub fn done(&mut self, id: u64) -> Result<(), QueueError> {
        self.in_progress
            .remove(&id)
            .map(|_| ())
            .ok_or(QueueError::UnknownMessage(id))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len_in_progress(&self) -> usize {
        self.in_progress.len()
    }

    /// Executes a command.
    pub fn execute(&mut self, command: &QueueCommand) -> QueueReply {
        match command {
            QueueCommand::Push(value) => Ok(QueueOutput::Pushed(self.push(value.clone()))),
            QueueCommand::Pop => Ok(QueueOutput::Popped(self.pop())),
            QueueCommand::Done(id) => self.done(*id).map(|()| QueueOutput::Done),
            read => self.read(read),
        }
    }

    /// Executes a read-only command.
    pub fn read(&self, command: &QueueCommand) -> QueueReply {
        match command {
            QueueCommand::Len => Ok(QueueOutput::Len(self.len() as u64)),
            QueueCommand::LenInProgress => Ok(QueueOutput::Len(self.len_in_progress() as u64)),
            QueueCommand::Push(_) | QueueCommand::Pop | QueueCommand::Done(_) => {
                Err(QueueError::Malformed)
            }
        }
    }
}

impl StateMachine for Queue {
    fn apply(&mut self, command: &[u8]) -> Result<Bytes, KernelError> {
        let reply = match decode::<QueueCommand>(command) {
            Ok(cmd) => self.execute(&cmd),
            Err(_) => Err(QueueError::Malformed),
        };
        encode(&reply)
    }

    fn is_read_only(&self, command: &[u8]) -> bool {
        decode::<QueueCommand>(command).is_ok_and(|cmd| cmd.is_read_only())
    }

    fn query(&self, command: &[u8]) -> Result<Bytes, KernelError> {
        let reply = match decode::<QueueCommand>(command) {
            Ok(cmd) => self.read(&cmd),
            Err(_) => Err(QueueError::Malformed),
        };
        encode(&reply)
    }

    fn snapshot(&self) -> Result<Bytes, KernelError> {
        encode(self)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), KernelError> {
        *self = decode(snapshot)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = Queue::new();
        q.push("a".into());
        q.push("b".into());
        assert_eq!(q.pop().map(|m| m.value), Some("a".into()));
        assert_eq!(q.pop().map(|m| m.value), Some("b".into()));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn pop_moves_to_in_progress_until_done() {
        let mut q = Queue::new();
        let id = q.push("job".into());
        let msg = q.pop().expect("message");
        assert_eq!(msg.id, id);
        assert_eq!(q.len(), 0);
        assert_eq!(q.len_in_progress(), 1);

        q.done(id).expect("done");
        assert_eq!(q.len_in_progress(), 0);
        assert_eq!(q.done(id), Err(QueueError::UnknownMessage(id)));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut q = Queue::new();
        let first = q.push("x".into());
        q.pop();
        q.done(first).expect("done");
        let second = q.push("y".into());
        assert!(second > first);
    }

    #[test]
    fn apply_round_trip_through_bytes() {
        let mut q = Queue::new();
        let cmd = encode(&QueueCommand::Push("v".into())).expect("encode");
        let reply: QueueReply = decode(&q.apply(&cmd).expect("apply")).expect("decode");
        assert_eq!(reply, Ok(QueueOutput::Pushed(1)));

        let len = encode(&QueueCommand::Len).expect("encode");
        assert!(q.is_read_only(&len));
        let reply: QueueReply = decode(&q.query(&len).expect("query")).expect("decode");
        assert_eq!(reply, Ok(QueueOutput::Len(1)));
    }

    #[test]
    fn snapshot_preserves_in_progress() {
        let mut q = Queue::new();
        q.push("a".into());
        q.push("b".into());
        q.pop();
        let bytes = q.snapshot().expect("snapshot");

        let mut restored = Queue::new();
        restored.restore(&bytes).expect("restore");
        assert_eq!(restored, q);
        assert_eq!(restored.len_in_progress(), 1);
        assert_eq!(restored.push("c".into()), 3);
    }
}
