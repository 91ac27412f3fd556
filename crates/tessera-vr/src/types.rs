//! Core types for Viewstamped Replication.
//!
//! This module defines the fundamental types used throughout the VR implementation:
//! - [`ReplicaId`] - Unique identifier for a replica in the cluster
//! - [`ViewNumber`] - Monotonically increasing view number
//! - [`OpNumber`] - Position in the replicated log
//! - [`CommitNumber`] - Highest op applied to the state machine
//! - [`ReplicaStatus`] - Current status of a replica
//! - [`ReplicaSet`] - Bounded set of replica ids ("who has replied")
//! - [`Timestamp`] - Wall-clock instant used for lease promises
//! - [`LogEntry`] - Entry in the replicated log

use std::fmt::{Debug, Display};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::client_sessions::ClientId;

// ============================================================================
// Replica Identifier - Copy (single byte)
// ============================================================================

/// Maximum number of replicas in a cluster.
///
/// Bounded by the width of [`ReplicaSet`]. Typical deployments use 3-7.
pub const MAX_REPLICAS: usize = 64;

/// Unique identifier for a replica in the cluster.
///
/// The id is the replica's position in the configured peer list and never
/// changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(u8);

impl ReplicaId {
    /// Creates a new replica ID.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not below `MAX_REPLICAS`.
    pub fn new(id: u8) -> Self {
        assert!(
            (id as usize) < MAX_REPLICAS,
            "replica ID exceeds MAX_REPLICAS"
        );
        Self(id)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "R{}", self.0)
    }
}

impl From<u8> for ReplicaId {
    fn from(id: u8) -> Self {
        Self::new(id)
    }
}

// ============================================================================
// View Number - Copy (8-byte value)
// ============================================================================

/// Monotonically increasing view number.
///
/// A view is a period during which one replica (`view mod N`) is the leader.
/// A replica's current view only increases over time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// The initial view number (view 0).
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next view number.
    pub fn next(&self) -> Self {
        ViewNumber(self.0.saturating_add(1))
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for ViewNumber {
    fn from(view: u64) -> Self {
        Self(view)
    }
}

// ============================================================================
// Operation Number - Copy (8-byte value)
// ============================================================================

/// Position of an operation in the replicated log.
///
/// Operation numbers are assigned sequentially by the leader, starting at 1.
/// Op 0 means "nothing yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpNumber(u64);

impl OpNumber {
    /// The initial operation number (before any operations).
    pub const ZERO: OpNumber = OpNumber(0);

    pub fn new(op: u64) -> Self {
        Self(op)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the next operation number.
    pub fn next(&self) -> Self {
        OpNumber(self.0.saturating_add(1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Returns the number of operations between self and other.
    ///
    /// Returns 0 if other < self.
    pub fn distance_to(&self, other: OpNumber) -> u64 {
        other.0.saturating_sub(self.0)
    }
}

impl Display for OpNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

impl From<u64> for OpNumber {
    fn from(op: u64) -> Self {
        Self(op)
    }
}

// ============================================================================
// Commit Number - Copy (tracks committed position)
// ============================================================================

/// The highest operation number applied to the state machine.
///
/// # Invariants
///
/// - Commit number only increases
/// - Commit number <= op number
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CommitNumber(OpNumber);

impl CommitNumber {
    /// Nothing committed.
    pub const ZERO: CommitNumber = CommitNumber(OpNumber::ZERO);

    pub fn new(op: OpNumber) -> Self {
        Self(op)
    }

    pub fn as_op_number(&self) -> OpNumber {
        self.0
    }

    pub fn as_u64(&self) -> u64 {
        self.0.as_u64()
    }

    /// Returns true if `op` is at or below this commit number.
    pub fn is_committed(&self, op: OpNumber) -> bool {
        op <= self.0
    }
}

impl Display for CommitNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "commit#{}", self.0.as_u64())
    }
}

impl From<OpNumber> for CommitNumber {
    fn from(op: OpNumber) -> Self {
        Self::new(op)
    }
}

// ============================================================================
// Replica Status - Copy (small enum)
// ============================================================================

/// Current status of a replica in the VR protocol.
///
/// Every replica starts in [`ReplicaStatus::Recovering`], whether this is a
/// cold start or a restart after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReplicaStatus {
    /// Processing client requests (leader) or accepting Prepares (backup).
    Normal,

    /// Electing a new leader. Client requests and Prepares are refused.
    ViewChange,

    /// Rebuilding state from peers. Does not vote, cannot lead.
    #[default]
    Recovering,
}

impl ReplicaStatus {
    /// Returns true if the replica can process client requests.
    pub fn can_process_requests(&self) -> bool {
        matches!(self, ReplicaStatus::Normal)
    }
}

impl Display for ReplicaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaStatus::Normal => write!(f, "normal"),
            ReplicaStatus::ViewChange => write!(f, "view-change"),
            ReplicaStatus::Recovering => write!(f, "recovering"),
        }
    }
}

// ============================================================================
// Replica Set - Copy (64-bit bitmap)
// ============================================================================

/// A set of replica ids, bounded by [`MAX_REPLICAS`].
///
/// Used wherever the protocol needs "who has replied" bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaSet(u64);

impl ReplicaSet {
    pub const EMPTY: ReplicaSet = ReplicaSet(0);

    /// Inserts a replica. Returns false if it was already present.
    pub fn insert(&mut self, id: ReplicaId) -> bool {
        let bit = 1u64 << id.as_u8();
        let fresh = self.0 & bit == 0;
        self.0 |= bit;
        fresh
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.0 & (1u64 << id.as_u8()) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Iterates members in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..MAX_REPLICAS as u8)
            .map(ReplicaId)
            .filter(|id| self.contains(*id))
    }
}

impl FromIterator<ReplicaId> for ReplicaSet {
    fn from_iter<I: IntoIterator<Item = ReplicaId>>(iter: I) -> Self {
        let mut set = ReplicaSet::EMPTY;
        for id in iter {
            set.insert(id);
        }
        set
    }
}

// ============================================================================
// Nonce - Copy (random value for protocol freshness)
// ============================================================================

/// Length of nonce in bytes.
pub const NONCE_LENGTH: usize = 16;

/// Random nonce tying recovery responses to the request that asked for them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce([u8; NONCE_LENGTH]);

impl Nonce {
    pub fn from_bytes(bytes: [u8; NONCE_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LENGTH] {
        &self.0
    }

    /// Generates a new random nonce.
    ///
    /// # Panics
    ///
    /// Panics if the OS CSPRNG fails.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LENGTH];
        getrandom::fill(&mut bytes).expect("CSPRNG failure is catastrophic");
        Self(bytes)
    }
}

impl Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Nonce({:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

// ============================================================================
// Timestamp - Copy (wall clock, nanoseconds)
// ============================================================================

/// Wall-clock instant in nanoseconds since the Unix epoch.
///
/// Lease promises cross the network, so they are expressed in wall-clock
/// time. The leader subtracts a configured maximum clock drift before relying
/// on a promise.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Never reached; an unconditional lease.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Reads the system clock.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self(nanos)
    }

    pub fn saturating_add(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_nanos() as u64))
    }

    pub fn saturating_sub(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_nanos() as u64))
    }

    /// Time from `earlier` to `self`, or zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}ms", self.0 / 1_000_000)
    }
}

// ============================================================================
// Commands and Log Entries
// ============================================================================

/// Client identity attached to a command for server-side deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session {
    pub client_id: ClientId,
    pub request_number: u64,
}

/// An opaque command.
///
/// The replica never looks inside `payload`; it is handed to the
/// application's state machine once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub session: Option<Session>,
    pub payload: Bytes,
}

impl Command {
    /// A command with no client session (never deduplicated).
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            session: None,
            payload: payload.into(),
        }
    }

    /// A command deduplicated by `(client_id, request_number)`.
    pub fn with_session(client_id: ClientId, request_number: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            session: Some(Session {
                client_id,
                request_number,
            }),
            payload: payload.into(),
        }
    }
}

/// An entry in the replicated log.
///
/// # Invariants
///
/// - `op_number` is unique and contiguous within a log
/// - `view` is the view in which the leader created the entry; it never
///   changes as the entry is copied between replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub op_number: OpNumber,
    pub view: ViewNumber,
    pub command: Command,
}

impl LogEntry {
    pub fn new(op_number: OpNumber, view: ViewNumber, command: Command) -> Self {
        Self {
            op_number,
            view,
            command,
        }
    }
}

// ============================================================================
// Quorum helpers
// ============================================================================

/// Quorum size (`F+1`) for a cluster of `2F+1` replicas.
///
/// # Panics
///
/// Panics if `cluster_size` is 0.
pub fn quorum_size(cluster_size: usize) -> usize {
    assert!(cluster_size > 0, "cluster size must be positive");
    (cluster_size / 2) + 1
}

/// Maximum number of failures (`F`) a cluster of `cluster_size` tolerates.
pub fn max_failures(cluster_size: usize) -> usize {
    cluster_size / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn replica_id_display() {
        assert_eq!(format!("{}", ReplicaId::new(5)), "R5");
    }

    #[test]
    fn op_number_distance() {
        let op1 = OpNumber::new(5);
        let op2 = OpNumber::new(10);
        assert_eq!(op1.distance_to(op2), 5);
        assert_eq!(op2.distance_to(op1), 0);
    }

    #[test]
    fn replicas_start_recovering() {
        assert_eq!(ReplicaStatus::default(), ReplicaStatus::Recovering);
        assert!(!ReplicaStatus::ViewChange.can_process_requests());
    }

    #[test]
    fn replica_set_dedups() {
        let mut set = ReplicaSet::EMPTY;
        assert!(set.insert(ReplicaId::new(3)));
        assert!(!set.insert(ReplicaId::new(3)));
        assert!(set.insert(ReplicaId::new(63)));
        assert_eq!(set.len(), 2);
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![ReplicaId::new(3), ReplicaId::new(63)]
        );
    }

    #[test]
    #[should_panic(expected = "MAX_REPLICAS")]
    fn replica_id_is_bounded() {
        let _ = ReplicaId::new(64);
    }

    #[test]
    fn timestamp_arithmetic_saturates() {
        let t = Timestamp::from_nanos(1_000);
        assert_eq!(t.saturating_sub(Duration::from_secs(1)), Timestamp::ZERO);
        assert_eq!(Timestamp::ZERO.duration_since(t), Duration::ZERO);
        assert_eq!(
            t.saturating_add(Duration::from_nanos(500)).duration_since(t),
            Duration::from_nanos(500)
        );
    }

    proptest! {
        #[test]
        fn two_quorums_always_intersect(f in 0usize..30) {
            let n = 2 * f + 1;
            prop_assert_eq!(max_failures(n), f);
            prop_assert!(2 * quorum_size(n) > n);
            prop_assert_eq!(quorum_size(n) + max_failures(n), n);
        }

        #[test]
        fn replica_set_len_matches_distinct_inserts(ids in proptest::collection::vec(0u8..64, 0..40)) {
            let set: ReplicaSet = ids.iter().map(|i| ReplicaId::new(*i)).collect();
            let distinct: std::collections::BTreeSet<_> = ids.iter().collect();
            prop_assert_eq!(set.len(), distinct.len());
        }
    }
}
