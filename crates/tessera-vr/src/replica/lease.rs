//! Master bookkeeping: acknowledged ops and the read lease.
//!
//! Every `PrepareOk` and `CommitOk` carries the backup's promise not to join
//! a view change before some instant. Once `F` backups have promised past a
//! point, no other master can be elected before it, so the master may serve
//! reads locally until then (minus the configured clock drift).

use std::time::Duration;

use tracing::trace;

use crate::message::{Commit, Request};
use crate::types::{OpNumber, ReplicaId, Timestamp};

use super::{Completion, ReplicaOutput, ReplicaState};

/// Per-replica acknowledgement tracking kept by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterState {
    /// Highest op each replica is known to hold in this view.
    pub(crate) highest_op: Vec<OpNumber>,

    /// Latest promise received from each replica.
    pub(crate) heartbeats: Vec<Timestamp>,

    /// Reads are served locally until this instant.
    pub(crate) lease_expiry: Timestamp,
}

impl MasterState {
    pub fn new(cluster_size: usize) -> Self {
        Self {
            highest_op: vec![OpNumber::ZERO; cluster_size],
            heartbeats: vec![Timestamp::ZERO; cluster_size],
            lease_expiry: Timestamp::ZERO,
        }
    }

    /// Starts a fresh term for `master`, which holds the log up to `op`.
    pub(crate) fn reset(&mut self, master: ReplicaId, op: OpNumber) {
        self.highest_op.fill(OpNumber::ZERO);
        self.heartbeats.fill(Timestamp::ZERO);
        self.highest_op[master.as_usize()] = op;
        // The master never contests its own lease.
        self.heartbeats[master.as_usize()] = Timestamp::MAX;
        self.lease_expiry = Timestamp::ZERO;
    }

    pub(crate) fn record_op(&mut self, replica: ReplicaId, op: OpNumber) {
        let slot = &mut self.highest_op[replica.as_usize()];
        *slot = (*slot).max(op);
    }

    pub(crate) fn record_promise(&mut self, replica: ReplicaId, until: Timestamp) {
        let slot = &mut self.heartbeats[replica.as_usize()];
        *slot = (*slot).max(until);
    }

    /// Highest op held by at least `quorum` replicas.
    pub fn commit_candidate(&self, quorum: usize) -> OpNumber {
        debug_assert!(quorum >= 1 && quorum <= self.highest_op.len());
        let mut ops = self.highest_op.clone();
        ops.sort_unstable_by(|a, b| b.cmp(a));
        ops[quorum - 1]
    }

    /// Instant up to which `quorum` replicas (the master included) are
    /// bound, less the clock drift allowance.
    pub fn lease_candidate(&self, quorum: usize, drift: Duration) -> Timestamp {
        debug_assert!(quorum >= 1 && quorum <= self.heartbeats.len());
        let mut promises = self.heartbeats.clone();
        promises.sort_unstable_by(|a, b| b.cmp(a));
        promises[quorum - 1].saturating_sub(drift)
    }
}

impl ReplicaState {
    /// Sets up master bookkeeping after winning a view.
    pub(crate) fn become_master(&mut self, now: Timestamp) {
        self.master.reset(self.replica_id, self.op_number());
        self.replica_deadline = now.saturating_add(self.config.timeouts.lease);
        self.master_deadline = now.saturating_add(self.config.timeouts.heartbeat_interval());
        // A single replica answers to nobody.
        self.renew_lease(now);
    }

    /// Recomputes the lease from the latest promises.
    ///
    /// On improvement the master's own view-change deadline moves with the
    /// lease, and the next heartbeat is scheduled `renew_factor` times per
    /// remaining lease.
    pub(crate) fn renew_lease(&mut self, now: Timestamp) {
        let timeouts = self.config.timeouts;
        let candidate = self
            .master
            .lease_candidate(self.config.quorum_size(), timeouts.max_clock_drift);
        if candidate <= self.master.lease_expiry {
            return;
        }

        self.master.lease_expiry = candidate;
        self.replica_deadline = self.replica_deadline.max(candidate);
        let remaining = candidate.duration_since(now) / timeouts.renew_factor;
        self.master_deadline = now.saturating_add(remaining);
        trace!(replica = %self.replica_id, lease = %candidate, "lease renewed");
    }

    /// Broadcasts the commit number, which doubles as the lease heartbeat.
    pub(crate) fn send_heartbeat(mut self, now: Timestamp) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();
        let commit = Commit {
            view: self.view,
            commit_number: self.commit_number,
        };
        output.send(
            self.others(),
            Request::Commit(commit),
            Completion::Quorum(self.config.max_failures()),
        );
        self.master_deadline = now.saturating_add(self.config.timeouts.heartbeat_interval());
        (self, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_nanos(ms * 1_000_000)
    }

    #[test]
    fn commit_candidate_is_quorum_th_highest() {
        let mut master = MasterState::new(5);
        master.reset(ReplicaId::new(0), OpNumber::new(10));
        master.record_op(ReplicaId::new(1), OpNumber::new(9));
        master.record_op(ReplicaId::new(2), OpNumber::new(4));
        master.record_op(ReplicaId::new(3), OpNumber::new(7));

        // Sorted: 10, 9, 7, 4, 0. Quorum of five is three.
        assert_eq!(master.commit_candidate(3), OpNumber::new(7));
    }

    #[test]
    fn record_op_keeps_maximum() {
        let mut master = MasterState::new(3);
        master.record_op(ReplicaId::new(1), OpNumber::new(5));
        master.record_op(ReplicaId::new(1), OpNumber::new(3));
        assert_eq!(master.highest_op[1], OpNumber::new(5));
    }

    #[test]
    fn lease_needs_f_promises() {
        let mut master = MasterState::new(5);
        master.reset(ReplicaId::new(0), OpNumber::ZERO);
        let drift = Duration::from_millis(10);

        master.record_promise(ReplicaId::new(1), ts(500));
        assert_eq!(master.lease_candidate(3, drift), Timestamp::ZERO);

        master.record_promise(ReplicaId::new(2), ts(400));
        master.record_promise(ReplicaId::new(3), ts(300));
        // Master (unbounded), 500, 400, 300: the third highest is 400.
        assert_eq!(master.lease_candidate(3, drift), ts(390));
    }

    #[test]
    fn single_replica_lease_is_unbounded() {
        let mut master = MasterState::new(1);
        master.reset(ReplicaId::new(0), OpNumber::ZERO);
        assert!(master.lease_candidate(1, Duration::from_millis(10)) > ts(1_000_000_000));
    }
}
