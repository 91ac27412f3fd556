//! Normal operation protocol.
//!
//! This module handles the normal case:
//! - Master appends a submitted command and sends `Prepare` to the backups
//! - Backups append and reply `PrepareOk` with a lease promise
//! - Master commits once a quorum holds the op, then `Commit`s it out
//!
//! Commits are implicit: a backup learns the commit number from the next
//! `Prepare` or `Commit` and applies everything up to it.

use tracing::{debug, info, trace};

use crate::error::RpcError;
use crate::message::{Commit, CommitOk, Prepare, PrepareOk, Request, Response};
use crate::types::{Command, LogEntry, ReplicaId, ReplicaStatus, Timestamp, ViewNumber};

use super::{Completion, ReplicaOutput, ReplicaState};

impl ReplicaState {
    // ========================================================================
    // Master Side
    // ========================================================================

    /// Appends a command to the log and sends it to the backups.
    ///
    /// Does nothing unless this replica is the master in normal status.
    pub(crate) fn on_submit(mut self, command: Command, now: Timestamp) -> (Self, ReplicaOutput) {
        if !self.is_master() {
            debug!(replica = %self.replica_id, status = %self.status, "submit refused, not master");
            return (self, ReplicaOutput::empty());
        }

        let op = self.op_number().next();
        let entry = LogEntry::new(op, self.view, command);
        self.log.add(entry.clone());
        self.master.record_op(self.replica_id, op);

        trace!(replica = %self.replica_id, op = %op, "prepared");

        let mut output = ReplicaOutput::empty();
        let prepare = Prepare {
            view: self.view,
            op_number: op,
            commit_number: self.commit_number,
            entry,
        };
        output.send(
            self.others(),
            Request::Prepare(prepare),
            Completion::Commit {
                view: self.view,
                op,
            },
        );
        output.submitted = Some((op, self.view));

        // A single-replica cluster already has its quorum.
        let (state, commit_output) = self.advance_commit(now);
        output.merge(commit_output);
        (state, output)
    }

    /// Handles a backup's acknowledgement of a `Prepare` (or `StartView`).
    pub(crate) fn on_prepare_ok(mut self, ok: PrepareOk, now: Timestamp) -> (Self, ReplicaOutput) {
        if !self.is_master() || ok.view != self.view {
            return (self, ReplicaOutput::empty());
        }

        let op = ok.op_number.min(self.op_number());
        self.master.record_op(ok.replica, op);
        self.master.record_promise(ok.replica, ok.lease_expiry);
        self.renew_lease(now);
        self.advance_commit(now)
    }

    /// Handles a backup's acknowledgement of a heartbeat.
    pub(crate) fn on_commit_ok(mut self, ok: CommitOk, now: Timestamp) -> (Self, ReplicaOutput) {
        if !self.is_master() || ok.view != self.view {
            return (self, ReplicaOutput::empty());
        }

        self.master.record_promise(ok.replica, ok.lease_expiry);
        self.renew_lease(now);
        (self, ReplicaOutput::empty())
    }

    /// Commits the highest op a quorum holds.
    fn advance_commit(self, now: Timestamp) -> (Self, ReplicaOutput) {
        let candidate = self.master.commit_candidate(self.config.quorum_size());
        if candidate <= self.commit_number.as_op_number() {
            return (self, ReplicaOutput::empty());
        }
        self.commit_up_to(candidate.into(), now)
    }

    // ========================================================================
    // Backup Side
    // ========================================================================

    /// Checks a normal-operation message against our view.
    ///
    /// Returns the rejection to send, or `None` if the message comes from
    /// the master of our current view.
    fn check_master_message(&self, view: ViewNumber) -> Option<RpcError> {
        if view < self.view {
            return Some(self.wrong_view());
        }
        if self.status != ReplicaStatus::Normal {
            return Some(RpcError::NotNormal);
        }
        if self.is_master() {
            return Some(RpcError::NotMaster {
                master: self.replica_id,
            });
        }
        None
    }

    /// Handles a `Prepare` from the master.
    pub(crate) fn on_prepare(mut self, prepare: Prepare, now: Timestamp) -> (Self, ReplicaOutput) {
        if prepare.view > self.view {
            info!(
                replica = %self.replica_id,
                ours = %self.view,
                theirs = %prepare.view,
                "missed a view change, recovering"
            );
            let (state, mut output) = self.start_recovery(now);
            output.reply = Some(Err(RpcError::Recovering));
            return (state, output);
        }
        if let Some(err) = self.check_master_message(prepare.view) {
            return (self, ReplicaOutput::with_reply(Err(err)));
        }

        self.extend_deadline(now);

        let expected = self.op_number().next();
        if prepare.op_number > expected {
            debug!(
                replica = %self.replica_id,
                op = %prepare.op_number,
                expected = %expected,
                "gap in log"
            );
            let (state, mut output) = self.start_state_transfer(now);
            output.reply = Some(Err(RpcError::MissingEntries));
            return (state, output);
        }
        if prepare.op_number == expected {
            debug_assert_eq!(prepare.entry.op_number, prepare.op_number);
            self.log.add(prepare.entry);
        }

        let (mut state, mut output) = self.commit_up_to(prepare.commit_number, now);
        let lease_expiry = state.promise(now);
        output.reply = Some(Ok(Response::PrepareOk(PrepareOk {
            view: state.view,
            op_number: state.op_number(),
            replica: state.replica_id,
            lease_expiry,
        })));
        (state, output)
    }

    /// Handles a `Commit` (heartbeat) from the master.
    pub(crate) fn on_commit(self, commit: Commit, now: Timestamp) -> (Self, ReplicaOutput) {
        if commit.view > self.view {
            info!(
                replica = %self.replica_id,
                ours = %self.view,
                theirs = %commit.view,
                "missed a view change, recovering"
            );
            let (state, mut output) = self.start_recovery(now);
            output.reply = Some(Err(RpcError::Recovering));
            return (state, output);
        }
        if let Some(err) = self.check_master_message(commit.view) {
            return (self, ReplicaOutput::with_reply(Err(err)));
        }

        let (mut state, mut output) = self.commit_up_to(commit.commit_number, now);
        let lease_expiry = state.promise(now);
        output.reply = Some(Ok(Response::CommitOk(CommitOk {
            view: state.view,
            replica: state.replica_id,
            lease_expiry,
        })));
        (state, output)
    }

    // ========================================================================
    // Views and Masters
    // ========================================================================

    /// Answers a client asking who the master is.
    pub(crate) fn on_get_master(self) -> (Self, ReplicaOutput) {
        let reply = if self.status == ReplicaStatus::Normal {
            Ok(Response::Master(self.leader()))
        } else {
            Err(RpcError::MasterFailover)
        };
        (self, ReplicaOutput::with_reply(reply))
    }

    /// Reacts to a peer telling us our view is out of date.
    pub(crate) fn on_wrong_view(
        self,
        from: ReplicaId,
        current: ViewNumber,
        normal: bool,
        now: Timestamp,
    ) -> (Self, ReplicaOutput) {
        match self.status {
            ReplicaStatus::Normal if current > self.view => {
                info!(
                    replica = %self.replica_id,
                    from = %from,
                    ours = %self.view,
                    theirs = %current,
                    "deposed, recovering"
                );
                self.start_recovery(now)
            }
            ReplicaStatus::ViewChange if normal && current >= self.view => {
                info!(
                    replica = %self.replica_id,
                    from = %from,
                    view = %current,
                    "view already settled, recovering"
                );
                self.start_recovery(now)
            }
            ReplicaStatus::ViewChange if !normal && current > self.view => {
                debug!(replica = %self.replica_id, from = %from, view = %current, "joining view change");
                self.enter_view_change(current, now)
            }
            _ => (self, ReplicaOutput::empty()),
        }
    }
}
