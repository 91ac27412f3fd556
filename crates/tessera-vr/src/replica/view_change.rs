//! View change protocol handlers.
//!
//! This module implements the VR view change protocol:
//!
//! 1. **`StartViewChange`**: A replica whose deadline passed bumps its view
//!    and broadcasts to all
//! 2. **`DoViewChange`**: After `F` matching votes, send the whole log to the
//!    master of the new view
//! 3. **`StartView`**: After `F` logs (plus its own), the new master picks the
//!    best log and broadcasts it
//!
//! # Safety Properties
//!
//! - Operations committed in previous views are preserved
//! - At most one master per view
//! - A backup bound by a lease promise does not help elect a new master
//!   before the promise runs out

use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::message::{DoViewChange, PrepareOk, Request, Response, StartView, StartViewChange};
use crate::types::{ReplicaSet, ReplicaStatus, Timestamp, ViewNumber};

use super::{Completion, ReplicaOutput, ReplicaState};

/// Votes and logs gathered for the view change in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewChangeState {
    /// Replicas that sent `StartViewChange` for the current view.
    pub(crate) start_view_change: ReplicaSet,

    /// Replicas whose `DoViewChange` we hold (new master only).
    pub(crate) do_view_change_from: ReplicaSet,

    pub(crate) do_view_change: Vec<DoViewChange>,

    /// Whether we already sent our `DoViewChange` for the current view.
    pub(crate) sent_do_view_change: bool,
}

impl ViewChangeState {
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }
}

impl ReplicaState {
    // ========================================================================
    // View Change Initiation
    // ========================================================================

    /// Starts a view change to the next view.
    pub(crate) fn start_view_change(self, now: Timestamp) -> (Self, ReplicaOutput) {
        let next = self.view.next();
        self.enter_view_change(next, now)
    }

    /// Moves to `view` in view-change status and announces it.
    pub(crate) fn enter_view_change(mut self, view: ViewNumber, now: Timestamp) -> (Self, ReplicaOutput) {
        assert!(
            view > self.view,
            "view number must increase monotonically: current={}, new={}",
            self.view,
            view
        );

        info!(replica = %self.replica_id, from = %self.view, to = %view, "view change");

        self.view = view;
        self.status = ReplicaStatus::ViewChange;
        self.view_change.reset();
        self.recovery = None;
        self.state_transfer = None;
        self.replica_deadline = now.saturating_add(self.config.timeouts.lease);

        let mut output = ReplicaOutput::empty();
        output.send(
            self.others(),
            Request::StartViewChange(StartViewChange {
                view,
                replica: self.replica_id,
            }),
            Completion::Quorum(self.config.max_failures()),
        );

        let (state, quorum_output) = self.check_start_view_change_quorum(now);
        output.merge(quorum_output);
        (state, output)
    }

    // ========================================================================
    // StartViewChange Handler
    // ========================================================================

    /// Handles a `StartViewChange` request.
    pub(crate) fn on_start_view_change(
        mut self,
        svc: StartViewChange,
        now: Timestamp,
    ) -> (Self, ReplicaOutput) {
        if self.status == ReplicaStatus::Recovering {
            return (self, ReplicaOutput::with_reply(Err(RpcError::Recovering)));
        }
        if svc.view < self.view || (svc.view == self.view && self.status == ReplicaStatus::Normal) {
            let err = self.wrong_view();
            return (self, ReplicaOutput::with_reply(Err(err)));
        }

        let mut output = ReplicaOutput::with_reply(Ok(Response::Ack));

        if svc.view > self.view {
            if self.is_promised(now) {
                debug!(
                    replica = %self.replica_id,
                    view = %svc.view,
                    promised_until = %self.promised_until,
                    "deferring view change, lease promised"
                );
                return (self, output);
            }
            let (state, out) = self.enter_view_change(svc.view, now);
            self = state;
            output.merge(out);
        }

        self.view_change.start_view_change.insert(svc.replica);
        let (state, out) = self.check_start_view_change_quorum(now);
        output.merge(out);
        (state, output)
    }

    /// Once `F` others want this view, hands our log to its master.
    fn check_start_view_change_quorum(mut self, now: Timestamp) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::ViewChange
            || self.view_change.start_view_change.len() < self.config.max_failures()
        {
            return (self, ReplicaOutput::empty());
        }

        let leader = self.leader();
        if leader == self.replica_id {
            return self.check_do_view_change_quorum(now);
        }
        if self.view_change.sent_do_view_change {
            return (self, ReplicaOutput::empty());
        }

        debug!(replica = %self.replica_id, view = %self.view, leader = %leader, "sending DoViewChange");
        self.view_change.sent_do_view_change = true;

        let mut output = ReplicaOutput::empty();
        output.send(
            vec![leader],
            Request::DoViewChange(DoViewChange {
                view: self.view,
                replica: self.replica_id,
                transfer: self.full_transfer(),
                normal_view: self.normal_view,
                op_number: self.op_number(),
                commit_number: self.commit_number,
            }),
            Completion::Any,
        );
        (self, output)
    }

    // ========================================================================
    // DoViewChange Handler
    // ========================================================================

    /// Handles a `DoViewChange` request.
    pub(crate) fn on_do_view_change(
        mut self,
        dvc: DoViewChange,
        now: Timestamp,
    ) -> (Self, ReplicaOutput) {
        if self.status == ReplicaStatus::Recovering {
            return (self, ReplicaOutput::with_reply(Err(RpcError::Recovering)));
        }
        if dvc.view < self.view {
            let err = self.wrong_view();
            return (self, ReplicaOutput::with_reply(Err(err)));
        }
        if dvc.view == self.view && self.status == ReplicaStatus::Normal {
            // Late message for a view we already started.
            return (self, ReplicaOutput::with_reply(Ok(Response::Ack)));
        }

        let mut output = ReplicaOutput::with_reply(Ok(Response::Ack));

        if dvc.view > self.view {
            if self.is_promised(now) {
                debug!(
                    replica = %self.replica_id,
                    view = %dvc.view,
                    "deferring DoViewChange, lease promised"
                );
                return (self, output);
            }
            let (state, out) = self.enter_view_change(dvc.view, now);
            self = state;
            output.merge(out);
        }

        if self.leader() != self.replica_id {
            return (self, output);
        }

        // A DoViewChange implies its sender voted for this view.
        self.view_change.start_view_change.insert(dvc.replica);
        if self.view_change.do_view_change_from.insert(dvc.replica) {
            self.view_change.do_view_change.push(dvc);
        }

        let (state, out) = self.check_do_view_change_quorum(now);
        output.merge(out);
        (state, output)
    }

    /// Once `F` logs have arrived, starts the view with the best one.
    fn check_do_view_change_quorum(mut self, now: Timestamp) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::ViewChange
            || self.leader() != self.replica_id
            || self.view_change.do_view_change_from.len() < self.config.max_failures()
        {
            return (self, ReplicaOutput::empty());
        }

        let received = std::mem::take(&mut self.view_change.do_view_change);
        let max_commit = received
            .iter()
            .map(|d| d.commit_number)
            .fold(self.commit_number, std::cmp::Ord::max);

        let ours = (self.normal_view, self.op_number());
        let best = received
            .into_iter()
            .max_by_key(|d| (d.normal_view, d.op_number))
            .filter(|d| (d.normal_view, d.op_number) > ours);

        let mut output = ReplicaOutput::empty();
        if let Some(best) = best {
            debug!(
                replica = %self.replica_id,
                view = %self.view,
                from = %best.replica,
                normal_view = %best.normal_view,
                op = %best.op_number,
                "adopting best log"
            );
            match self.adopt_transfer(best.transfer) {
                Ok(applies) => output.applies.extend(applies),
                Err(err) => {
                    warn!(replica = %self.replica_id, error = %err, "cannot adopt best log");
                    return (self, output);
                }
            }
        }

        let (mut state, commit_output) = self.commit_up_to(max_commit, now);
        output.merge(commit_output);
        assert_eq!(
            state.commit_number, max_commit,
            "new master must hold every committed op"
        );

        state.enter_normal(now);
        state.become_master(now);
        info!(
            replica = %state.replica_id,
            view = %state.view,
            op = %state.op_number(),
            commit = %state.commit_number,
            "became master"
        );

        output.send(
            state.others(),
            Request::StartView(StartView {
                view: state.view,
                transfer: state.full_transfer(),
                op_number: state.op_number(),
                commit_number: state.commit_number,
            }),
            Completion::Commit {
                view: state.view,
                op: state.op_number(),
            },
        );
        (state, output)
    }

    // ========================================================================
    // StartView Handler
    // ========================================================================

    /// Handles a `StartView` request from the new master.
    pub(crate) fn on_start_view(mut self, sv: StartView, now: Timestamp) -> (Self, ReplicaOutput) {
        if sv.view < self.view {
            let err = self.wrong_view();
            return (self, ReplicaOutput::with_reply(Err(err)));
        }

        let mut output = ReplicaOutput::empty();
        if sv.view > self.view || self.status != ReplicaStatus::Normal {
            match self.adopt_transfer(sv.transfer) {
                Ok(applies) => output.applies.extend(applies),
                Err(err) => {
                    warn!(replica = %self.replica_id, view = %sv.view, error = %err, "cannot adopt StartView log");
                    return (self, ReplicaOutput::with_reply(Err(err)));
                }
            }
            self.view = sv.view;
            self.enter_normal(now);
            info!(replica = %self.replica_id, view = %self.view, op = %self.op_number(), "started view");
        }

        let (mut state, commit_output) = self.commit_up_to(sv.commit_number, now);
        output.merge(commit_output);

        let lease_expiry = state.promise(now);
        output.reply = Some(Ok(Response::PrepareOk(PrepareOk {
            view: state.view,
            op_number: state.op_number(),
            replica: state.replica_id,
            lease_expiry,
        })));
        (state, output)
    }
}
