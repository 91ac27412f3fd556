//! Recovery protocol.
//!
//! A replica that starts up, or learns that it missed a view change, asks
//! every peer for its state under a fresh nonce:
//!
//! 1. Broadcast `Recovery` with the op its snapshot already covers
//! 2. Collect `F+1` responses matching the nonce
//! 3. If the master of the highest reported view answered in normal status,
//!    adopt its log and rejoin as a backup
//! 4. If nobody is normal (a cluster starting cold), start a view change
//!    instead
//!
//! Anything else keeps waiting; the replica deadline retries with a new
//! nonce.

use tracing::{debug, info, warn};

use crate::message::{RecoveryRequest, RecoveryResponse, Request, Response};
use crate::types::{Nonce, ReplicaSet, ReplicaStatus, Timestamp};

use super::{Completion, ReplicaOutput, ReplicaState};

/// Responses gathered by one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryState {
    pub(crate) nonce: Nonce,

    /// Replicas that answered this attempt.
    pub(crate) responders: ReplicaSet,

    /// Responders with an empty log.
    pub(crate) empty: usize,

    /// Responders not in normal status.
    pub(crate) not_normal: usize,

    pub(crate) responses: Vec<RecoveryResponse>,
}

impl RecoveryState {
    pub fn new(nonce: Nonce) -> Self {
        Self {
            nonce,
            responders: ReplicaSet::EMPTY,
            empty: 0,
            not_normal: 0,
            responses: Vec::new(),
        }
    }

    /// Records a response. Returns false for a repeat from the same replica.
    fn record(&mut self, response: RecoveryResponse) -> bool {
        if !self.responders.insert(response.replica) {
            return false;
        }
        if response.op_number.is_zero() {
            self.empty += 1;
        }
        if !response.is_normal {
            self.not_normal += 1;
        }
        self.responses.push(response);
        true
    }
}

impl ReplicaState {
    /// Enters recovering status and asks every peer for its state.
    pub(crate) fn start_recovery(mut self, now: Timestamp) -> (Self, ReplicaOutput) {
        let nonce = Nonce::generate();
        info!(replica = %self.replica_id, view = %self.view, commit = %self.commit_number, "recovering");

        self.status = ReplicaStatus::Recovering;
        self.recovery = Some(RecoveryState::new(nonce));
        self.view_change.reset();
        self.state_transfer = None;
        self.replica_deadline = now.saturating_add(self.config.timeouts.lease);

        if self.config.cluster_size() == 1 {
            return self.start_view_change(now);
        }

        let mut output = ReplicaOutput::empty();
        output.send(
            self.others(),
            Request::Recovery(RecoveryRequest {
                replica: self.replica_id,
                nonce,
                snapshot_index: self.commit_number.as_op_number(),
            }),
            Completion::Recovery { nonce },
        );
        (self, output)
    }

    /// Answers a recovering peer.
    ///
    /// Only the master ships its log; everyone reports view and status.
    pub(crate) fn on_recovery_request(self, req: RecoveryRequest) -> (Self, ReplicaOutput) {
        let is_normal = self.status == ReplicaStatus::Normal;
        let transfer = self
            .is_master()
            .then(|| self.build_transfer(req.snapshot_index));

        let response = RecoveryResponse {
            view: self.view,
            nonce: req.nonce,
            transfer,
            op_number: self.op_number(),
            commit_number: self.commit_number,
            replica: self.replica_id,
            is_normal,
        };
        (self, ReplicaOutput::with_reply(Ok(Response::Recovery(response))))
    }

    /// Handles a peer's recovery response.
    pub(crate) fn on_recovery_response(
        mut self,
        response: RecoveryResponse,
        now: Timestamp,
    ) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::Recovering {
            return (self, ReplicaOutput::empty());
        }
        let Some(recovery) = self.recovery.as_mut() else {
            return (self, ReplicaOutput::empty());
        };
        if recovery.nonce != response.nonce || !recovery.record(response) {
            return (self, ReplicaOutput::empty());
        }

        self.try_complete_recovery(now)
    }

    fn try_complete_recovery(self, now: Timestamp) -> (Self, ReplicaOutput) {
        let Some(recovery) = self.recovery.as_ref() else {
            return (self, ReplicaOutput::empty());
        };
        if recovery.responders.len() < self.config.quorum_size() {
            return (self, ReplicaOutput::empty());
        }

        let max_view = recovery
            .responses
            .iter()
            .map(|r| r.view)
            .max()
            .unwrap_or(self.view);
        let master = self.config.leader_for_view(max_view);

        let from_master = recovery
            .responses
            .iter()
            .find(|r| r.replica == master && r.view == max_view && r.is_normal && r.transfer.is_some())
            .cloned();

        if let Some(response) = from_master {
            if response.view < self.view {
                debug!(
                    replica = %self.replica_id,
                    ours = %self.view,
                    theirs = %response.view,
                    "master's view is behind ours, waiting"
                );
                return (self, ReplicaOutput::empty());
            }
            return self.finish_recovery(response, now);
        }

        if recovery.not_normal == recovery.responses.len() {
            let (empty, not_normal) = (recovery.empty, recovery.not_normal);
            if empty == recovery.responses.len() {
                info!(replica = %self.replica_id, responders = empty, "cluster is empty, starting view change");
            } else {
                info!(replica = %self.replica_id, responders = not_normal, "no normal replica, starting view change");
            }
            let next = self.view.max(max_view).next();
            return self.enter_view_change(next, now);
        }

        debug!(
            replica = %self.replica_id,
            responders = recovery.responders.len(),
            "waiting for the master's response"
        );
        (self, ReplicaOutput::empty())
    }

    fn finish_recovery(mut self, response: RecoveryResponse, now: Timestamp) -> (Self, ReplicaOutput) {
        let Some(transfer) = response.transfer else {
            return (self, ReplicaOutput::empty());
        };

        let applies = match self.adopt_transfer(transfer) {
            Ok(applies) => applies,
            Err(err) => {
                warn!(replica = %self.replica_id, from = %response.replica, error = %err, "cannot adopt recovery log");
                return (self, ReplicaOutput::empty());
            }
        };

        self.view = response.view;
        self.enter_normal(now);

        let (state, mut output) = self.commit_up_to(response.commit_number, now);
        let mut applies = applies;
        applies.append(&mut output.applies);
        output.applies = applies;
        info!(
            replica = %state.replica_id,
            view = %state.view,
            op = %state.op_number(),
            commit = %state.commit_number,
            "recovered"
        );
        (state, output)
    }
}
