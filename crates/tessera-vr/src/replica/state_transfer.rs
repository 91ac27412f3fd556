//! State transfer.
//!
//! A normal backup that falls behind (a gap in the `Prepare` stream, or a
//! commit number past its log) asks the master for everything after its
//! commit number. At most one request is in flight; it is forgotten after a
//! lease so a lost answer does not block catching up forever.

use tracing::{debug, warn};

use crate::error::RpcError;
use crate::message::{GetState, NewState, Request, Response};
use crate::types::{ReplicaStatus, Timestamp};

use super::{Completion, ReplicaOutput, ReplicaState};

impl ReplicaState {
    /// Asks the master for the entries after our commit number.
    pub(crate) fn start_state_transfer(mut self, now: Timestamp) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::Normal || self.is_master() || self.state_transfer.is_some() {
            return (self, ReplicaOutput::empty());
        }

        debug!(
            replica = %self.replica_id,
            commit = %self.commit_number,
            master = %self.leader(),
            "requesting state"
        );
        self.state_transfer = Some(now);

        let mut output = ReplicaOutput::empty();
        output.send(
            vec![self.leader()],
            Request::GetState(GetState {
                view: self.view,
                op_number: self.commit_number.as_op_number(),
            }),
            Completion::Any,
        );
        (self, output)
    }

    /// Serves a lagging backup.
    pub(crate) fn on_get_state(self, req: GetState) -> (Self, ReplicaOutput) {
        if self.status != ReplicaStatus::Normal {
            return (self, ReplicaOutput::with_reply(Err(RpcError::NotNormal)));
        }
        if req.view != self.view {
            let err = self.wrong_view();
            return (self, ReplicaOutput::with_reply(Err(err)));
        }
        if !self.is_master() {
            let master = self.leader();
            return (
                self,
                ReplicaOutput::with_reply(Err(RpcError::NotMaster { master })),
            );
        }

        let new_state = NewState {
            view: self.view,
            transfer: self.build_transfer(req.op_number),
            op_number: self.op_number(),
            commit_number: self.commit_number,
        };
        (
            self,
            ReplicaOutput::with_reply(Ok(Response::NewState(new_state))),
        )
    }

    /// Splices the master's answer into our log.
    pub(crate) fn on_new_state(mut self, new_state: NewState, now: Timestamp) -> (Self, ReplicaOutput) {
        self.state_transfer = None;
        if self.status != ReplicaStatus::Normal || new_state.view != self.view || self.is_master() {
            return (self, ReplicaOutput::empty());
        }

        let applies = match self.adopt_transfer(new_state.transfer) {
            Ok(applies) => applies,
            Err(err) => {
                warn!(replica = %self.replica_id, error = %err, "cannot adopt state");
                return (self, ReplicaOutput::empty());
            }
        };

        let (state, mut output) = self.commit_up_to(new_state.commit_number, now);
        let mut applies = applies;
        applies.append(&mut output.applies);
        output.applies = applies;
        debug!(
            replica = %state.replica_id,
            op = %state.op_number(),
            commit = %state.commit_number,
            "caught up"
        );
        (state, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::replica::{Apply, ReplicaEvent};
    use crate::snapshot::Snapshot;
    use crate::types::{Command, OpNumber, ReplicaId, ViewNumber};

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_nanos(ms * 1_000_000)
    }

    fn master_with(ops: u64) -> ReplicaState {
        let mut master = ReplicaState::new(ReplicaId::new(0), ClusterConfig::new(1));
        master.enter_normal(ts(0));
        master.become_master(ts(0));
        for i in 0..ops {
            let (next, _) = master.process(ReplicaEvent::Submit {
                command: Command::new(format!("cmd-{i}")),
                now: ts(1),
            });
            master = next;
        }
        master
    }

    fn backup() -> ReplicaState {
        let mut backup = ReplicaState::new(ReplicaId::new(1), ClusterConfig::new(3));
        backup.enter_normal(ts(0));
        backup
    }

    fn ask(master: ReplicaState, from: OpNumber) -> NewState {
        let (_, output) = master.process(ReplicaEvent::Request {
            request: Request::GetState(GetState {
                view: ViewNumber::ZERO,
                op_number: from,
            }),
            now: ts(2),
        });
        match output.reply {
            Some(Ok(Response::NewState(new_state))) => new_state,
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn only_one_request_in_flight() {
        let (backup, output) = backup().start_state_transfer(ts(1));
        assert_eq!(output.rpcs.len(), 1);
        let (backup, output) = backup.start_state_transfer(ts(2));
        assert!(output.rpcs.is_empty());

        let lease = backup.config.timeouts.lease;
        let (backup, _) = backup.process(ReplicaEvent::Tick {
            now: ts(1).saturating_add(lease),
        });
        assert!(backup.state_transfer.is_none());
    }

    #[test]
    fn request_from_another_view_is_refused() {
        let (_, output) = master_with(2).process(ReplicaEvent::Request {
            request: Request::GetState(GetState {
                view: ViewNumber::new(3),
                op_number: OpNumber::ZERO,
            }),
            now: ts(2),
        });
        assert_eq!(
            output.reply,
            Some(Err(RpcError::WrongView {
                current: ViewNumber::ZERO,
                normal: true,
            }))
        );
    }

    #[test]
    fn backup_catches_up_from_master() {
        // The single-replica master stands in for a master in view 0.
        let new_state = ask(master_with(5), OpNumber::ZERO);
        assert_eq!(new_state.commit_number.as_u64(), 5);

        let (backup, _) = backup().start_state_transfer(ts(1));
        let (backup, output) = backup.process(ReplicaEvent::Reply {
            from: ReplicaId::new(0),
            response: Ok(Response::NewState(new_state)),
            now: ts(3),
        });

        assert!(backup.state_transfer.is_none());
        assert_eq!(backup.op_number(), OpNumber::new(5));
        assert_eq!(backup.commit_number().as_u64(), 5);
        assert_eq!(output.applies.len(), 5);
    }

    #[test]
    fn compacted_master_ships_snapshot() {
        let (master, _) = master_with(6).process(ReplicaEvent::SnapshotTaken {
            snapshot: Snapshot::new(OpNumber::new(4), "four"),
        });

        let partial = ask(master.clone(), OpNumber::new(5));
        assert!(partial.transfer.snapshot.is_none());

        let new_state = ask(master, OpNumber::ZERO);
        assert_eq!(
            new_state.transfer.snapshot.as_ref().map(|s| s.index),
            Some(OpNumber::new(4))
        );

        let (backup, output) = backup().process(ReplicaEvent::Reply {
            from: ReplicaId::new(0),
            response: Ok(Response::NewState(new_state)),
            now: ts(3),
        });
        assert_eq!(backup.commit_number().as_u64(), 6);
        assert_eq!(backup.log().base(), OpNumber::new(4));
        assert!(matches!(output.applies.first(), Some(Apply::Install(s)) if s.index == OpNumber::new(4)));
        assert_eq!(output.applies.len(), 3);
    }

    #[test]
    fn backup_refuses_to_serve() {
        let (_, output) = backup().process(ReplicaEvent::Request {
            request: Request::GetState(GetState {
                view: ViewNumber::ZERO,
                op_number: OpNumber::ZERO,
            }),
            now: ts(1),
        });
        assert_eq!(
            output.reply,
            Some(Err(RpcError::NotMaster {
                master: ReplicaId::new(0)
            }))
        );
    }
}
