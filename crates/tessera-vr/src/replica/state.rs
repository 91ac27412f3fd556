//! Replica state structure.
//!
//! This module defines [`ReplicaState`], the core state of a VR replica.
//! The state is cloneable for deterministic testing and follows the FCIS
//! pattern (pure, no I/O).

use tracing::{debug, trace, warn};

use crate::config::ClusterConfig;
use crate::error::RpcError;
use crate::log::Log;
use crate::message::{LogTransfer, Request, Response, RpcResult};
use crate::snapshot::Snapshot;
use crate::types::{
    CommitNumber, Nonce, OpNumber, ReplicaId, ReplicaStatus, Timestamp, ViewNumber,
};

use super::lease::MasterState;
use super::recovery::RecoveryState;
use super::view_change::ViewChangeState;
use super::{Apply, ReplicaEvent, ReplicaOutput};

// ============================================================================
// Replica State
// ============================================================================

/// The state of a VR replica.
///
/// # State Categories
///
/// 1. **Identity**: `replica_id`, `config`
/// 2. **View State**: `view`, `status`, `normal_view`
/// 3. **Log State**: `log`, `commit_number`, `snapshot`
/// 4. **Sub-protocols**: `master`, `view_change`, `recovery`, `state_transfer`
/// 5. **Timers**: `replica_deadline`, `master_deadline`, `promised_until`
///
/// # Invariants
///
/// - `log.base() <= commit_number <= op_number()`
/// - `view` never decreases
/// - If the log is compacted (`log.base() > 0`), `snapshot` covers exactly
///   `log.base()`
#[derive(Debug, Clone)]
pub struct ReplicaState {
    // ========================================================================
    // Identity
    // ========================================================================
    /// This replica's ID.
    pub(crate) replica_id: ReplicaId,

    /// Cluster configuration.
    pub(crate) config: ClusterConfig,

    // ========================================================================
    // View State
    // ========================================================================
    /// Current view number.
    pub(crate) view: ViewNumber,

    /// Current replica status.
    pub(crate) status: ReplicaStatus,

    /// Last view in which this replica was in normal status.
    ///
    /// Used during view change to determine which replica has the most
    /// up-to-date log.
    pub(crate) normal_view: ViewNumber,

    // ========================================================================
    // Log State
    // ========================================================================
    /// The replicated log. Its last op is this replica's op number.
    pub(crate) log: Log,

    /// Highest committed operation number.
    pub(crate) commit_number: CommitNumber,

    /// Snapshot covering the compacted prefix of the log.
    pub(crate) snapshot: Option<Snapshot>,

    // ========================================================================
    // Sub-protocol State
    // ========================================================================
    /// Acknowledgement and lease tracking (meaningful only while master).
    pub(crate) master: MasterState,

    /// Votes and logs collected during a view change.
    pub(crate) view_change: ViewChangeState,

    /// Responses collected while recovering.
    pub(crate) recovery: Option<RecoveryState>,

    /// When the in-flight state transfer was requested, if any.
    pub(crate) state_transfer: Option<Timestamp>,

    // ========================================================================
    // Timers
    // ========================================================================
    /// Past this instant without hearing from the master, this replica
    /// starts a view change (or retries recovery).
    pub(crate) replica_deadline: Timestamp,

    /// When the master sends its next heartbeat.
    pub(crate) master_deadline: Timestamp,

    /// This replica promised the master not to join a view change before
    /// this instant.
    pub(crate) promised_until: Timestamp,
}

impl ReplicaState {
    /// Creates a fresh replica with an empty log.
    ///
    /// The replica starts in recovering status and must be started with
    /// [`ReplicaEvent::Start`].
    pub fn new(replica_id: ReplicaId, config: ClusterConfig) -> Self {
        assert!(
            config.contains(replica_id),
            "replica {replica_id} is not part of the cluster"
        );
        let master = MasterState::new(config.cluster_size());

        Self {
            replica_id,
            config,
            view: ViewNumber::ZERO,
            status: ReplicaStatus::Recovering,
            normal_view: ViewNumber::ZERO,
            log: Log::new(),
            commit_number: CommitNumber::ZERO,
            snapshot: None,
            master,
            view_change: ViewChangeState::default(),
            recovery: None,
            state_transfer: None,
            replica_deadline: Timestamp::ZERO,
            master_deadline: Timestamp::ZERO,
            promised_until: Timestamp::ZERO,
        }
    }

    /// Creates a replica whose state up to `snapshot.index` was restored
    /// from disk.
    ///
    /// The snapshot's commands are already applied; the log starts empty
    /// just after it.
    pub fn from_snapshot(replica_id: ReplicaId, config: ClusterConfig, snapshot: Snapshot) -> Self {
        let mut state = Self::new(replica_id, config);
        state.log = Log::with_base(snapshot.index);
        state.commit_number = CommitNumber::new(snapshot.index);
        state.snapshot = Some(snapshot);
        state
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns this replica's ID.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Returns the cluster configuration.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Returns the current view number.
    pub fn view(&self) -> ViewNumber {
        self.view
    }

    /// Returns the current replica status.
    pub fn status(&self) -> ReplicaStatus {
        self.status
    }

    /// Returns the last view in which this replica was normal.
    pub fn normal_view(&self) -> ViewNumber {
        self.normal_view
    }

    /// Returns the highest operation number.
    pub fn op_number(&self) -> OpNumber {
        self.log.last_op()
    }

    /// Returns the highest committed operation number.
    pub fn commit_number(&self) -> CommitNumber {
        self.commit_number
    }

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Digest of the committed part of the log.
    pub fn log_hash(&self) -> [u8; 32] {
        self.log.content_hash(self.commit_number.as_op_number())
    }

    /// Returns the master for the current view.
    pub fn leader(&self) -> ReplicaId {
        self.config.leader_for_view(self.view)
    }

    /// Returns true if this replica is the master of the current view and
    /// in normal status.
    pub fn is_master(&self) -> bool {
        self.status == ReplicaStatus::Normal && self.leader() == self.replica_id
    }

    /// Returns the instant the master's read lease runs out.
    pub fn lease_expiry(&self) -> Timestamp {
        self.master.lease_expiry
    }

    /// Returns true if this replica may answer reads from local state.
    pub fn has_valid_lease(&self, now: Timestamp) -> bool {
        self.is_master() && now < self.master.lease_expiry
    }

    /// Returns true while the recovery identified by `nonce` is running.
    pub fn is_recovering_with(&self, nonce: Nonce) -> bool {
        self.status == ReplicaStatus::Recovering
            && self.recovery.as_ref().is_some_and(|r| r.nonce == nonce)
    }

    /// Returns true if this backup is bound by a promise to the master.
    pub(crate) fn is_promised(&self, now: Timestamp) -> bool {
        self.status == ReplicaStatus::Normal && !self.is_master() && now < self.promised_until
    }

    pub(crate) fn others(&self) -> Vec<ReplicaId> {
        self.config.others(self.replica_id).collect()
    }

    pub(crate) fn wrong_view(&self) -> RpcError {
        RpcError::WrongView {
            current: self.view,
            normal: self.status == ReplicaStatus::Normal,
        }
    }

    // ========================================================================
    // Event Processing
    // ========================================================================

    /// Processes an event and returns the new state and output.
    ///
    /// This method is pure: it takes ownership of `self`, processes the
    /// event, and returns a new state. The caller is responsible for
    /// executing the output (fanning out RPCs, applying commits).
    pub fn process(self, event: ReplicaEvent) -> (Self, ReplicaOutput) {
        let (state, output) = match event {
            ReplicaEvent::Start { now } => self.start_recovery(now),
            ReplicaEvent::Request { request, now } => self.on_request(request, now),
            ReplicaEvent::Reply {
                from,
                response,
                now,
            } => self.on_reply(from, response, now),
            ReplicaEvent::Submit { command, now } => self.on_submit(command, now),
            ReplicaEvent::Tick { now } => self.on_tick(now),
            ReplicaEvent::SnapshotTaken { snapshot } => self.on_snapshot_taken(snapshot),
        };
        state.check_invariants();
        (state, output)
    }

    /// Handles an inbound request. The output always carries a reply.
    fn on_request(self, request: Request, now: Timestamp) -> (Self, ReplicaOutput) {
        trace!(replica = %self.replica_id, request = request.name(), "request");

        if let Some(sender) = request.sender() {
            if !self.config.contains(sender) || sender == self.replica_id {
                warn!(replica = %self.replica_id, claimed = %sender, request = request.name(), "request from unknown replica");
                return (
                    self,
                    ReplicaOutput::with_reply(Err(RpcError::UnknownReplica { replica: sender })),
                );
            }
        }

        let (state, output) = match request {
            // Normal operation
            Request::Prepare(prepare) => self.on_prepare(prepare, now),
            Request::Commit(commit) => self.on_commit(commit, now),

            // View change
            Request::StartViewChange(svc) => self.on_start_view_change(svc, now),
            Request::DoViewChange(dvc) => self.on_do_view_change(dvc, now),
            Request::StartView(sv) => self.on_start_view(sv, now),

            // Recovery and state transfer
            Request::Recovery(req) => self.on_recovery_request(req),
            Request::GetState(req) => self.on_get_state(req),

            // Client
            Request::GetMaster => self.on_get_master(),
            Request::Send(_) => {
                // Client commands are routed by the runtime; one reaching the
                // core means this replica cannot take it.
                let master = self.leader();
                (
                    self,
                    ReplicaOutput::with_reply(Err(RpcError::NotMaster { master })),
                )
            }
        };
        debug_assert!(output.reply.is_some(), "every request gets a reply");
        (state, output)
    }

    /// Handles a peer's answer to one of our RPCs.
    fn on_reply(self, from: ReplicaId, response: RpcResult, now: Timestamp) -> (Self, ReplicaOutput) {
        if !self.config.contains(from) {
            return (self, ReplicaOutput::empty());
        }
        if let Ok(claimed) = response.as_ref().map(Response::sender) {
            if claimed.is_some_and(|claimed| claimed != from) {
                warn!(replica = %self.replica_id, from = %from, claimed = ?claimed, "reply names another replica");
                return (self, ReplicaOutput::empty());
            }
        }

        match response {
            Ok(Response::PrepareOk(ok)) => self.on_prepare_ok(ok, now),
            Ok(Response::CommitOk(ok)) => self.on_commit_ok(ok, now),
            Ok(Response::Recovery(resp)) => self.on_recovery_response(resp, now),
            Ok(Response::NewState(new_state)) => self.on_new_state(new_state, now),
            Ok(Response::Ack | Response::Master(_) | Response::Reply(_)) => {
                (self, ReplicaOutput::empty())
            }
            Err(RpcError::WrongView { current, normal }) => {
                self.on_wrong_view(from, current, normal, now)
            }
            Err(err) => {
                trace!(replica = %self.replica_id, from = %from, error = %err, "peer refused");
                (self, ReplicaOutput::empty())
            }
        }
    }

    /// Checks deadlines.
    fn on_tick(mut self, now: Timestamp) -> (Self, ReplicaOutput) {
        let mut output = ReplicaOutput::empty();

        if let Some(started) = self.state_transfer {
            if now >= started.saturating_add(self.config.timeouts.lease) {
                debug!(replica = %self.replica_id, "state transfer timed out");
                self.state_transfer = None;
            }
        }

        if now >= self.replica_deadline {
            let (state, out) = match self.status {
                ReplicaStatus::Normal => {
                    debug!(
                        replica = %self.replica_id,
                        view = %self.view,
                        master = self.is_master(),
                        "no word from the master, starting view change"
                    );
                    self.start_view_change(now)
                }
                ReplicaStatus::ViewChange => {
                    debug!(replica = %self.replica_id, view = %self.view, "view change stalled");
                    self.start_view_change(now)
                }
                ReplicaStatus::Recovering => {
                    debug!(replica = %self.replica_id, "recovery stalled, retrying");
                    self.start_recovery(now)
                }
            };
            self = state;
            output.merge(out);
        }

        if self.is_master() && now >= self.master_deadline {
            let (state, out) = self.send_heartbeat(now);
            self = state;
            output.merge(out);
        }

        (self, output)
    }

    /// Restarts every deadline from `now`.
    ///
    /// Used after the replica was cut off from the network, so stale
    /// deadlines do not fire all at once.
    pub fn resume_timers(&mut self, now: Timestamp) {
        self.replica_deadline = now.saturating_add(self.config.timeouts.lease);
        self.master_deadline = now;
    }

    /// Records a snapshot persisted by the executor and compacts the log.
    fn on_snapshot_taken(mut self, snapshot: Snapshot) -> (Self, ReplicaOutput) {
        if snapshot.index <= self.log.base() || snapshot.index > self.commit_number.as_op_number() {
            trace!(
                replica = %self.replica_id,
                index = %snapshot.index,
                base = %self.log.base(),
                "ignoring snapshot"
            );
            return (self, ReplicaOutput::empty());
        }

        debug!(replica = %self.replica_id, index = %snapshot.index, "compacting log");
        self.log.truncate_through(snapshot.index);
        self.snapshot = Some(snapshot);
        (self, ReplicaOutput::empty())
    }

    // ========================================================================
    // Shared Transitions
    // ========================================================================

    /// Pushes the replica deadline out by one lease.
    pub(crate) fn extend_deadline(&mut self, now: Timestamp) {
        let deadline = now.saturating_add(self.config.timeouts.lease);
        self.replica_deadline = self.replica_deadline.max(deadline);
    }

    /// Promises the master not to join a view change for one lease, and
    /// returns the end of the promise.
    pub(crate) fn promise(&mut self, now: Timestamp) -> Timestamp {
        self.extend_deadline(now);
        let until = now.saturating_add(self.config.timeouts.lease);
        self.promised_until = self.promised_until.max(until);
        until
    }

    /// Enters normal operation in the current view.
    pub(crate) fn enter_normal(&mut self, now: Timestamp) {
        self.status = ReplicaStatus::Normal;
        self.normal_view = self.view;
        self.recovery = None;
        self.state_transfer = None;
        self.view_change.reset();
        self.replica_deadline = now.saturating_add(self.config.timeouts.lease);
    }

    /// Commits every op up to `target`, in order.
    ///
    /// If `target` is beyond the end of the log, nothing is committed and a
    /// normal backup asks the master for the missing entries.
    pub(crate) fn commit_up_to(mut self, target: CommitNumber, now: Timestamp) -> (Self, ReplicaOutput) {
        if target <= self.commit_number {
            return (self, ReplicaOutput::empty());
        }

        if target.as_op_number() > self.op_number() {
            debug!(
                replica = %self.replica_id,
                target = %target,
                op = %self.op_number(),
                "commit target beyond log end"
            );
            return self.start_state_transfer(now);
        }

        let mut output = ReplicaOutput::empty();
        while self.commit_number < target {
            let next = self.commit_number.as_op_number().next();
            let entry = self
                .log
                .get(next)
                .cloned()
                .unwrap_or_else(|| panic!("uncommitted entry {next} missing from the log"));
            output.applies.push(Apply::Commit(entry));
            self.commit_number = CommitNumber::new(next);
        }

        trace!(replica = %self.replica_id, commit = %self.commit_number, "committed");
        (self, output)
    }

    /// Builds the log transfer a peer that has applied everything up to
    /// `from` needs, attaching the snapshot if the log no longer reaches
    /// back that far.
    pub(crate) fn build_transfer(&self, from: OpNumber) -> LogTransfer {
        let suffix = self.log.suffix(from);
        let snapshot = if suffix.needs_snapshot {
            debug_assert_eq!(
                self.snapshot.as_ref().map(|s| s.index),
                Some(self.log.base())
            );
            self.snapshot.clone()
        } else {
            None
        };
        LogTransfer {
            log: suffix.log,
            snapshot,
        }
    }

    /// Builds a transfer of the whole log.
    pub(crate) fn full_transfer(&self) -> LogTransfer {
        self.build_transfer(OpNumber::ZERO)
    }

    /// Splices a received log into ours.
    ///
    /// Entries up to our commit number are kept (they are identical on every
    /// replica that has them); everything after is replaced by the transfer.
    /// A transfer that starts past our commit number must carry the snapshot
    /// that bridges the gap, which is then installed.
    pub(crate) fn adopt_transfer(&mut self, transfer: LogTransfer) -> Result<Vec<Apply>, RpcError> {
        let commit = self.commit_number.as_op_number();
        if transfer.last_op() < commit {
            warn!(
                replica = %self.replica_id,
                transfer_end = %transfer.last_op(),
                commit = %commit,
                "transfer would roll back committed ops"
            );
            return Err(RpcError::MissingEntries);
        }

        let LogTransfer { log, snapshot } = transfer;
        let base = log.base();

        if base > commit {
            let Some(snapshot) = snapshot.filter(|s| s.index == base) else {
                return Err(RpcError::MissingEntries);
            };
            debug!(replica = %self.replica_id, index = %snapshot.index, "installing snapshot");
            self.log = log;
            self.commit_number = CommitNumber::new(base);
            self.snapshot = Some(snapshot.clone());
            return Ok(vec![Apply::Install(snapshot)]);
        }

        let keep = base.max(self.log.base());
        self.log.truncate_after(keep);
        for entry in log.entries().iter().filter(|e| e.op_number > keep) {
            self.log.add(entry.clone());
        }
        Ok(Vec::new())
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.commit_number.as_op_number() <= self.op_number(),
            "commit_number={} exceeded op_number={}",
            self.commit_number,
            self.op_number()
        );
        debug_assert!(
            self.log.base() <= self.commit_number.as_op_number(),
            "log base {} above commit {}",
            self.log.base(),
            self.commit_number
        );
    }
}
