//! Serial commit executor.
//!
//! The replica core decides *what* commits; the executor applies it. Commits
//! leave the core in order, under the state lock, on an unbounded channel.
//! A single task drains the channel so the application sees every op exactly
//! once and in op order, without holding up the protocol while it runs.
//!
//! The application state and the client session table together form the
//! replicated [`Machine`]. A snapshot covers both, so a replica restored from
//! one deduplicates like the replica that took it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_kernel::codec::{decode, encode};
use tessera_kernel::{KernelError, StateMachine};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::client_sessions::{ClientSessions, ClientSessionsConfig, SessionCheck};
use crate::error::RpcError;
use crate::replica::Apply;
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::types::{LogEntry, OpNumber, ViewNumber};

/// Outcome of applying one command.
pub type ApplyResult = Result<Bytes, RpcError>;

// ============================================================================
// Machine
// ============================================================================

/// What a snapshot payload holds.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    app: Bytes,
    sessions: ClientSessions,
}

/// The replicated application: state machine, sessions and applied index.
#[derive(Debug)]
pub struct Machine<S> {
    app: S,
    sessions: ClientSessions,
    applied: OpNumber,
}

impl<S: StateMachine> Machine<S> {
    pub fn new(app: S, sessions: ClientSessionsConfig) -> Self {
        Self {
            app,
            sessions: ClientSessions::new(sessions),
            applied: OpNumber::ZERO,
        }
    }

    pub fn app(&self) -> &S {
        &self.app
    }

    pub fn sessions(&self) -> &ClientSessions {
        &self.sessions
    }

    /// Highest op applied so far.
    pub fn applied(&self) -> OpNumber {
        self.applied
    }

    /// Applies a committed entry.
    ///
    /// # Panics
    ///
    /// Panics if `entry` is not the op right after the last applied one.
    pub fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        assert_eq!(
            entry.op_number,
            self.applied.next(),
            "commits must be applied in order"
        );
        self.applied = entry.op_number;

        let payload = &entry.command.payload;
        let Some(session) = entry.command.session else {
            return self.app.apply(payload).map_err(state_machine_error);
        };

        match self.sessions.check(session.client_id, session.request_number) {
            SessionCheck::Duplicate(reply) => {
                debug!(
                    client = %session.client_id,
                    request = session.request_number,
                    "duplicate request answered from cache"
                );
                Ok(reply)
            }
            SessionCheck::Stale { .. } => Err(RpcError::OldRequest),
            SessionCheck::New => {
                let reply = self.app.apply(payload).map_err(state_machine_error)?;
                self.sessions.commit(
                    session.client_id,
                    session.request_number,
                    entry.op_number,
                    reply.clone(),
                );
                Ok(reply)
            }
        }
    }

    /// Answers a read-only command from the current state.
    pub fn query(&self, payload: &[u8]) -> ApplyResult {
        self.app.query(payload).map_err(state_machine_error)
    }

    pub fn is_read_only(&self, payload: &[u8]) -> bool {
        self.app.is_read_only(payload)
    }

    /// Captures everything applied so far.
    pub fn snapshot(&self) -> Result<Snapshot, KernelError> {
        let payload = SnapshotPayload {
            app: self.app.snapshot()?,
            sessions: self.sessions.clone(),
        };
        Ok(Snapshot::new(self.applied, encode(&payload)?))
    }

    /// Replaces the state with `snapshot`.
    pub fn install(&mut self, snapshot: &Snapshot) -> Result<(), KernelError> {
        let payload: SnapshotPayload = decode(&snapshot.payload)?;
        self.app.restore(&payload.app)?;
        self.sessions = payload.sessions;
        self.applied = snapshot.index;
        Ok(())
    }
}

fn state_machine_error(err: KernelError) -> RpcError {
    RpcError::StateMachine(err.to_string())
}

// ============================================================================
// Waiters
// ============================================================================

#[derive(Debug)]
struct Waiter {
    view: ViewNumber,
    tx: oneshot::Sender<ApplyResult>,
}

/// Submitters waiting for their op to be applied.
///
/// A waiter is keyed by the op its command was appended at, and remembers the
/// view it was appended in. If a different entry ends up committed at that op
/// (the master was deposed and its tail replaced), the waiter is failed.
#[derive(Debug, Default)]
pub struct Waiters {
    inner: Mutex<HashMap<OpNumber, Waiter>>,
}

impl Waiters {
    pub fn register(&self, op: OpNumber, view: ViewNumber) -> oneshot::Receiver<ApplyResult> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .inner
            .lock()
            .expect("lock poisoned")
            .insert(op, Waiter { view, tx });
        if let Some(previous) = previous {
            let _ = previous.tx.send(Err(RpcError::MasterFailover));
        }
        rx
    }

    fn resolve(&self, entry: &LogEntry, result: &ApplyResult) {
        let waiter = self.inner.lock().expect("lock poisoned").remove(&entry.op_number);
        if let Some(waiter) = waiter {
            let result = if waiter.view == entry.view {
                result.clone()
            } else {
                Err(RpcError::MasterFailover)
            };
            let _ = waiter.tx.send(result);
        }
    }

    /// Fails every waiter at or below `index`.
    pub fn fail_through(&self, index: OpNumber) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.retain(|op, _| *op > index);
        // Dropped senders surface as failover to the receivers.
    }

    pub fn fail_all(&self) {
        let drained: Vec<_> = self
            .inner
            .lock()
            .expect("lock poisoned")
            .drain()
            .map(|(_, waiter)| waiter)
            .collect();
        for waiter in drained {
            let _ = waiter.tx.send(Err(RpcError::MasterFailover));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Called with every snapshot that was taken, after it is persisted.
pub type SnapshotHook = Box<dyn Fn(Snapshot) + Send + Sync>;

/// Drains the apply channel into the machine.
pub struct Executor<S> {
    machine: Arc<Mutex<Machine<S>>>,
    waiters: Arc<Waiters>,
    snapshots: Option<Arc<SnapshotManager>>,
    snapshot_every: u64,
    on_snapshot: Arc<SnapshotHook>,
}

impl<S: StateMachine> Executor<S> {
    pub fn new(
        machine: Arc<Mutex<Machine<S>>>,
        waiters: Arc<Waiters>,
        snapshots: Option<Arc<SnapshotManager>>,
        snapshot_every: u64,
        on_snapshot: SnapshotHook,
    ) -> Self {
        Self {
            machine,
            waiters,
            snapshots,
            snapshot_every,
            on_snapshot: Arc::new(on_snapshot),
        }
    }

    /// Runs until every sender is gone.
    pub async fn run(self, mut applies: mpsc::UnboundedReceiver<Apply>) {
        while let Some(apply) = applies.recv().await {
            self.execute(apply);
        }
        debug!("executor stopped");
    }

    /// Executes one apply.
    ///
    /// # Panics
    ///
    /// Panics if an installed snapshot cannot be decoded: the replica would
    /// otherwise continue from a state no other replica has.
    pub fn execute(&self, apply: Apply) {
        match apply {
            Apply::Commit(entry) => {
                let (result, snapshot) = {
                    let mut machine = self.machine.lock().expect("lock poisoned");
                    let result = machine.apply(&entry);
                    let snapshot = self.snapshot_due(entry.op_number).then(|| machine.snapshot());
                    (result, snapshot)
                };
                trace!(op = %entry.op_number, ok = result.is_ok(), "applied");
                self.waiters.resolve(&entry, &result);

                match snapshot {
                    Some(Ok(snapshot)) => self.persist(snapshot),
                    Some(Err(err)) => warn!(op = %entry.op_number, error = %err, "snapshot failed"),
                    None => {}
                }
            }
            Apply::Install(snapshot) => {
                if let Err(err) = self.machine.lock().expect("lock poisoned").install(&snapshot) {
                    panic!("cannot install snapshot at {}: {err}", snapshot.index);
                }
                debug!(index = %snapshot.index, "installed snapshot");
                self.waiters.fail_through(snapshot.index);
            }
        }
    }

    fn snapshot_due(&self, op: OpNumber) -> bool {
        self.snapshot_every > 0 && op.as_u64() % self.snapshot_every == 0
    }

    fn persist(&self, snapshot: Snapshot) {
        let hook = Arc::clone(&self.on_snapshot);
        let Some(manager) = self.snapshots.clone() else {
            hook(snapshot);
            return;
        };

        tokio::spawn(async move {
            let index = snapshot.index;
            let written = tokio::task::spawn_blocking(move || {
                manager.take(&snapshot).map(|written| written.then_some(snapshot))
            })
            .await;
            match written {
                Ok(Ok(Some(snapshot))) => hook(snapshot),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => warn!(index = %index, error = %err, "snapshot not persisted"),
                Err(err) => warn!(index = %index, error = %err, "snapshot task failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use tessera_kernel::{Tree, TreeCommand, TreeOutput, TreeReply};

    use super::*;
    use crate::client_sessions::ClientId;
    use crate::types::Command;

    fn create(path: &str, value: &str) -> Bytes {
        encode(&TreeCommand::Create {
            path: path.into(),
            value: value.into(),
        })
        .expect("encode")
    }

    fn entry(op: u64, view: u64, command: Command) -> LogEntry {
        LogEntry::new(OpNumber::new(op), ViewNumber::new(view), command)
    }

    fn machine() -> Machine<Tree> {
        Machine::new(Tree::new(), ClientSessionsConfig::testing())
    }

    #[test]
    fn duplicate_request_is_not_reapplied() {
        let mut machine = machine();
        let client = ClientId::new(7);

        let first = machine
            .apply(&entry(1, 0, Command::with_session(client, 1, create("/dev/null", "x"))))
            .expect("first");
        let second = machine
            .apply(&entry(2, 0, Command::with_session(client, 1, create("/dev/null", "x"))))
            .expect("second");

        assert_eq!(first, second);
        let reply: TreeReply = decode(&second).expect("decode");
        assert!(matches!(reply, Ok(TreeOutput::Node(_))));
        assert_eq!(machine.app().get("/dev/null").map(|n| n.stat.version), Ok(1));
    }

    #[test]
    fn stale_request_is_rejected() {
        let mut machine = machine();
        let client = ClientId::new(7);
        machine
            .apply(&entry(1, 0, Command::with_session(client, 2, create("/a", "1"))))
            .expect("apply");

        let result = machine.apply(&entry(2, 0, Command::with_session(client, 1, create("/b", "2"))));
        assert_eq!(result, Err(RpcError::OldRequest));
        assert!(!machine.app().exists("/b"));
        assert_eq!(machine.applied(), OpNumber::new(2));
    }

    #[test]
    #[should_panic(expected = "in order")]
    fn out_of_order_commit_panics() {
        let mut machine = machine();
        let _ = machine.apply(&entry(2, 0, Command::new(create("/a", "1"))));
    }

    #[test]
    fn snapshot_carries_sessions() {
        let mut machine = machine();
        let client = ClientId::new(9);
        machine
            .apply(&entry(1, 0, Command::with_session(client, 1, create("/a", "1"))))
            .expect("apply");
        let snapshot = machine.snapshot().expect("snapshot");
        assert_eq!(snapshot.index, OpNumber::new(1));

        let mut restored = Machine::new(Tree::new(), ClientSessionsConfig::testing());
        restored.install(&snapshot).expect("install");
        assert_eq!(restored.applied(), OpNumber::new(1));
        assert_eq!(restored.app(), machine.app());
        assert!(matches!(
            restored.sessions().check(client, 1),
            SessionCheck::Duplicate(_)
        ));
    }

    #[test]
    fn waiter_fails_when_slot_was_taken_over() {
        let waiters = Waiters::default();
        let mut rx = waiters.register(OpNumber::new(3), ViewNumber::new(1));

        waiters.resolve(&entry(3, 2, Command::new("other")), &Ok(Bytes::from_static(b"r")));
        assert_eq!(rx.try_recv().expect("resolved"), Err(RpcError::MasterFailover));
        assert!(waiters.is_empty());
    }

    #[test]
    fn fail_through_drops_covered_waiters() {
        let waiters = Waiters::default();
        let mut low = waiters.register(OpNumber::new(2), ViewNumber::ZERO);
        let _high = waiters.register(OpNumber::new(5), ViewNumber::ZERO);

        waiters.fail_through(OpNumber::new(4));
        assert!(low.try_recv().is_err());
        assert_eq!(waiters.len(), 1);
    }

    #[test]
    fn executor_snapshots_on_schedule() {
        let machine = Arc::new(Mutex::new(machine()));
        let taken = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&taken);
        let executor = Executor::new(
            Arc::clone(&machine),
            Arc::new(Waiters::default()),
            None,
            2,
            Box::new(move |snapshot: Snapshot| sink.lock().expect("lock").push(snapshot.index)),
        );

        for op in 1..=5 {
            executor.execute(Apply::Commit(entry(op, 0, Command::new(create(&format!("/n{op}"), "v")))));
        }
        assert_eq!(
            *taken.lock().expect("lock"),
            vec![OpNumber::new(2), OpNumber::new(4)]
        );
    }

    #[tokio::test]
    async fn executor_persists_snapshots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = Arc::new(SnapshotManager::new(dir.path()).expect("manager"));
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let executor = Executor::new(
            Arc::new(Mutex::new(machine())),
            Arc::new(Waiters::default()),
            Some(Arc::clone(&manager)),
            1,
            Box::new(move |snapshot: Snapshot| {
                if let Some(tx) = tx.lock().expect("lock").take() {
                    let _ = tx.send(snapshot.index);
                }
            }),
        );

        executor.execute(Apply::Commit(entry(1, 0, Command::new(create("/a", "1")))));
        assert_eq!(rx.await.expect("hook"), OpNumber::new(1));
        assert_eq!(manager.load().expect("load").map(|s| s.index), Some(OpNumber::new(1)));
    }
}
