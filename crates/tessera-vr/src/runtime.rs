//! Replica runtime: the imperative shell around [`ReplicaState`].
//!
//! ```text
//!                ┌────────────────────────────────────────────┐
//!  inbound RPC ─►│ RpcHandler ─┐                              │
//!  tick timer  ─►│             ├─► state lock ─► process()    │
//!  run_vr()    ─►│ Submit ─────┘        │                     │
//!                │                      ├─► applies ─► Executor ─► app
//!                │                      └─► rpcs ─► Fanout ─► peers
//!                │                                   │        │
//!                │      replies ◄────────────────────┘        │
//!                └────────────────────────────────────────────┘
//! ```
//!
//! All protocol decisions are made by the pure core under one lock. The
//! runtime only moves events in and effects out: applies are queued to the
//! serial executor before the lock is released, so commit order is the
//! order in which the core produced them; RPCs are fanned out after.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tessera_kernel::StateMachine;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::client_sessions::SessionCheck;
use crate::config::ReplicaConfig;
use crate::error::{RpcError, VrError, VrResult};
use crate::executor::{ApplyResult, Executor, Machine, Waiters};
use crate::fanout::{Fanout, FanoutOutcome};
use crate::message::{ClientRequest, Request, Response, RpcResult};
use crate::replica::{Apply, OutboundRpc, ReplicaEvent, ReplicaOutput, ReplicaState};
use crate::snapshot::SnapshotManager;
use crate::transport::{RpcHandler, Transport};
use crate::types::{
    Command, CommitNumber, OpNumber, ReplicaId, ReplicaStatus, Timestamp, ViewNumber,
};

/// A running replica.
///
/// Cloning is cheap; every clone drives the same replica.
pub struct Replica<S: StateMachine> {
    inner: Arc<Inner<S>>,
}

impl<S: StateMachine> Clone for Replica<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: StateMachine> std::fmt::Debug for Replica<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

struct Inner<S> {
    id: ReplicaId,
    config: ReplicaConfig,

    /// `None` only while an event is being processed.
    state: Mutex<Option<ReplicaState>>,
    applies: mpsc::UnboundedSender<Apply>,
    waiters: Arc<Waiters>,
    machine: Arc<Mutex<Machine<S>>>,

    fanout: Fanout,
    in_flight: Semaphore,

    connected: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: StateMachine> Replica<S> {
    /// Starts a replica.
    ///
    /// Loads the snapshot from the data directory (if any), starts serving
    /// on `transport`, and begins recovery. The replica becomes usable once
    /// recovery or a view change brings it to normal status.
    pub async fn start(config: ReplicaConfig, transport: Arc<dyn Transport>, app: S) -> VrResult<Self> {
        config.validate()?;
        let id = config.replica_id;

        let snapshots = match config.data_dir.as_deref() {
            Some(dir) => Some(Arc::new(SnapshotManager::new(dir)?)),
            None => None,
        };
        let loaded = match snapshots.clone() {
            Some(manager) => tokio::task::spawn_blocking(move || manager.load())
                .await
                .map_err(|_| VrError::Shutdown)??,
            None => None,
        };

        let mut machine = Machine::new(app, config.sessions);
        let state = match loaded {
            Some(snapshot) => {
                machine.install(&snapshot)?;
                info!(replica = %id, index = %snapshot.index, "restored from snapshot");
                ReplicaState::from_snapshot(id, config.cluster.clone(), snapshot)
            }
            None => ReplicaState::new(id, config.cluster.clone()),
        };

        let (applies, apply_rx) = mpsc::unbounded_channel();
        let waiters = Arc::new(Waiters::default());
        let machine = Arc::new(Mutex::new(machine));
        let max_in_flight = config.cluster.max_in_flight.max(1);

        let inner = Arc::new(Inner {
            id,
            state: Mutex::new(Some(state)),
            applies,
            waiters: Arc::clone(&waiters),
            machine: Arc::clone(&machine),
            fanout: Fanout::new(Arc::clone(&transport), config.rpc),
            in_flight: Semaphore::new(max_in_flight),
            connected: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let hook_target = Arc::downgrade(&inner);
        let executor = Executor::new(
            machine,
            waiters,
            snapshots,
            inner.config.cluster.snapshot_every,
            Box::new(move |snapshot| {
                if let Some(inner) = hook_target.upgrade() {
                    inner.step(ReplicaEvent::SnapshotTaken { snapshot });
                }
            }),
        );
        let executor_task = tokio::spawn(executor.run(apply_rx));

        transport
            .listen(Arc::new(Handler {
                inner: Arc::downgrade(&inner),
            }))
            .await?;

        let output = inner.step(ReplicaEvent::Start {
            now: Timestamp::now(),
        });
        inner.dispatch(output.rpcs);

        let timer_task = tokio::spawn(tick_loop(
            Arc::downgrade(&inner),
            inner.config.cluster.timeouts.tick_interval,
        ));
        inner
            .tasks
            .lock()
            .expect("lock poisoned")
            .extend([executor_task, timer_task]);

        info!(replica = %id, cluster = inner.config.cluster.cluster_size(), "replica started");
        Ok(Self { inner })
    }

    /// Appends `command` to the log and waits until it is applied.
    ///
    /// Only the master accepts commands. Returns the state machine's reply.
    pub async fn run_vr(&self, command: Command) -> VrResult<Bytes> {
        self.inner.run_vr(command).await
    }

    /// Executes a client request, deduplicated by its session.
    pub async fn send(&self, request: ClientRequest) -> RpcResult {
        self.inner.send(request).await
    }

    /// Executes a command without a client session.
    ///
    /// Read-only commands are answered locally while the master holds its
    /// lease; everything else goes through the log.
    pub async fn read(&self, payload: Bytes) -> VrResult<Bytes> {
        if let Some(reply) = self.inner.lease_read(&payload) {
            return reply.map_err(VrError::Rpc);
        }
        self.inner.run_vr(Command::new(payload)).await
    }

    /// Returns the master of the current view, if this replica is normal.
    pub fn get_master(&self) -> Result<ReplicaId, RpcError> {
        let state = self.inner.lock_state();
        match state.status() {
            ReplicaStatus::Normal => Ok(state.leader()),
            _ => Err(RpcError::MasterFailover),
        }
    }

    /// Cuts the replica off from the network, as if it had crashed.
    ///
    /// The replica keeps its state and its timers stop firing.
    pub async fn disconnect(&self) {
        info!(replica = %self.inner.id, "disconnecting");
        self.inner.connected.store(false, Ordering::Release);
        self.inner.fanout.transport().disconnect().await;
    }

    /// Rejoins the network after [`disconnect`](Self::disconnect).
    pub async fn reconnect(&self) -> VrResult<()> {
        info!(replica = %self.inner.id, "reconnecting");
        self.inner
            .with_state(|state| state.resume_timers(Timestamp::now()));
        self.inner.fanout.transport().reconnect().await?;
        self.inner.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops the replica for good.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.connected.store(false, Ordering::Release);
        self.inner.in_flight.close();
        self.inner.fanout.transport().disconnect().await;

        let tasks: Vec<_> = self.inner.tasks.lock().expect("lock poisoned").drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.inner.waiters.fail_all();
        info!(replica = %self.inner.id, "replica stopped");
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn id(&self) -> ReplicaId {
        self.inner.id
    }

    pub fn view(&self) -> ViewNumber {
        self.inner.lock_state().view()
    }

    pub fn op_number(&self) -> OpNumber {
        self.inner.lock_state().op_number()
    }

    pub fn commit_number(&self) -> CommitNumber {
        self.inner.lock_state().commit_number()
    }

    pub fn status(&self) -> ReplicaStatus {
        self.inner.lock_state().status()
    }

    pub fn is_master(&self) -> bool {
        self.inner.lock_state().is_master()
    }

    /// Hash over the log, for comparing replicas.
    pub fn log_hash(&self) -> [u8; 32] {
        self.inner.lock_state().log_hash()
    }

    /// Highest op the application has applied.
    pub fn applied(&self) -> OpNumber {
        self.inner.machine.lock().expect("lock poisoned").applied()
    }

    /// Runs `f` against the application state.
    pub fn with_state_machine<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(self.inner.machine.lock().expect("lock poisoned").app())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }
}

/// Borrowed view of the replica state.
struct StateGuard<'a>(std::sync::MutexGuard<'a, Option<ReplicaState>>);

impl std::ops::Deref for StateGuard<'_> {
    type Target = ReplicaState;

    fn deref(&self) -> &ReplicaState {
        match self.0.as_ref() {
            Some(state) => state,
            None => unreachable!("replica state is restored before the lock is released"),
        }
    }
}

impl<S: StateMachine> Inner<S> {
    fn lock_state(&self) -> StateGuard<'_> {
        StateGuard(self.state.lock().expect("lock poisoned"))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ReplicaState) -> R) -> R {
        let mut guard = self.state.lock().expect("lock poisoned");
        match guard.as_mut() {
            Some(state) => f(state),
            None => unreachable!("replica state is restored before the lock is released"),
        }
    }

    /// Feeds one event to the core and queues its applies.
    fn step(&self, event: ReplicaEvent) -> ReplicaOutput {
        self.step_with(event, |_, _| {}).0
    }

    /// Like [`step`](Self::step), also registering a waiter when the event
    /// appended a command, and evaluating `inspect` against the new state
    /// before the lock is released.
    fn step_with<R>(
        &self,
        event: ReplicaEvent,
        inspect: impl FnOnce(&ReplicaState, &ReplicaOutput) -> R,
    ) -> (ReplicaOutput, R, Option<oneshot::Receiver<ApplyResult>>) {
        let mut guard = self.state.lock().expect("lock poisoned");
        let Some(state) = guard.take() else {
            unreachable!("replica state is restored before the lock is released");
        };
        let (state, mut output) = state.process(event);

        let waiter = output
            .submitted
            .map(|(op, view)| self.waiters.register(op, view));
        for apply in output.applies.drain(..) {
            if self.applies.send(apply).is_err() {
                debug!(replica = %self.id, "executor gone, dropping apply");
            }
        }
        let inspected = inspect(&state, &output);
        *guard = Some(state);
        (output, inspected, waiter)
    }

    /// Fans out every RPC in the background.
    ///
    /// Replies are fed back into the core as they arrive. The returned
    /// handles resolve once each RPC's completion condition holds or its
    /// targets are exhausted.
    fn dispatch(self: &Arc<Self>, rpcs: Vec<OutboundRpc>) -> Vec<JoinHandle<FanoutOutcome>> {
        rpcs.into_iter()
            .map(|rpc| {
                let weak = Arc::downgrade(self);
                let completion = rpc.completion;
                let name = rpc.request.name();
                let fanout = self.fanout.clone();
                let mut acks = 0;

                tokio::spawn(async move {
                    let outcome = fanout
                        .send_and_await(rpc.targets, rpc.request, move |from, reply| {
                            let Some(inner) = weak.upgrade() else {
                                return true;
                            };
                            if reply.is_ok() {
                                acks += 1;
                            }
                            inner.on_reply(from, reply, |state| completion.is_satisfied(state, acks))
                        })
                        .await;
                    if outcome == FanoutOutcome::Exhausted {
                        trace!(rpc = name, "fanout exhausted");
                    }
                    outcome
                })
            })
            .collect()
    }

    fn on_reply(
        self: &Arc<Self>,
        from: ReplicaId,
        reply: RpcResult,
        satisfied: impl FnOnce(&ReplicaState) -> bool,
    ) -> bool {
        if !self.connected.load(Ordering::Acquire) {
            return true;
        }
        let (output, done, _) = self.step_with(
            ReplicaEvent::Reply {
                from,
                response: reply,
                now: Timestamp::now(),
            },
            |state, _| satisfied(state),
        );
        self.dispatch(output.rpcs);
        done
    }

    async fn run_vr(self: &Arc<Self>, command: Command) -> VrResult<Bytes> {
        let _permit = self.in_flight.acquire().await.map_err(|_| VrError::Shutdown)?;

        let (output, rejection, waiter) = self.step_with(
            ReplicaEvent::Submit {
                command,
                now: Timestamp::now(),
            },
            |state, output| {
                if output.submitted.is_some() {
                    None
                } else if state.status() == ReplicaStatus::Normal {
                    Some(RpcError::NotMaster {
                        master: state.leader(),
                    })
                } else {
                    Some(RpcError::MasterFailover)
                }
            },
        );
        let handles = self.dispatch(output.rpcs);
        let Some(waiter) = waiter else {
            return Err(rejection.unwrap_or(RpcError::MasterFailover).into());
        };

        let commit = async {
            for handle in handles {
                // A reordered prepare can be refused by every peer and still
                // commit later, so only give up early once deposed.
                if let Ok(FanoutOutcome::Exhausted) = handle.await {
                    if !self.lock_state().is_master() {
                        return Err(VrError::Rpc(RpcError::MasterFailover));
                    }
                }
            }
            match waiter.await {
                Ok(result) => result.map_err(VrError::Rpc),
                Err(_) => Err(VrError::Rpc(RpcError::MasterFailover)),
            }
        };
        tokio::time::timeout(self.config.commit_timeout, commit)
            .await
            .map_err(|_| VrError::Timeout)?
    }

    async fn send(self: &Arc<Self>, request: ClientRequest) -> RpcResult {
        if self.stopped.load(Ordering::Acquire) {
            return Err(RpcError::MasterFailover);
        }
        {
            let state = self.lock_state();
            if state.status() != ReplicaStatus::Normal {
                return Err(RpcError::MasterFailover);
            }
            if !state.is_master() {
                return Err(RpcError::NotMaster {
                    master: state.leader(),
                });
            }
        }

        let check = self
            .machine
            .lock()
            .expect("lock poisoned")
            .sessions()
            .check(request.client_id, request.request_number);
        match check {
            SessionCheck::Duplicate(reply) => return Ok(Response::Reply(reply)),
            SessionCheck::Stale { .. } => return Err(RpcError::OldRequest),
            SessionCheck::New => {}
        }

        if let Some(reply) = self.lease_read(&request.payload) {
            return reply.map(Response::Reply);
        }

        let command = Command::with_session(request.client_id, request.request_number, request.payload);
        self.run_vr(command)
            .await
            .map(Response::Reply)
            .map_err(VrError::into_rpc)
    }

    /// Answers a read-only command locally, if it is safe to do so.
    fn lease_read(&self, payload: &[u8]) -> Option<ApplyResult> {
        let commit = {
            let state = self.lock_state();
            if !state.has_valid_lease(Timestamp::now()) {
                return None;
            }
            state.commit_number().as_op_number()
        };

        let machine = self.machine.lock().expect("lock poisoned");
        if !machine.is_read_only(payload) || machine.applied() < commit {
            return None;
        }
        trace!(replica = %self.id, "lease read");
        Some(machine.query(payload))
    }

    async fn handle(self: &Arc<Self>, request: Request) -> RpcResult {
        if !self.connected.load(Ordering::Acquire) {
            return Err(RpcError::NotNormal);
        }
        if let Request::Send(client_request) = request {
            return self.send(client_request).await;
        }

        let output = self.step(ReplicaEvent::Request {
            request,
            now: Timestamp::now(),
        });
        self.dispatch(output.rpcs);
        output.reply.unwrap_or(Err(RpcError::NotNormal))
    }

    fn tick(self: &Arc<Self>) {
        let output = self.step(ReplicaEvent::Tick {
            now: Timestamp::now(),
        });
        self.dispatch(output.rpcs);
    }
}

/// Inbound side of the transport.
struct Handler<S> {
    inner: Weak<Inner<S>>,
}

#[async_trait]
impl<S: StateMachine> RpcHandler for Handler<S> {
    async fn handle(&self, request: Request) -> RpcResult {
        match self.inner.upgrade() {
            Some(inner) => inner.handle(request).await,
            None => Err(RpcError::NotNormal),
        }
    }
}

async fn tick_loop<S: StateMachine>(inner: Weak<Inner<S>>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.stopped.load(Ordering::Acquire) {
            return;
        }
        if inner.connected.load(Ordering::Acquire) {
            inner.tick();
        }
    }
}

impl<S> Drop for Inner<S> {
    fn drop(&mut self) {
        let tasks = match self.tasks.get_mut() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks.drain(..) {
            task.abort();
        }
        if !self.stopped.load(Ordering::Acquire) {
            warn!(replica = %self.id, "replica dropped without shutdown");
        }
    }
}
