//! The state machine manager: registry of live flows, session routing,
//! lifecycle entry points and restart-from-storage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::FlowRemovalReason;
use crate::checkpoint::{
    Checkpoint, ErrorState, FlowStart, FlowState, FlowStatus, InvocationContext,
    StateMachineState, SubFlow,
};
use crate::clock::{Clock, SystemClock};
use crate::config::StateMachineConfig;
use crate::dedup::DeduplicationHandler;
use crate::dedup::{DeduplicationId, SenderDeduplicationId};
use crate::error::{Error, FlowError, FlowErrorKind, Result, SessionRejectReason};
use crate::event::Event;
use crate::executor::ActionExecutor;
use crate::fiber::{FlowFiber, FlowSnapshot};
use crate::hospital::{EventSender, FlowHospital, StaffedFlowHospital};
use crate::ids::{FlowId, LedgerTransactionId, Party, SessionId};
use crate::logic::{
    logic_handle, FlowLogic, FlowLogicHydrator, InitiatedFlowFactory,
};
use crate::messaging::FlowMessaging;
use crate::persistence::PersistenceManager;
use crate::scheduler::{FlowSleepScheduler, FlowTimeoutScheduler};
use crate::session::{
    initiated_seed, ExistingSessionMessage, ExistingSessionPayload, FlowInfo,
    InitialSessionMessage, InitiatedSessionState, SessionMessage, SessionState,
};
use crate::storage::CheckpointStorage;
use crate::transition::StateMachine;

/// Result a flow completes with.
pub type FlowResult = std::result::Result<serde_json::Value, FlowError>;

/// Handle returned when a flow is started.
pub struct FlowHandle {
    pub flow_id: FlowId,
    /// Completes with the flow's terminal result. The sender is dropped on
    /// soft shutdown, surfacing as a receive error.
    pub result: oneshot::Receiver<FlowResult>,
}

/// Lifecycle notifications published by the manager.
#[derive(Debug, Clone)]
pub enum Change {
    Added { flow_id: FlowId },
    Removed { flow_id: FlowId, outcome: RemovalOutcome },
}

/// How a flow left the manager.
#[derive(Debug, Clone)]
pub enum RemovalOutcome {
    Success(serde_json::Value),
    Failure(FlowError),
    Killed,
    Shutdown,
}

/// Options for starting a top-level flow.
#[derive(Debug, Clone)]
pub struct StartFlowOptions {
    /// Protocol class name recorded on the top subflow frame.
    pub class_name: String,
    /// Present when the flow initiates sessions; advertised in handshakes.
    pub flow_info: Option<FlowInfo>,
    /// Opt into timed-retry semantics.
    pub timed: bool,
    pub context: InvocationContext,
}

/// Vault soft-lock owner, released when flows finish or are killed.
pub trait SoftLockRegistry: Send + Sync + 'static {
    fn release_soft_locks(&self, lock_id: Uuid);
}

/// Default no-op lock registry.
#[derive(Debug, Default)]
pub struct NoopSoftLockRegistry;

impl SoftLockRegistry for NoopSoftLockRegistry {
    fn release_soft_locks(&self, _lock_id: Uuid) {}
}

/// Operations the action executor and fibers need from the manager.
#[async_trait]
pub trait ManagerInternal: Send + Sync + 'static {
    fn add_session_binding(&self, flow_id: FlowId, session_id: SessionId) -> Result<()>;
    fn remove_session_bindings(&self, session_ids: &[SessionId]);
    fn signal_flow_has_started(&self, flow_id: FlowId);
    async fn remove_flow(
        &self,
        flow_id: FlowId,
        reason: FlowRemovalReason,
        last_state: StateMachineState,
    );
    async fn move_flow_to_paused(&self, flow_id: FlowId, last_state: StateMachineState);
    async fn retry_flow_from_safe_point(&self, flow_id: FlowId, current_state: &StateMachineState);
    fn redeliver_external_event(&self, flow_id: FlowId, event: Event);
    fn schedule_flow_timeout(&self, flow_id: FlowId);
    fn cancel_flow_timeout(&self, flow_id: FlowId);
    fn release_soft_locks(&self, lock_id: Option<Uuid>);
    fn track_transaction(&self, flow_id: FlowId, transaction_id: LedgerTransactionId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unstarted,
    Started,
    Stopping,
    Stopped,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Unstarted => "unstarted",
            Lifecycle::Started => "started",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// A live flow's residency in the manager.
struct Flow {
    sender: EventSender,
    join: JoinHandle<()>,
    killed: Arc<AtomicBool>,
    result: Option<oneshot::Sender<FlowResult>>,
    snapshot: Arc<Mutex<FlowSnapshot>>,
}

/// A paused flow: checkpoint-only resident with its undelivered events.
struct PausedFlow {
    buffered_events: Vec<Event>,
    result: Option<oneshot::Sender<FlowResult>>,
}

struct InnerState {
    lifecycle: Lifecycle,
    flows: HashMap<FlowId, Flow>,
    paused: HashMap<FlowId, PausedFlow>,
}

/// Builder for a [`StateMachineManager`].
pub struct StateMachineManagerBuilder {
    our_identity: Party,
    config: StateMachineConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn CheckpointStorage>,
    messaging: Arc<dyn FlowMessaging>,
    persistence: Arc<dyn PersistenceManager>,
    hospital: Option<Arc<dyn FlowHospital>>,
    hydrator: Arc<dyn FlowLogicHydrator>,
    soft_locks: Arc<dyn SoftLockRegistry>,
    factories: HashMap<String, Arc<dyn InitiatedFlowFactory>>,
}

impl StateMachineManagerBuilder {
    fn new(our_identity: Party) -> Self {
        Self {
            our_identity,
            config: StateMachineConfig::default(),
            clock: Arc::new(SystemClock),
            storage: Arc::new(crate::storage::InMemoryCheckpointStorage::new()),
            messaging: Arc::new(crate::messaging::RecordingFlowMessaging::new()),
            persistence: Arc::new(crate::persistence::InMemoryPersistence::new()),
            hospital: None,
            hydrator: Arc::new(UnsupportedHydrator),
            soft_locks: Arc::new(NoopSoftLockRegistry),
            factories: HashMap::new(),
        }
    }

    pub fn config(mut self, config: StateMachineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn CheckpointStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn messaging(mut self, messaging: Arc<dyn FlowMessaging>) -> Self {
        self.messaging = messaging;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceManager>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn hospital(mut self, hospital: Arc<dyn FlowHospital>) -> Self {
        self.hospital = Some(hospital);
        self
    }

    pub fn hydrator(mut self, hydrator: Arc<dyn FlowLogicHydrator>) -> Self {
        self.hydrator = hydrator;
        self
    }

    pub fn soft_locks(mut self, soft_locks: Arc<dyn SoftLockRegistry>) -> Self {
        self.soft_locks = soft_locks;
        self
    }

    /// Register a responder factory for an initiator flow class.
    pub fn register_initiated_flow(
        mut self,
        initiator_class_name: impl Into<String>,
        factory: Arc<dyn InitiatedFlowFactory>,
    ) -> Self {
        self.factories.insert(initiator_class_name.into(), factory);
        self
    }

    pub fn build(self) -> StateMachineManager {
        let hospital = self.hospital.unwrap_or_else(|| {
            Arc::new(StaffedFlowHospital::new(
                Arc::clone(&self.clock),
                self.config.duplicate_discharge_limit,
            ))
        });
        let (changes_tx, _) = broadcast::channel(256);
        StateMachineManager {
            inner: Arc::new_cyclic(|weak_self| ManagerInner {
                weak_self: weak_self.clone(),
                our_identity: self.our_identity,
                config: Arc::new(self.config.clone()),
                clock: self.clock,
                storage: self.storage,
                messaging: self.messaging,
                persistence: self.persistence,
                hospital,
                hydrator: self.hydrator,
                soft_locks: self.soft_locks,
                factories: Mutex::new(self.factories),
                mutex: Mutex::new(InnerState {
                    lifecycle: Lifecycle::Unstarted,
                    flows: HashMap::new(),
                    paused: HashMap::new(),
                }),
                session_to_flow: DashMap::new(),
                tracked_transactions: Mutex::new(HashMap::new()),
                timeouts: FlowTimeoutScheduler::new(self.config.flow_timeout.clone()),
                changes_tx,
                live_count: AtomicUsize::new(0),
                live_notify: Notify::new(),
                sender_uuid: Uuid::new_v4(),
            }),
        }
    }
}

/// Hydrator used when none is configured; restarts are impossible without
/// the business-logic runtime supplying one.
struct UnsupportedHydrator;

impl FlowLogicHydrator for UnsupportedHydrator {
    fn hydrate(&self, _frozen: &crate::ids::SerializedBytes) -> std::result::Result<Box<dyn FlowLogic>, String> {
        Err("no flow logic hydrator registered".into())
    }
}

/// Top-level orchestrator of all flows on this node.
#[derive(Clone)]
pub struct StateMachineManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    weak_self: std::sync::Weak<ManagerInner>,
    our_identity: Party,
    config: Arc<StateMachineConfig>,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn CheckpointStorage>,
    messaging: Arc<dyn FlowMessaging>,
    persistence: Arc<dyn PersistenceManager>,
    hospital: Arc<dyn FlowHospital>,
    hydrator: Arc<dyn FlowLogicHydrator>,
    soft_locks: Arc<dyn SoftLockRegistry>,
    factories: Mutex<HashMap<String, Arc<dyn InitiatedFlowFactory>>>,
    mutex: Mutex<InnerState>,
    /// Read-mostly routing table; mutations go through the binding methods.
    session_to_flow: DashMap<SessionId, FlowId>,
    tracked_transactions: Mutex<HashMap<LedgerTransactionId, Vec<FlowId>>>,
    timeouts: FlowTimeoutScheduler,
    changes_tx: broadcast::Sender<Change>,
    live_count: AtomicUsize,
    live_notify: Notify,
    /// Our process identity for dedup high-water-marking.
    sender_uuid: Uuid,
}

impl StateMachineManager {
    /// Start building a manager for the given node identity.
    pub fn builder(our_identity: Party) -> StateMachineManagerBuilder {
        StateMachineManagerBuilder::new(our_identity)
    }

    /// Restore persisted flows, connect the transport and go live.
    ///
    /// Checkpoints that fail to restore are logged and skipped, unless
    /// strict reload mode is configured, in which case the failure is
    /// returned to the caller.
    pub async fn start(&self) -> Result<()> {
        {
            let inner = self.inner.lock_state();
            if inner.lifecycle != Lifecycle::Unstarted {
                return Err(Error::ManagerLifecycle {
                    expected: "unstarted",
                    actual: inner.lifecycle.name(),
                });
            }
        }

        let restored = self.restore_flows_from_checkpoints().await?;

        // Paused flows stay checkpoint-only residents, but must be known so
        // their inbound messages buffer and they can be resumed later.
        for (flow_id, serialized) in self.inner.storage.get_paused_checkpoints().await? {
            match serialized.deserialize() {
                Ok(checkpoint) => {
                    if let Err(binding_error) =
                        self.inner.register_session_bindings(flow_id, &checkpoint)
                    {
                        error!(flow_id = %flow_id, error = %binding_error, "Cannot rebind paused flow's sessions");
                        continue;
                    }
                    self.inner.lock_state().paused.insert(
                        flow_id,
                        PausedFlow {
                            buffered_events: vec![],
                            result: None,
                        },
                    );
                }
                Err(restore_error) => {
                    error!(flow_id = %flow_id, error = %restore_error, "Unrestorable paused checkpoint, skipping");
                }
            }
        }

        let callback_inner = Arc::clone(&self.inner);
        self.inner
            .messaging
            .start(Arc::new(move |sender, message, handler| {
                callback_inner.on_session_message(sender, message, handler);
            }))
            .await?;

        self.inner.lock_state().lifecycle = Lifecycle::Started;

        let count = restored.len();
        for (flow_id, state) in restored {
            let (result_tx, _result_rx) = oneshot::channel();
            if let Err(start_error) = self.inner.add_and_start_flow(flow_id, state, Some(result_tx))
            {
                error!(flow_id = %flow_id, error = %start_error, "Failed to resume restored flow");
            }
        }
        info!(restored = count, "State machine manager started");
        Ok(())
    }

    /// Soft shutdown: every live flow suspends in place, and this call
    /// blocks until the live-fiber count drops to `allowed_residual`
    /// (non-zero only in test scenarios).
    pub async fn stop(&self, allowed_residual: usize) -> Result<()> {
        let senders: Vec<EventSender> = {
            let mut inner = self.inner.lock_state();
            if inner.lifecycle != Lifecycle::Started {
                return Err(Error::ManagerLifecycle {
                    expected: "started",
                    actual: inner.lifecycle.name(),
                });
            }
            inner.lifecycle = Lifecycle::Stopping;
            inner.flows.values().map(|f| f.sender.clone()).collect()
        };

        for sender in senders {
            let _ = sender.send(Event::SoftShutdown);
        }

        loop {
            let notified = self.inner.live_notify.notified();
            if self.inner.live_count.load(Ordering::SeqCst) <= allowed_residual {
                break;
            }
            notified.await;
        }

        self.inner.lock_state().lifecycle = Lifecycle::Stopped;
        info!("State machine manager stopped");
        Ok(())
    }

    /// Start a new top-level flow.
    pub fn start_flow(
        &self,
        options: StartFlowOptions,
        logic: Box<dyn FlowLogic>,
    ) -> Result<FlowHandle> {
        {
            let inner = self.inner.lock_state();
            if inner.lifecycle != Lifecycle::Started {
                return Err(Error::ManagerLifecycle {
                    expected: "started",
                    actual: inner.lifecycle.name(),
                });
            }
        }

        let flow_id = FlowId::random();
        let frozen_logic = logic.snapshot();
        let top_frame = match options.flow_info {
            Some(flow_info) => SubFlow::Initiating {
                class_to_initiate_with: options.class_name.clone(),
                flow_info,
                timed: options.timed,
            },
            None => SubFlow::Inlined {
                class_name: options.class_name.clone(),
                timed: options.timed,
            },
        };
        let checkpoint = Checkpoint::new(
            options.context,
            self.inner.our_identity.clone(),
            top_frame,
            FlowStart::Explicit,
            frozen_logic,
        );
        let state = StateMachineState::new(
            checkpoint,
            logic_handle(logic),
            None,
            false,
            false,
            Some(self.inner.sender_uuid),
        );

        let (result_tx, result_rx) = oneshot::channel();
        self.inner
            .add_and_start_flow(flow_id, state, Some(result_tx))?;
        if options.timed {
            self.inner.schedule_flow_timeout(flow_id);
        }
        Ok(FlowHandle {
            flow_id,
            result: result_rx,
        })
    }

    /// Kill a flow: interrupt it in place, delete its checkpoint and soft
    /// locks, and fail its result. Returns false for unknown flows.
    pub async fn kill_flow(&self, flow_id: FlowId) -> bool {
        let entry = {
            let mut inner = self.inner.lock_state();
            match inner.flows.remove(&flow_id) {
                Some(flow) => Some(KilledEntry::Live(flow)),
                None => inner.paused.remove(&flow_id).map(KilledEntry::Paused),
            }
        };

        let Some(entry) = entry else {
            debug!(flow_id = %flow_id, "Cannot kill a flow unknown to this node");
            return false;
        };

        let result = match entry {
            KilledEntry::Live(mut flow) => {
                flow.killed.store(true, Ordering::SeqCst);
                flow.join.abort();
                self.inner.decrement_live_fibers();
                flow.result.take()
            }
            KilledEntry::Paused(mut paused) => paused.result.take(),
        };

        if let Err(storage_error) = self.inner.storage.remove_checkpoint(flow_id).await {
            error!(flow_id = %flow_id, error = %storage_error, "Failed to remove checkpoint of killed flow");
        }
        self.inner.soft_locks.release_soft_locks(*flow_id.uuid());
        self.inner.timeouts.cancel(flow_id);
        self.inner.hospital.flow_removed(flow_id);
        self.inner.session_to_flow.retain(|_, owner| *owner != flow_id);

        if let Some(result) = result {
            let _ = result.send(Err(FlowError::new(FlowErrorKind::Killed)));
        }
        self.inner.publish(Change::Removed {
            flow_id,
            outcome: RemovalOutcome::Killed,
        });
        info!(flow_id = %flow_id, "Flow killed");
        true
    }

    /// Ask a flow to park itself as a checkpoint-only resident.
    pub fn pause_flow(&self, flow_id: FlowId) -> Result<()> {
        let inner = self.inner.lock_state();
        match inner.flows.get(&flow_id) {
            Some(flow) => {
                let _ = flow.sender.send(Event::Pause);
                Ok(())
            }
            None => Err(Error::UnknownFlow(flow_id)),
        }
    }

    /// Bring a paused flow back to life and replay its buffered events.
    pub async fn resume_paused_flow(&self, flow_id: FlowId) -> Result<()> {
        let paused = {
            let mut inner = self.inner.lock_state();
            inner
                .paused
                .remove(&flow_id)
                .ok_or(Error::UnknownFlow(flow_id))?
        };

        let serialized = self
            .inner
            .storage
            .get_checkpoint(flow_id)
            .await?
            .ok_or(Error::UnknownFlow(flow_id))?;
        let mut checkpoint = serialized
            .deserialize()
            .map_err(|e| Error::Storage(format!("cannot restore paused flow {flow_id}: {e}")))?;
        checkpoint.status = FlowStatus::Runnable;
        self.inner
            .storage
            .update_status(flow_id, FlowStatus::Runnable)
            .await?;

        let state = self.inner.rehydrate(flow_id, checkpoint, true)?;
        self.inner.add_and_start_flow(flow_id, state, paused.result)?;

        let sender = {
            let inner = self.inner.lock_state();
            inner.flows.get(&flow_id).map(|f| f.sender.clone())
        };
        if let Some(sender) = sender {
            for event in paused.buffered_events {
                let _ = sender.send(event);
            }
        }
        Ok(())
    }

    /// Externally nudge a flow to retry from its last persisted checkpoint
    /// (used for dead or hospitalized flows).
    pub async fn retry_flow(&self, flow_id: FlowId) -> Result<()> {
        let sender = {
            let inner = self.inner.lock_state();
            inner
                .flows
                .get(&flow_id)
                .map(|flow| flow.sender.clone())
                .ok_or(Error::UnknownFlow(flow_id))?
        };
        if sender.send(Event::RetryFlowFromSafePoint).is_ok() {
            return Ok(());
        }
        // The fiber is dead; rebuild straight from storage.
        self.inner.retry_from_storage(flow_id, None).await;
        Ok(())
    }

    /// Subscribe to flow lifecycle notifications.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<Change> {
        self.inner.changes_tx.subscribe()
    }

    /// Flows currently suspended waiting to hear from `party`.
    pub fn flows_waiting_for(&self, party: &Party) -> Vec<FlowId> {
        let inner = self.inner.lock_state();
        inner
            .flows
            .iter()
            .filter(|(_, flow)| {
                flow.snapshot
                    .lock()
                    .map(|snapshot| snapshot.waiting_for.contains(party))
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Current progress snapshot of one flow.
    pub fn flow_snapshot(&self, flow_id: FlowId) -> Option<FlowSnapshot> {
        let inner = self.inner.lock_state();
        inner
            .flows
            .get(&flow_id)
            .and_then(|flow| flow.snapshot.lock().ok().map(|snapshot| snapshot.clone()))
    }

    /// Number of live (non-paused) flows.
    pub fn live_flow_count(&self) -> usize {
        self.inner.live_count.load(Ordering::SeqCst)
    }

    /// A ledger transaction committed; wake every flow waiting on it.
    pub fn notify_ledger_commit(&self, transaction_id: &LedgerTransactionId) {
        let interested = self
            .inner
            .tracked_transactions
            .lock()
            .expect("tracking lock poisoned")
            .remove(transaction_id)
            .unwrap_or_default();
        let inner = self.inner.lock_state();
        for flow_id in interested {
            if let Some(flow) = inner.flows.get(&flow_id) {
                let _ = flow
                    .sender
                    .send(Event::TransactionCommitted(transaction_id.clone()));
            }
        }
    }

    /// Request a longer timed-flow timeout for one flow. Shorter-than-default
    /// requests are ignored.
    pub fn set_custom_timeout(&self, flow_id: FlowId, timeout: std::time::Duration) {
        self.inner.timeouts.set_custom_timeout(flow_id, timeout);
    }

    /// Deliver an inbound session message. Exposed for transports that
    /// dispatch directly rather than through [`FlowMessaging::start`].
    pub fn on_session_message(
        &self,
        sender: Party,
        message: SessionMessage,
        handler: Arc<dyn DeduplicationHandler>,
    ) {
        self.inner.on_session_message(sender, message, handler);
    }

    async fn restore_flows_from_checkpoints(&self) -> Result<Vec<(FlowId, StateMachineState)>> {
        let checkpoints = self.inner.storage.get_checkpoints_to_run().await?;
        let mut restored = vec![];
        for (flow_id, serialized) in checkpoints {
            let checkpoint = match serialized.deserialize() {
                Ok(mut checkpoint) => {
                    if checkpoint.status == FlowStatus::Hospitalized {
                        // Hospitalized flows retry automatically on restart.
                        checkpoint.status = FlowStatus::Runnable;
                        self.inner
                            .storage
                            .update_status(flow_id, FlowStatus::Runnable)
                            .await?;
                        self.inner.storage.remove_flow_exception(flow_id).await?;
                    }
                    checkpoint
                }
                Err(restore_error) => {
                    if self.inner.config.reload_checkpoint_after_suspend {
                        return Err(Error::CheckpointRestore {
                            flow_id,
                            source: restore_error,
                        });
                    }
                    error!(flow_id = %flow_id, error = %restore_error, "Unrestorable checkpoint, skipping flow");
                    continue;
                }
            };
            match self.inner.rehydrate(flow_id, checkpoint, true) {
                Ok(state) => restored.push((flow_id, state)),
                Err(hydrate_error) => {
                    if self.inner.config.reload_checkpoint_after_suspend {
                        return Err(hydrate_error);
                    }
                    error!(flow_id = %flow_id, error = %hydrate_error, "Cannot rehydrate flow logic, skipping flow");
                }
            }
        }
        Ok(restored)
    }
}

enum KilledEntry {
    Live(Flow),
    Paused(PausedFlow),
}

impl ManagerInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, InnerState> {
        self.mutex.lock().expect("manager lock poisoned")
    }

    fn publish(&self, change: Change) {
        let _ = self.changes_tx.send(change);
    }

    fn decrement_live_fibers(&self) {
        self.live_count.fetch_sub(1, Ordering::SeqCst);
        self.live_notify.notify_waiters();
    }

    /// Rebuild the in-memory state for a checkpoint loaded from storage.
    fn rehydrate(
        &self,
        flow_id: FlowId,
        checkpoint: Checkpoint,
        is_any_checkpoint_persisted: bool,
    ) -> Result<StateMachineState> {
        let frozen = match &checkpoint.flow_state {
            FlowState::Unstarted { frozen_logic, .. } => frozen_logic,
            FlowState::Started { frozen_fiber, .. } => frozen_fiber,
            FlowState::Finished => {
                return Err(Error::Storage(format!(
                    "flow {flow_id} is already finished"
                )))
            }
        };
        let logic = self
            .hydrator
            .hydrate(frozen)
            .map_err(|message| Error::Storage(format!("hydrating flow {flow_id}: {message}")))?;
        // Resumed from a checkpoint: excluded from dedup high-water-marking.
        Ok(StateMachineState::new(
            checkpoint,
            logic_handle(logic),
            None,
            is_any_checkpoint_persisted,
            false,
            None,
        ))
    }

    /// Register a flow, spawn its fiber and hand it its first work-check.
    fn add_and_start_flow(
        &self,
        flow_id: FlowId,
        state: StateMachineState,
        result: Option<oneshot::Sender<FlowResult>>,
    ) -> Result<()> {
        self.register_session_bindings(flow_id, &state.checkpoint)?;

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(FlowSnapshot::from_state(&state)));
        let killed = Arc::new(AtomicBool::new(false));
        let manager: Arc<dyn ManagerInternal> = self.arc_self();

        let executor = ActionExecutor::new(
            flow_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.messaging),
            Arc::clone(&self.persistence),
            Arc::clone(&manager),
            FlowSleepScheduler::new(Arc::clone(&self.clock)),
            sender.clone(),
        );
        let fiber = FlowFiber::new(
            flow_id,
            StateMachine::new(flow_id, Arc::clone(&self.config)),
            state,
            executor,
            Arc::clone(&self.hospital),
            manager,
            receiver,
            sender.clone(),
            Arc::clone(&snapshot),
            Arc::clone(&killed),
        );

        {
            let mut inner = self.lock_state();
            if matches!(inner.lifecycle, Lifecycle::Stopping | Lifecycle::Stopped) {
                return Err(Error::ManagerLifecycle {
                    expected: "started",
                    actual: inner.lifecycle.name(),
                });
            }
            let join = tokio::spawn(fiber.run());
            inner.flows.insert(
                flow_id,
                Flow {
                    sender: sender.clone(),
                    join,
                    killed,
                    result,
                    snapshot,
                },
            );
        }
        self.live_count.fetch_add(1, Ordering::SeqCst);

        let _ = sender.send(Event::DoRemainingWork);
        Ok(())
    }

    fn register_session_bindings(&self, flow_id: FlowId, checkpoint: &Checkpoint) -> Result<()> {
        for session_id in checkpoint.sessions.keys() {
            self.add_session_binding(flow_id, *session_id)?;
        }
        if let FlowState::Unstarted {
            flow_start:
                FlowStart::Initiated {
                    initiated_session_id,
                    ..
                },
            ..
        } = &checkpoint.flow_state
        {
            self.add_session_binding(flow_id, *initiated_session_id)?;
        }
        Ok(())
    }

    /// Entry point for all inbound session traffic.
    fn on_session_message(
        &self,
        sender: Party,
        message: SessionMessage,
        handler: Arc<dyn DeduplicationHandler>,
    ) {
        match message {
            SessionMessage::Existing(message) => {
                self.on_existing_session_message(sender, message, handler)
            }
            SessionMessage::Initial(message) => self.on_session_init(sender, message, handler),
        }
    }

    fn on_existing_session_message(
        &self,
        sender: Party,
        message: ExistingSessionMessage,
        handler: Arc<dyn DeduplicationHandler>,
    ) {
        let recipient = message.recipient_session_id;
        let Some(flow_id) = self.session_to_flow.get(&recipient).map(|entry| *entry) else {
            // The owning flow may legitimately be gone already.
            if let Err(ack_error) = handler.after_database_transaction() {
                warn!(error = %ack_error, "Failed to acknowledge unroutable message");
            }
            if matches!(message.payload, ExistingSessionPayload::End) {
                debug!(session_id = %recipient, "End-of-session message for unknown session, discarding");
            } else {
                error!(
                    session_id = %recipient,
                    payload = message.payload.kind(),
                    sender = %sender,
                    "Received session message for unknown session"
                );
            }
            return;
        };

        let mut inner = self.lock_state();
        if let Some(flow) = inner.flows.get(&flow_id) {
            let _ = flow.sender.send(Event::DeliverSessionMessage {
                message,
                sender,
                handler,
            });
        } else if let Some(paused) = inner.paused.get_mut(&flow_id) {
            paused.buffered_events.push(Event::DeliverSessionMessage {
                message,
                sender,
                handler,
            });
        } else {
            warn!(flow_id = %flow_id, session_id = %recipient, "Stale session binding, dropping message");
            if let Err(ack_error) = handler.after_database_transaction() {
                warn!(error = %ack_error, "Failed to acknowledge stale message");
            }
        }
    }

    /// Handshake receiver: build the responder flow, reply with a
    /// confirmation, or reject with a structured reason.
    fn on_session_init(
        &self,
        sender: Party,
        message: InitialSessionMessage,
        handler: Arc<dyn DeduplicationHandler>,
    ) {
        let factory = self
            .factories
            .lock()
            .expect("factories lock poisoned")
            .get(&message.initiator_flow_class_name)
            .cloned();

        let Some(factory) = factory else {
            self.reject_session_init(
                sender,
                &message,
                SessionRejectReason::UnknownFlowClass {
                    class_name: message.initiator_flow_class_name.clone(),
                },
                handler,
            );
            return;
        };

        let initiated_session_id = SessionId::random();
        let logic = match factory.create(initiated_session_id, &sender, message.first_payload.as_ref())
        {
            Ok(logic) => logic,
            Err(create_error) => {
                self.reject_session_init(
                    sender,
                    &message,
                    SessionRejectReason::InitiationFailure {
                        message: create_error,
                    },
                    handler,
                );
                return;
            }
        };

        let initiated_flow_info = factory.flow_info();
        let seed = initiated_seed(message.initiator_session_id, message.initiation_entropy);

        let mut received_messages = vec![];
        if let Some(first_payload) = message.first_payload.clone() {
            received_messages.push(ExistingSessionPayload::Data {
                payload: first_payload,
            });
        }
        let session = SessionState::Initiated {
            peer: sender.clone(),
            peer_flow_info: FlowInfo {
                flow_version: message.flow_version,
                app_name: message.app_name.clone(),
            },
            peer_sink_session_id: message.initiator_session_id,
            received_messages,
            liveness: InitiatedSessionState::Live,
            other_side_errored: false,
            deduplication_seed: seed,
        };

        let frozen_logic = logic.snapshot();
        let flow_id = FlowId::random();
        let checkpoint = Checkpoint::new(
            InvocationContext::peer(sender.clone()),
            self.our_identity.clone(),
            SubFlow::Inlined {
                class_name: message.initiator_flow_class_name.clone(),
                timed: false,
            },
            FlowStart::Initiated {
                peer: sender.clone(),
                initiated_session_id,
                initiating_message: message.clone(),
                initiated_flow_info: initiated_flow_info.clone(),
            },
            frozen_logic,
        )
        .with_session(initiated_session_id, session);

        let state = StateMachineState::new(
            checkpoint,
            logic_handle(logic),
            Some(handler),
            false,
            false,
            Some(self.sender_uuid),
        );

        let (result_tx, _result_rx) = oneshot::channel();
        if let Err(start_error) = self.add_and_start_flow(flow_id, state, Some(result_tx)) {
            error!(error = %start_error, "Failed to start initiated flow");
            return;
        }

        // Reply with our session id and flow info.
        let confirm = ExistingSessionMessage {
            recipient_session_id: message.initiator_session_id,
            payload: ExistingSessionPayload::Confirm {
                initiated_session_id,
                initiated_flow_info,
            },
        };
        let messaging = Arc::clone(&self.messaging);
        let sender_uuid = self.sender_uuid;
        tokio::spawn(async move {
            let dedup = SenderDeduplicationId {
                deduplication_id: DeduplicationId::random(),
                sender_uuid: Some(sender_uuid),
            };
            if let Err(send_error) = messaging
                .send_session_message(&sender, SessionMessage::Existing(confirm), dedup)
                .await
            {
                error!(error = %send_error, "Failed to send session confirmation");
            }
        });
    }

    fn reject_session_init(
        &self,
        sender: Party,
        message: &InitialSessionMessage,
        reason: SessionRejectReason,
        handler: Arc<dyn DeduplicationHandler>,
    ) {
        warn!(
            sender = %sender,
            class_name = %message.initiator_flow_class_name,
            reason = %reason,
            "Rejecting session initiation"
        );
        let reply = ExistingSessionMessage {
            recipient_session_id: message.initiator_session_id,
            payload: ExistingSessionPayload::Reject {
                message: reason.to_string(),
                error_id: rand::random(),
            },
        };
        let messaging = Arc::clone(&self.messaging);
        let sender_uuid = self.sender_uuid;
        tokio::spawn(async move {
            let dedup = SenderDeduplicationId {
                deduplication_id: DeduplicationId::random(),
                sender_uuid: Some(sender_uuid),
            };
            if let Err(send_error) = messaging
                .send_session_message(&sender, SessionMessage::Existing(reply), dedup)
                .await
            {
                error!(error = %send_error, "Failed to send session rejection");
            }
        });
        if let Err(ack_error) = handler.after_database_transaction() {
            warn!(error = %ack_error, "Failed to acknowledge rejected session init");
        }
    }
}

#[async_trait]
impl ManagerInternal for ManagerInner {
    fn add_session_binding(&self, flow_id: FlowId, session_id: SessionId) -> Result<()> {
        match self.session_to_flow.insert(session_id, flow_id) {
            None => Ok(()),
            Some(existing) if existing == flow_id => {
                debug!(session_id = %session_id, flow_id = %flow_id, "Session binding re-added");
                Ok(())
            }
            Some(existing) => {
                self.session_to_flow.insert(session_id, existing);
                Err(Error::DuplicateSessionBinding {
                    session_id,
                    existing,
                    attempted: flow_id,
                })
            }
        }
    }

    fn remove_session_bindings(&self, session_ids: &[SessionId]) {
        for session_id in session_ids {
            if self.session_to_flow.remove(session_id).is_none() {
                debug!(session_id = %session_id, "Session binding re-removed");
            }
        }
    }

    fn signal_flow_has_started(&self, flow_id: FlowId) {
        self.publish(Change::Added { flow_id });
    }

    async fn remove_flow(
        &self,
        flow_id: FlowId,
        reason: FlowRemovalReason,
        last_state: StateMachineState,
    ) {
        let flow = {
            let mut inner = self.lock_state();
            inner.flows.remove(&flow_id)
        };
        let Some(mut flow) = flow else {
            warn!(flow_id = %flow_id, "Flow re-finished");
            return;
        };
        self.decrement_live_fibers();
        self.timeouts.cancel(flow_id);
        self.hospital.flow_removed(flow_id);

        if matches!(reason, FlowRemovalReason::OrderlyFinish { .. }) {
            // Orderly removal invariants.
            if !last_state.pending_deduplication_handlers.is_empty() {
                error!(flow_id = %flow_id, "Removed flow still had pending deduplication handlers");
                debug_assert!(false, "pending deduplication handlers on orderly removal");
            }
            if last_state.checkpoint.sub_flow_stack.len() != 1 {
                error!(flow_id = %flow_id, "Removed flow left a non-trivial subflow stack");
                debug_assert!(false, "subflow stack not unwound on orderly removal");
            }
            let leaked: Vec<SessionId> = self
                .session_to_flow
                .iter()
                .filter(|entry| *entry.value() == flow_id)
                .map(|entry| *entry.key())
                .collect();
            if !leaked.is_empty() {
                error!(flow_id = %flow_id, ?leaked, "Removed flow still referenced by session table");
                debug_assert!(false, "session table references removed flow");
            }
        }

        let outcome = match reason {
            FlowRemovalReason::OrderlyFinish { result } => {
                if let Some(sender) = flow.result.take() {
                    let _ = sender.send(Ok(result.clone()));
                }
                RemovalOutcome::Success(result)
            }
            FlowRemovalReason::ErrorFinish { errors } => {
                let first = errors.first().clone();
                if let Some(sender) = flow.result.take() {
                    let _ = sender.send(Err(first.clone()));
                }
                RemovalOutcome::Failure(first)
            }
            FlowRemovalReason::SoftShutdown => {
                drop(flow.result.take());
                RemovalOutcome::Shutdown
            }
        };
        self.publish(Change::Removed { flow_id, outcome });
    }

    async fn move_flow_to_paused(&self, flow_id: FlowId, _last_state: StateMachineState) {
        let mut inner = self.lock_state();
        if let Some(mut flow) = inner.flows.remove(&flow_id) {
            inner.paused.insert(
                flow_id,
                PausedFlow {
                    buffered_events: vec![],
                    result: flow.result.take(),
                },
            );
            drop(inner);
            self.decrement_live_fibers();
            info!(flow_id = %flow_id, "Flow paused");
        }
    }

    /// Recreate the flow from storage, exactly as a cold restart would,
    /// and point its session bindings at the replacement fiber.
    async fn retry_flow_from_safe_point(&self, flow_id: FlowId, current_state: &StateMachineState) {
        self.retry_from_storage(flow_id, Some(current_state.checkpoint.clone()))
            .await;
    }

    fn redeliver_external_event(&self, flow_id: FlowId, event: Event) {
        let mut inner = self.lock_state();
        if let Some(flow) = inner.flows.get(&flow_id) {
            let _ = flow.sender.send(event);
        } else if let Some(paused) = inner.paused.get_mut(&flow_id) {
            paused.buffered_events.push(event);
        } else {
            debug!(flow_id = %flow_id, "Dropping redelivered event for removed flow");
        }
    }

    fn schedule_flow_timeout(&self, flow_id: FlowId) {
        let sender = {
            let inner = self.lock_state();
            inner.flows.get(&flow_id).map(|flow| flow.sender.clone())
        };
        if let Some(sender) = sender {
            self.timeouts.schedule(flow_id, sender);
        }
    }

    fn cancel_flow_timeout(&self, flow_id: FlowId) {
        self.timeouts.cancel(flow_id);
    }

    fn release_soft_locks(&self, lock_id: Option<Uuid>) {
        if let Some(lock_id) = lock_id {
            self.soft_locks.release_soft_locks(lock_id);
        }
    }

    fn track_transaction(&self, flow_id: FlowId, transaction_id: LedgerTransactionId) {
        self.tracked_transactions
            .lock()
            .expect("tracking lock poisoned")
            .entry(transaction_id)
            .or_default()
            .push(flow_id);
    }
}

impl ManagerInner {
    /// Recreate a flow from its last persisted checkpoint. `fallback` is
    /// the in-memory checkpoint used when nothing was persisted yet.
    async fn retry_from_storage(&self, flow_id: FlowId, fallback: Option<Checkpoint>) {
        let stored = match self.storage.get_checkpoint(flow_id).await {
            Ok(stored) => stored,
            Err(storage_error) => {
                error!(flow_id = %flow_id, error = %storage_error, "Cannot read checkpoint for retry");
                return;
            }
        };

        let (mut checkpoint, is_persisted) = match stored {
            Some(serialized) => match serialized.deserialize() {
                Ok(checkpoint) => (checkpoint, true),
                Err(restore_error) => {
                    error!(flow_id = %flow_id, error = %restore_error, "Unrestorable checkpoint on retry");
                    return;
                }
            },
            // Nothing persisted yet: restart from the in-memory snapshot.
            None => match fallback {
                Some(checkpoint) => (checkpoint, false),
                None => {
                    error!(flow_id = %flow_id, "No checkpoint available to retry from");
                    return;
                }
            },
        };
        checkpoint.status = FlowStatus::Runnable;
        checkpoint.error_state = ErrorState::Clean;
        if is_persisted {
            let _ = self
                .storage
                .update_status(flow_id, FlowStatus::Runnable)
                .await;
            let _ = self.storage.remove_flow_exception(flow_id).await;
        }

        let timed = checkpoint.contains_timed_sub_flow();
        let session_ids: Vec<SessionId> = checkpoint.sessions.keys().copied().collect();
        let state = match self.rehydrate(flow_id, checkpoint, is_persisted) {
            Ok(state) => state,
            Err(hydrate_error) => {
                error!(flow_id = %flow_id, error = %hydrate_error, "Cannot rehydrate flow for retry");
                return;
            }
        };

        // Point the session table at the replacement fiber.
        for session_id in session_ids {
            self.session_to_flow.insert(session_id, flow_id);
        }

        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(FlowSnapshot::from_state(&state)));
        let killed = Arc::new(AtomicBool::new(false));

        let manager = self.arc_self();
        let executor = ActionExecutor::new(
            flow_id,
            Arc::clone(&self.storage),
            Arc::clone(&self.messaging),
            Arc::clone(&self.persistence),
            Arc::clone(&manager),
            FlowSleepScheduler::new(Arc::clone(&self.clock)),
            sender.clone(),
        );
        let fiber = FlowFiber::new(
            flow_id,
            StateMachine::new(flow_id, Arc::clone(&self.config)),
            state,
            executor,
            Arc::clone(&self.hospital),
            manager,
            receiver,
            sender.clone(),
            Arc::clone(&snapshot),
            Arc::clone(&killed),
        );

        {
            let mut inner = self.lock_state();
            let result = inner
                .flows
                .remove(&flow_id)
                .and_then(|mut old| old.result.take());
            let join = tokio::spawn(fiber.run());
            inner.flows.insert(
                flow_id,
                Flow {
                    sender: sender.clone(),
                    join,
                    killed,
                    result,
                    snapshot,
                },
            );
        }

        if timed {
            self.schedule_flow_timeout(flow_id);
        }
        // The retry is the treatment: the patient leaves the hospital, its
        // medical history stays on file.
        self.hospital.flow_cleaned(flow_id);
        let _ = sender.send(Event::DoRemainingWork);
        info!(flow_id = %flow_id, from_storage = is_persisted, "Flow retried from safe point");
    }

    /// The `Arc<Self>` behind `&self`; trait methods that spawn fibers need
    /// an owned handle. Always succeeds while the manager is alive.
    fn arc_self(&self) -> Arc<dyn ManagerInternal> {
        let arc = self
            .weak_self
            .upgrade()
            .expect("manager used after teardown");
        arc as Arc<dyn ManagerInternal>
    }
}
