//! The per-flow fiber: a task that owns one flow's event queue and drives
//! its state machine.
//!
//! Concurrency invariant: each flow processes exactly one event at a time,
//! serialized through its private queue. Events generated while flow code
//! runs (suspensions, subflow frames, session initiations) are processed
//! inline, ahead of anything queued externally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, warn};

use crate::checkpoint::{FlowState, FlowStatus, StateMachineState};
use crate::error::{FlowError, FlowErrorKind};
use crate::event::Event;
use crate::hospital::{EventSender, FlowHospital};
use crate::ids::{FlowId, Party};
use crate::logic::{FlowIoRequest, FlowYield};
use crate::manager::ManagerInternal;
use crate::transition::{FlowContinuation, StateMachine, TransitionResult};

/// Read-mostly view of a flow's progress, updated after every transition.
/// Powers monitoring queries ("what is this flow blocked on").
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub status: FlowStatus,
    /// Name of the suspended I/O request, when suspended.
    pub io_request: Option<String>,
    /// Counterparties the flow is currently waiting to hear from.
    pub waiting_for: Vec<Party>,
    pub suspend_count: u32,
    pub errored: bool,
}

impl FlowSnapshot {
    pub(crate) fn from_state(state: &StateMachineState) -> Self {
        let checkpoint = &state.checkpoint;
        let (io_request, waiting_for) = match &checkpoint.flow_state {
            FlowState::Started { io_request, .. } => {
                let sessions: Vec<_> = match io_request {
                    FlowIoRequest::Receive { sessions }
                    | FlowIoRequest::GetFlowInfo { sessions } => sessions.clone(),
                    FlowIoRequest::SendAndReceive { session_to_message } => {
                        session_to_message.keys().copied().collect()
                    }
                    _ => vec![],
                };
                let waiting_for = sessions
                    .iter()
                    .filter_map(|id| checkpoint.sessions.get(id))
                    .map(|session| session.counterparty().clone())
                    .collect();
                (Some(io_request.kind().to_owned()), waiting_for)
            }
            _ => (None, vec![]),
        };
        Self {
            status: checkpoint.status,
            io_request,
            waiting_for,
            suspend_count: checkpoint.number_of_suspends,
            errored: checkpoint.error_state.is_errored(),
        }
    }
}

/// Why a fiber's event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FiberExitMode {
    /// The flow was removed (finish, error finish, shutdown).
    Removed,
    /// The flow was replaced by a retry from its safe point; leftover
    /// external events belong to the replacement.
    Retried,
    /// The flow was parked as a paused checkpoint.
    Paused,
    /// A transition failed while already errored; parked until an
    /// external nudge.
    Dead,
}

enum Step {
    Continue,
    Stop(FiberExitMode),
}

pub(crate) struct FlowFiber {
    flow_id: FlowId,
    state_machine: StateMachine,
    state: StateMachineState,
    executor: crate::executor::ActionExecutor,
    hospital: Arc<dyn FlowHospital>,
    manager: Arc<dyn ManagerInternal>,
    queue: UnboundedReceiver<Event>,
    self_sender: EventSender,
    snapshot: Arc<Mutex<FlowSnapshot>>,
    killed: Arc<AtomicBool>,
    /// Errors already handed to the hospital for the current dirty spell.
    reported_errors: usize,
}

impl FlowFiber {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        flow_id: FlowId,
        state_machine: StateMachine,
        state: StateMachineState,
        executor: crate::executor::ActionExecutor,
        hospital: Arc<dyn FlowHospital>,
        manager: Arc<dyn ManagerInternal>,
        queue: UnboundedReceiver<Event>,
        self_sender: EventSender,
        snapshot: Arc<Mutex<FlowSnapshot>>,
        killed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            flow_id,
            state_machine,
            state,
            executor,
            hospital,
            manager,
            queue,
            self_sender,
            snapshot,
            killed,
            reported_errors: 0,
        }
    }

    /// Process events until the flow leaves the manager.
    pub(crate) async fn run(mut self) {
        let exit_mode = loop {
            let Some(event) = self.queue.recv().await else {
                break FiberExitMode::Removed;
            };
            if self.killed.load(Ordering::SeqCst) {
                self.state.is_killed = true;
            }
            match self.process_event(event).await {
                Step::Continue => {}
                Step::Stop(mode) => break mode,
            }
        };

        if let Some(future) = self.state.future.take() {
            future.cancel();
        }
        self.drain_queue(exit_mode);
        debug!(flow_id = %self.flow_id, ?exit_mode, "Fiber finished");
    }

    /// Process one external event, plus any events flow code generates
    /// inline before it suspends again.
    async fn process_event(&mut self, mut event: Event) -> Step {
        loop {
            let transition = self.state_machine.transition(&self.state, event);
            let (continuation, exit_hint) = self.execute_transition(transition).await;

            self.update_snapshot();
            self.check_hospital();

            match continuation {
                FlowContinuation::ProcessEvents => return Step::Continue,
                FlowContinuation::Abort => {
                    return Step::Stop(exit_hint.unwrap_or(FiberExitMode::Dead));
                }
                FlowContinuation::Resume(value) => {
                    let yielded = match self.state.logic.lock() {
                        Ok(mut logic) => logic.resume(value),
                        Err(_) => FlowYield::Errored(FlowErrorKind::Internal {
                            message: "flow logic lock poisoned".into(),
                        }),
                    };
                    event = self.event_from_yield(yielded);
                }
                FlowContinuation::Throw(flow_error) => {
                    let yielded = match self.state.logic.lock() {
                        Ok(mut logic) => logic.throw(flow_error),
                        Err(_) => FlowYield::Errored(FlowErrorKind::Internal {
                            message: "flow logic lock poisoned".into(),
                        }),
                    };
                    event = self.event_from_yield(yielded);
                }
            }
        }
    }

    /// Run the transition's actions. A failing action rolls the open
    /// transaction back and folds the failure into the flow's error state,
    /// leaving the previous checkpoint authoritative. When the flow was
    /// already errored, the transition is aborted outright so an
    /// error-reporting loop cannot form.
    async fn execute_transition(
        &mut self,
        transition: TransitionResult,
    ) -> (FlowContinuation, Option<FiberExitMode>) {
        let TransitionResult {
            mut new_state,
            actions,
            continuation,
        } = transition;

        let exit_hint = actions.iter().find_map(|action| match action {
            crate::action::Action::RetryFlowFromSafePoint => Some(FiberExitMode::Retried),
            crate::action::Action::RemoveFlow { .. } => Some(FiberExitMode::Removed),
            crate::action::Action::MoveFlowToPaused { .. } => Some(FiberExitMode::Paused),
            _ => None,
        });

        for action in actions {
            let description = format!("{action:?}");
            if let Err(action_error) = self.executor.execute(action, &mut new_state).await {
                error!(
                    flow_id = %self.flow_id,
                    action = %description,
                    error = %action_error,
                    "Error while executing transition action"
                );
                self.executor.rollback_open_transaction().await;

                if self.state.checkpoint.error_state.is_errored() {
                    // Already errored: abort rather than risk an error loop.
                    self.state.is_dead = true;
                    return (FlowContinuation::Abort, Some(FiberExitMode::Dead));
                }

                let mut folded = self.state.clone();
                folded.is_flow_resumed = false;
                let error_state = std::mem::replace(
                    &mut folded.checkpoint.error_state,
                    crate::checkpoint::ErrorState::Clean,
                );
                folded.checkpoint.error_state =
                    error_state.add_errors(vec![FlowError::new(
                        FlowErrorKind::StateTransitionFailed {
                            message: action_error.to_string(),
                            cause: None,
                        },
                    )]);
                self.state = folded;
                return (FlowContinuation::ProcessEvents, None);
            }
        }

        self.state = new_state;
        (continuation, exit_hint)
    }

    fn event_from_yield(&self, yielded: FlowYield) -> Event {
        match yielded {
            FlowYield::Suspend {
                request,
                may_skip_checkpoint,
            } => {
                let fiber = self
                    .state
                    .logic
                    .lock()
                    .map(|logic| logic.snapshot())
                    .unwrap_or_default();
                Event::Suspend {
                    io_request: request,
                    may_skip_checkpoint,
                    fiber,
                }
            }
            FlowYield::InitiateSession { destination } => Event::InitiateFlow { destination },
            FlowYield::EnterSubFlow {
                class_name,
                initiating,
                timed,
            } => Event::EnterSubFlow {
                class_name,
                initiating,
                timed,
            },
            FlowYield::LeaveSubFlow => Event::LeaveSubFlow,
            FlowYield::Finish { result } => Event::FlowFinish { result },
            FlowYield::Errored(kind) => Event::Error(FlowError::new(kind)),
        }
    }

    fn update_snapshot(&self) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            *snapshot = FlowSnapshot::from_state(&self.state);
        }
    }

    /// Admit newly errored flows to the hospital; sign them out when a
    /// retry brought them back clean.
    fn check_hospital(&mut self) {
        match &self.state.checkpoint.error_state {
            crate::checkpoint::ErrorState::Errored {
                errors,
                propagating,
                ..
            } => {
                if !propagating && errors.len() > self.reported_errors {
                    let new_errors: Vec<_> =
                        errors.iter().skip(self.reported_errors).cloned().collect();
                    self.reported_errors = errors.len();
                    self.hospital.flow_errored(
                        self.flow_id,
                        &self.self_sender,
                        &self.state,
                        &new_errors,
                    );
                }
            }
            crate::checkpoint::ErrorState::Clean => {
                if self.reported_errors > 0 {
                    self.reported_errors = 0;
                    self.hospital.flow_cleaned(self.flow_id);
                }
            }
        }
    }

    /// Handle events left in the queue after the loop ended: redeliver
    /// external deliveries to a retried flow's replacement, acknowledge the
    /// rest so nothing leaks in the broker.
    fn drain_queue(&mut self, mode: FiberExitMode) {
        while let Ok(event) = self.queue.try_recv() {
            match event {
                Event::DeliverSessionMessage {
                    message,
                    sender,
                    handler,
                } => {
                    if mode == FiberExitMode::Retried {
                        self.manager.redeliver_external_event(
                            self.flow_id,
                            Event::DeliverSessionMessage {
                                message,
                                sender,
                                handler,
                            },
                        );
                    } else {
                        if let Err(ack_error) = handler.after_database_transaction() {
                            warn!(flow_id = %self.flow_id, error = %ack_error, "Failed to acknowledge drained message");
                        }
                        match message.payload {
                            crate::session::ExistingSessionPayload::End => {
                                debug!(flow_id = %self.flow_id, "Dropped end-of-session message during shutdown");
                            }
                            other => {
                                warn!(
                                    flow_id = %self.flow_id,
                                    payload = other.kind(),
                                    "Unhandled session message; flow shutting down"
                                );
                            }
                        }
                    }
                }
                Event::DoRemainingWork => {}
                other => {
                    debug!(flow_id = %self.flow_id, event = ?other, "Dropped event; flow shutting down");
                }
            }
        }
    }
}
