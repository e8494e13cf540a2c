//! The checkpoint data model: the persisted snapshot of a flow's progress
//! and the in-memory state wrapped around it.

use indexmap::IndexMap;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dedup::DeduplicationHandler;
use crate::error::{FlowError, Result};
use crate::ids::{Party, SerializedBytes, SessionId};
use crate::logic::{FlowIoRequest, FlowLogicHandle};
use crate::session::{FlowInfo, InitialSessionMessage, SessionState};

/// Who started the flow and under which correlation identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    pub origin: InvocationOrigin,
    pub trace_id: Uuid,
}

impl InvocationContext {
    /// Context for an operator- or RPC-started flow.
    pub fn rpc(actor: impl Into<String>) -> Self {
        Self {
            origin: InvocationOrigin::Rpc {
                actor: actor.into(),
            },
            trace_id: Uuid::new_v4(),
        }
    }

    /// Context for a flow started by an inbound session initiation.
    pub fn peer(party: Party) -> Self {
        Self {
            origin: InvocationOrigin::Peer { party },
            trace_id: Uuid::new_v4(),
        }
    }
}

/// Origin of a flow invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InvocationOrigin {
    Rpc { actor: String },
    Peer { party: Party },
    Scheduled,
}

/// How the flow came to exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowStart {
    /// Started explicitly, e.g. through RPC.
    Explicit,
    /// Started implicitly by an inbound session initiation.
    Initiated {
        peer: Party,
        /// Our (responder-side) session id for the initiated session.
        initiated_session_id: SessionId,
        initiating_message: InitialSessionMessage,
        /// The flow info we advertised back in the confirmation.
        initiated_flow_info: FlowInfo,
    },
}

/// A stack frame recording which code region, if any, establishes
/// initiator/responder session semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubFlow {
    Inlined {
        class_name: String,
        /// The frame opts into timed-retry semantics.
        timed: bool,
    },
    Initiating {
        class_to_initiate_with: String,
        flow_info: FlowInfo,
        timed: bool,
    },
}

impl SubFlow {
    pub fn is_timed(&self) -> bool {
        match self {
            SubFlow::Inlined { timed, .. } | SubFlow::Initiating { timed, .. } => *timed,
        }
    }

    pub fn is_initiating(&self) -> bool {
        matches!(self, SubFlow::Initiating { .. })
    }
}

/// The user-space part of the flow's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowState {
    /// Not yet run: a fresh logic object can always be started from here.
    Unstarted {
        flow_start: FlowStart,
        frozen_logic: SerializedBytes,
    },
    /// Suspended on an I/O request with its serialized locals.
    Started {
        io_request: FlowIoRequest,
        frozen_fiber: SerializedBytes,
    },
    /// Completed; nothing left to serialize.
    Finished,
}

/// Externally visible status of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowStatus {
    Runnable,
    Paused,
    Hospitalized,
    Completed,
}

/// The flow's error ("dirtiness") state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorState {
    Clean,
    Errored {
        errors: NonEmpty<FlowError>,
        /// Index of the first error not yet propagated to sessions.
        propagated_index: usize,
        /// Once set, sessions have been (or are about to be) notified and
        /// the dirtiness is permanent.
        propagating: bool,
    },
}

impl ErrorState {
    /// Fold new errors into the state, entering `Errored` if clean.
    pub fn add_errors(self, new_errors: Vec<FlowError>) -> ErrorState {
        let Some(new_errors) = NonEmpty::from_vec(new_errors) else {
            return self;
        };
        match self {
            ErrorState::Clean => ErrorState::Errored {
                errors: new_errors,
                propagated_index: 0,
                propagating: false,
            },
            ErrorState::Errored {
                mut errors,
                propagated_index,
                propagating,
            } => {
                for error in new_errors {
                    errors.push(error);
                }
                ErrorState::Errored {
                    errors,
                    propagated_index,
                    propagating,
                }
            }
        }
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, ErrorState::Errored { .. })
    }
}

/// The persisted snapshot of a flow's progress. Immutable: transitions
/// produce new values rather than mutating in place.
///
/// Invariant: `sub_flow_stack` is never empty while the flow is live;
/// exactly one top-level entry remains at clean termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub invocation_context: InvocationContext,
    pub our_identity: Party,
    /// Insertion order is significant: replay derives per-message indexes
    /// from iteration order.
    pub sessions: IndexMap<SessionId, SessionState>,
    pub sub_flow_stack: Vec<SubFlow>,
    pub flow_state: FlowState,
    pub error_state: ErrorState,
    pub number_of_suspends: u32,
    pub status: FlowStatus,
}

impl Checkpoint {
    /// Initial checkpoint for a new flow.
    pub fn new(
        invocation_context: InvocationContext,
        our_identity: Party,
        top_level_sub_flow: SubFlow,
        flow_start: FlowStart,
        frozen_logic: SerializedBytes,
    ) -> Self {
        Self {
            invocation_context,
            our_identity,
            sessions: IndexMap::new(),
            sub_flow_stack: vec![top_level_sub_flow],
            flow_state: FlowState::Unstarted {
                flow_start,
                frozen_logic,
            },
            error_state: ErrorState::Clean,
            number_of_suspends: 0,
            status: FlowStatus::Runnable,
        }
    }

    /// Copy with one session added or replaced.
    pub fn with_session(mut self, session_id: SessionId, state: SessionState) -> Self {
        self.sessions.insert(session_id, state);
        self
    }

    /// Copy with the given sessions removed.
    pub fn without_sessions(mut self, session_ids: &[SessionId]) -> Self {
        for id in session_ids {
            self.sessions.shift_remove(id);
        }
        self
    }

    /// Copy with a subflow frame pushed.
    pub fn with_sub_flow(mut self, sub_flow: SubFlow) -> Self {
        self.sub_flow_stack.push(sub_flow);
        self
    }

    /// The innermost initiating subflow, if any. Session initiation derives
    /// its handshake identity from this frame.
    pub fn closest_initiating_sub_flow(&self) -> Option<&SubFlow> {
        self.sub_flow_stack.iter().rev().find(|s| s.is_initiating())
    }

    /// True when any frame on the stack opted into timed-retry semantics.
    pub fn contains_timed_sub_flow(&self) -> bool {
        self.sub_flow_stack.iter().any(SubFlow::is_timed)
    }

    /// Serialize for persistence. Flow state and the rest of the checkpoint
    /// serialize separately; a `Finished` flow state is not re-serialized.
    pub fn to_serialized(&self) -> Result<SerializedCheckpoint> {
        let meta = CheckpointMeta {
            invocation_context: self.invocation_context.clone(),
            our_identity: self.our_identity.clone(),
            sessions: self.sessions.clone(),
            sub_flow_stack: self.sub_flow_stack.clone(),
            number_of_suspends: self.number_of_suspends,
        };
        let flow_state = match &self.flow_state {
            FlowState::Finished => None,
            other => Some(serde_json::to_value(other)?),
        };
        Ok(SerializedCheckpoint {
            checkpoint_state: serde_json::to_value(&meta)?,
            flow_state,
            error_state: serde_json::to_value(&self.error_state)?,
            status: self.status,
            io_request: match &self.flow_state {
                FlowState::Started { io_request, .. } => Some(io_request.kind().to_owned()),
                _ => None,
            },
        })
    }
}

/// Everything in a checkpoint except flow, error and status parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMeta {
    invocation_context: InvocationContext,
    our_identity: Party,
    sessions: IndexMap<SessionId, SessionState>,
    sub_flow_stack: Vec<SubFlow>,
    number_of_suspends: u32,
}

/// The partially serialized form of a checkpoint, as written to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedCheckpoint {
    pub checkpoint_state: serde_json::Value,
    /// `None` for completed flows.
    pub flow_state: Option<serde_json::Value>,
    pub error_state: serde_json::Value,
    pub status: FlowStatus,
    /// Name of the suspended I/O request, for monitoring queries.
    pub io_request: Option<String>,
}

impl SerializedCheckpoint {
    /// Deserialize back into a full checkpoint.
    pub fn deserialize(&self) -> std::result::Result<Checkpoint, serde_json::Error> {
        let meta: CheckpointMeta = serde_json::from_value(self.checkpoint_state.clone())?;
        let flow_state = match &self.flow_state {
            Some(value) => serde_json::from_value(value.clone())?,
            None => FlowState::Finished,
        };
        Ok(Checkpoint {
            invocation_context: meta.invocation_context,
            our_identity: meta.our_identity,
            sessions: meta.sessions,
            sub_flow_stack: meta.sub_flow_stack,
            flow_state,
            error_state: serde_json::from_value(self.error_state.clone())?,
            number_of_suspends: meta.number_of_suspends,
            status: self.status,
        })
    }
}

/// Handle to an in-flight future a suspended flow is waiting on (sleep,
/// async operation). Aborting it detaches the stale waiter.
#[derive(Debug, Clone)]
pub struct FutureHandle {
    abort: tokio::task::AbortHandle,
}

impl FutureHandle {
    pub fn new(abort: tokio::task::AbortHandle) -> Self {
        Self { abort }
    }

    /// Cancel the in-flight wait.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}

/// The full state of one live flow: the persisted checkpoint plus the
/// in-memory-only parts.
///
/// Mutated only by applying transition results under the flow's own
/// serialized event processing.
#[derive(Clone)]
pub struct StateMachineState {
    pub checkpoint: Checkpoint,
    /// The live business-logic object.
    pub logic: FlowLogicHandle,
    /// Deduplication handlers for deliveries consumed but not yet
    /// persisted/acknowledged.
    pub pending_deduplication_handlers: Vec<std::sync::Arc<dyn DeduplicationHandler>>,
    /// Control is with (or returning to) user-space flow code. Makes the
    /// work-check event idempotent.
    pub is_flow_resumed: bool,
    /// The flow is waiting on a future completion (sleep, async operation,
    /// ledger commit).
    pub is_waiting_for_future: bool,
    /// The in-flight future, when one is scheduled.
    pub future: Option<FutureHandle>,
    /// At least one checkpoint reached storage; decides insert-vs-update
    /// and whether removal must delete.
    pub is_any_checkpoint_persisted: bool,
    /// The initial checkpoint may be skipped because the start trigger is
    /// replayable.
    pub is_start_idempotent: bool,
    /// The flow has been removed from the manager; no further work.
    pub is_removed: bool,
    /// The flow was killed; every subsequent event takes the killed path.
    pub is_killed: bool,
    /// A transition failed while the flow was already errored; the flow is
    /// parked until an external retry or kill.
    pub is_dead: bool,
    /// Our process identity for dedup high-water-marking; `None` after a
    /// resume from checkpoint.
    pub sender_uuid: Option<Uuid>,
}

impl StateMachineState {
    /// Fresh in-memory state around a checkpoint.
    pub fn new(
        checkpoint: Checkpoint,
        logic: FlowLogicHandle,
        initial_handler: Option<std::sync::Arc<dyn DeduplicationHandler>>,
        is_any_checkpoint_persisted: bool,
        is_start_idempotent: bool,
        sender_uuid: Option<Uuid>,
    ) -> Self {
        Self {
            checkpoint,
            logic,
            pending_deduplication_handlers: initial_handler.into_iter().collect(),
            is_flow_resumed: false,
            is_waiting_for_future: false,
            future: None,
            is_any_checkpoint_persisted,
            is_start_idempotent,
            is_removed: false,
            is_killed: false,
            is_dead: false,
            sender_uuid,
        }
    }
}

impl std::fmt::Debug for StateMachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachineState")
            .field("status", &self.checkpoint.status)
            .field("flow_state", &self.checkpoint.flow_state)
            .field("error_state", &self.checkpoint.error_state)
            .field("suspends", &self.checkpoint.number_of_suspends)
            .field("sessions", &self.checkpoint.sessions.len())
            .field(
                "pending_dedup",
                &self.pending_deduplication_handlers.len(),
            )
            .field("is_flow_resumed", &self.is_flow_resumed)
            .field("is_removed", &self.is_removed)
            .field("is_killed", &self.is_killed)
            .field("is_dead", &self.is_dead)
            .finish()
    }
}
