//! The action catalogue: every side effect a transition can request.
//!
//! Actions are decided by the transition engine and executed only by the
//! action executor, which keeps transitions testable without touching
//! storage or the network.

use std::sync::Arc;

use nonempty::NonEmpty;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, FlowStatus, StateMachineState};
use crate::dedup::{DeduplicationHandler, SenderDeduplicationId};
use crate::error::FlowError;
use crate::event::Event;
use crate::ids::{FlowId, LedgerTransactionId, Party, SessionId};
use crate::logic::FlowAsyncOperation;
use crate::session::{ExistingSessionMessage, InitialSessionMessage, SessionState};

/// An initiation handshake send.
#[derive(Debug, Clone)]
pub struct SendInitial {
    pub destination: Party,
    pub message: InitialSessionMessage,
    pub dedup: SenderDeduplicationId,
}

/// A send on an established session.
#[derive(Debug, Clone)]
pub struct SendExisting {
    pub peer: Party,
    pub message: ExistingSessionMessage,
    pub dedup: SenderDeduplicationId,
}

/// Why a flow is being removed from the manager.
#[derive(Debug, Clone)]
pub enum FlowRemovalReason {
    OrderlyFinish { result: serde_json::Value },
    ErrorFinish { errors: NonEmpty<FlowError> },
    SoftShutdown,
}

/// A side effect emitted by a transition.
pub enum Action {
    /// Register interest in a ledger transaction's commit.
    TrackTransaction { transaction_id: LedgerTransactionId },

    /// Send a session initiation message.
    SendInitial(SendInitial),

    /// Send a message on an established session.
    SendExisting(SendExisting),

    /// Send a batch of messages as one unit, initiations first.
    SendMultiple {
        initial: Vec<SendInitial>,
        existing: Vec<SendExisting>,
    },

    /// Persist the checkpoint (insert or update).
    PersistCheckpoint {
        flow_id: FlowId,
        checkpoint: Checkpoint,
        is_update: bool,
    },

    /// Delete the persisted checkpoint.
    RemoveCheckpoint { flow_id: FlowId },

    /// Update only the persisted status.
    UpdateFlowStatus { flow_id: FlowId, status: FlowStatus },

    /// Persist deduplication facts inside the current transaction.
    PersistDeduplicationFacts {
        handlers: Vec<Arc<dyn DeduplicationHandler>>,
    },

    /// Run post-commit acknowledgement hooks. Failures are logged and
    /// swallowed; a redundant redelivery is acceptable.
    AcknowledgeMessages {
        handlers: Vec<Arc<dyn DeduplicationHandler>>,
    },

    /// Relay the flow's errors to its live initiated sessions, skipping any
    /// session whose other side already errored.
    PropagateErrors {
        errors: Vec<FlowError>,
        sessions: Vec<SessionState>,
        sender_uuid: Option<Uuid>,
    },

    /// Bind a session id to this flow in the routing table.
    AddSessionBinding { session_id: SessionId },

    /// Drop routing-table entries for the given sessions.
    RemoveSessionBindings { session_ids: Vec<SessionId> },

    /// Signal that the flow started successfully.
    SignalFlowHasStarted,

    /// Remove the flow from the manager, publishing its terminal outcome.
    RemoveFlow {
        reason: FlowRemovalReason,
        last_state: Box<StateMachineState>,
    },

    /// Park the flow as a checkpoint-only resident.
    MoveFlowToPaused { last_state: Box<StateMachineState> },

    /// Enqueue an event back onto this flow's own queue.
    ScheduleEvent(Event),

    /// Schedule a wake-up at the given instant.
    SleepUntil { until: OffsetDateTime },

    /// Open the flow's database transaction.
    CreateTransaction,

    /// Commit the open transaction.
    CommitTransaction,

    /// Roll back the open transaction.
    RollbackTransaction,

    /// Start user-provided asynchronous work off the fiber.
    ExecuteAsyncOperation {
        dedup_id: String,
        operation: Arc<dyn FlowAsyncOperation>,
    },

    /// Release the flow's vault soft locks.
    ReleaseSoftLocks { lock_id: Option<Uuid> },

    /// Recreate the flow from its last persisted checkpoint.
    RetryFlowFromSafePoint,

    /// Arm (or re-arm) the flow's timed-retry timeout.
    ScheduleFlowTimeout,

    /// Disarm the flow's timed-retry timeout.
    CancelFlowTimeout,
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::TrackTransaction { transaction_id } => f
                .debug_struct("TrackTransaction")
                .field("transaction_id", transaction_id)
                .finish(),
            Action::SendInitial(send) => f.debug_tuple("SendInitial").field(send).finish(),
            Action::SendExisting(send) => f.debug_tuple("SendExisting").field(send).finish(),
            Action::SendMultiple { initial, existing } => f
                .debug_struct("SendMultiple")
                .field("initial", &initial.len())
                .field("existing", &existing.len())
                .finish(),
            Action::PersistCheckpoint {
                flow_id, is_update, ..
            } => f
                .debug_struct("PersistCheckpoint")
                .field("flow_id", flow_id)
                .field("is_update", is_update)
                .finish(),
            Action::RemoveCheckpoint { flow_id } => f
                .debug_struct("RemoveCheckpoint")
                .field("flow_id", flow_id)
                .finish(),
            Action::UpdateFlowStatus { flow_id, status } => f
                .debug_struct("UpdateFlowStatus")
                .field("flow_id", flow_id)
                .field("status", status)
                .finish(),
            Action::PersistDeduplicationFacts { handlers } => f
                .debug_struct("PersistDeduplicationFacts")
                .field("handlers", &handlers.len())
                .finish(),
            Action::AcknowledgeMessages { handlers } => f
                .debug_struct("AcknowledgeMessages")
                .field("handlers", &handlers.len())
                .finish(),
            Action::PropagateErrors { errors, sessions, .. } => f
                .debug_struct("PropagateErrors")
                .field("errors", &errors.len())
                .field("sessions", &sessions.len())
                .finish(),
            Action::AddSessionBinding { session_id } => f
                .debug_struct("AddSessionBinding")
                .field("session_id", session_id)
                .finish(),
            Action::RemoveSessionBindings { session_ids } => f
                .debug_struct("RemoveSessionBindings")
                .field("session_ids", session_ids)
                .finish(),
            Action::SignalFlowHasStarted => f.write_str("SignalFlowHasStarted"),
            Action::RemoveFlow { reason, .. } => {
                f.debug_struct("RemoveFlow").field("reason", reason).finish()
            }
            Action::MoveFlowToPaused { .. } => f.write_str("MoveFlowToPaused"),
            Action::ScheduleEvent(event) => f.debug_tuple("ScheduleEvent").field(event).finish(),
            Action::SleepUntil { until } => {
                f.debug_struct("SleepUntil").field("until", until).finish()
            }
            Action::CreateTransaction => f.write_str("CreateTransaction"),
            Action::CommitTransaction => f.write_str("CommitTransaction"),
            Action::RollbackTransaction => f.write_str("RollbackTransaction"),
            Action::ExecuteAsyncOperation { dedup_id, .. } => f
                .debug_struct("ExecuteAsyncOperation")
                .field("dedup_id", dedup_id)
                .finish(),
            Action::ReleaseSoftLocks { lock_id } => f
                .debug_struct("ReleaseSoftLocks")
                .field("lock_id", lock_id)
                .finish(),
            Action::RetryFlowFromSafePoint => f.write_str("RetryFlowFromSafePoint"),
            Action::ScheduleFlowTimeout => f.write_str("ScheduleFlowTimeout"),
            Action::CancelFlowTimeout => f.write_str("CancelFlowTimeout"),
        }
    }
}
