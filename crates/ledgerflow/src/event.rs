//! The event catalogue: every input the transition engine can process.

use std::sync::Arc;

use crate::dedup::DeduplicationHandler;
use crate::error::{FlowError, FlowErrorKind};
use crate::ids::{LedgerTransactionId, Party, SerializedBytes};
use crate::logic::FlowIoRequest;
use crate::session::{ExistingSessionMessage, FlowInfo};

/// An input to a flow's state machine. Events are passive data: the
/// transition engine decides, the action executor acts.
#[derive(Clone)]
pub enum Event {
    /// Check for any remaining work. Re-deliverable at any time: processing
    /// it twice with no new external input changes nothing.
    DoRemainingWork,

    /// An inbound message for one of the flow's sessions.
    DeliverSessionMessage {
        message: ExistingSessionMessage,
        sender: Party,
        handler: Arc<dyn DeduplicationHandler>,
    },

    /// An error injected into the flow (timeouts, infrastructure failures).
    Error(FlowError),

    /// A ledger transaction the flow was waiting on has committed.
    TransactionCommitted(LedgerTransactionId),

    /// Orderly shutdown: suspend in place, keep the checkpoint.
    SoftShutdown,

    /// Begin propagating the flow's errors to its sessions. Irreversible.
    StartErrorPropagation,

    /// Flow code entered a subflow.
    EnterSubFlow {
        class_name: String,
        initiating: Option<FlowInfo>,
        timed: bool,
    },

    /// Flow code left the current subflow.
    LeaveSubFlow,

    /// Flow code suspended on an I/O request.
    Suspend {
        io_request: FlowIoRequest,
        may_skip_checkpoint: bool,
        /// Serialized locals captured at the suspension point.
        fiber: SerializedBytes,
    },

    /// Flow code completed cleanly.
    FlowFinish { result: serde_json::Value },

    /// Flow code requested a new session towards a counterparty.
    InitiateFlow { destination: Party },

    /// A user async operation completed.
    AsyncOperationCompletion(serde_json::Value),

    /// A user async operation failed.
    AsyncOperationThrows(FlowErrorKind),

    /// Recreate the flow from its last persisted checkpoint.
    RetryFlowFromSafePoint,

    /// Strict-mode reload of the checkpoint after a suspension.
    ReloadFlowFromCheckpointAfterSuspend,

    /// The hospital kept the flow in for observation.
    OvernightObservation,

    /// A sleep deadline elapsed.
    WakeUpFromSleep,

    /// Park the flow as a checkpoint-only resident.
    Pause,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::DoRemainingWork => f.write_str("DoRemainingWork"),
            Event::DeliverSessionMessage {
                message, sender, ..
            } => f
                .debug_struct("DeliverSessionMessage")
                .field("recipient", &message.recipient_session_id)
                .field("payload", &message.payload.kind())
                .field("sender", sender)
                .finish(),
            Event::Error(error) => f.debug_tuple("Error").field(error).finish(),
            Event::TransactionCommitted(id) => {
                f.debug_tuple("TransactionCommitted").field(id).finish()
            }
            Event::SoftShutdown => f.write_str("SoftShutdown"),
            Event::StartErrorPropagation => f.write_str("StartErrorPropagation"),
            Event::EnterSubFlow {
                class_name, timed, ..
            } => f
                .debug_struct("EnterSubFlow")
                .field("class_name", class_name)
                .field("timed", timed)
                .finish(),
            Event::LeaveSubFlow => f.write_str("LeaveSubFlow"),
            Event::Suspend {
                io_request,
                may_skip_checkpoint,
                ..
            } => f
                .debug_struct("Suspend")
                .field("io_request", &io_request.kind())
                .field("may_skip_checkpoint", may_skip_checkpoint)
                .finish(),
            Event::FlowFinish { .. } => f.write_str("FlowFinish"),
            Event::InitiateFlow { destination } => f
                .debug_struct("InitiateFlow")
                .field("destination", destination)
                .finish(),
            Event::AsyncOperationCompletion(_) => f.write_str("AsyncOperationCompletion"),
            Event::AsyncOperationThrows(kind) => {
                f.debug_tuple("AsyncOperationThrows").field(kind).finish()
            }
            Event::RetryFlowFromSafePoint => f.write_str("RetryFlowFromSafePoint"),
            Event::ReloadFlowFromCheckpointAfterSuspend => {
                f.write_str("ReloadFlowFromCheckpointAfterSuspend")
            }
            Event::OvernightObservation => f.write_str("OvernightObservation"),
            Event::WakeUpFromSleep => f.write_str("WakeUpFromSleep"),
            Event::Pause => f.write_str("Pause"),
        }
    }
}
