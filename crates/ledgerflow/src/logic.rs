//! The seam to the business-logic runtime.
//!
//! Flow code is opaque to the engine. Instead of capturing call stacks, the
//! engine drives a [`FlowLogic`] object that runs until its next suspension
//! point and yields an explicit request; at every suspension the engine
//! persists `(io_request, serialized locals)` so any process can resume the
//! flow from its checkpoint.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowErrorKind};
use crate::ids::{LedgerTransactionId, Party, SerializedBytes, SessionId};
use crate::session::FlowInfo;

/// The I/O request a flow suspends on. Persisted with the checkpoint so a
/// restored flow re-enters exactly the same wait, and quoted by monitoring
/// to describe what a suspended flow is blocked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowIoRequest {
    /// Send a payload to each listed session.
    Send {
        session_to_message: IndexMap<SessionId, SerializedBytes>,
    },
    /// Wait for one payload from each listed session.
    Receive { sessions: Vec<SessionId> },
    /// Send then wait for replies on the same sessions.
    SendAndReceive {
        session_to_message: IndexMap<SessionId, SerializedBytes>,
    },
    /// Sleep until the given instant.
    Sleep {
        #[serde(with = "time::serde::rfc3339")]
        wake_up_after: time::OffsetDateTime,
    },
    /// Wait for a ledger transaction to commit.
    WaitForLedgerCommit { transaction_id: LedgerTransactionId },
    /// Wait for a user-provided asynchronous operation.
    ExecuteAsyncOperation { description: String },
    /// Fetch the peer flow's version info for each listed session.
    GetFlowInfo { sessions: Vec<SessionId> },
    /// Checkpoint without any other I/O.
    ForceCheckpoint,
}

impl FlowIoRequest {
    /// Short name for monitoring and checkpoint metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            FlowIoRequest::Send { .. } => "send",
            FlowIoRequest::Receive { .. } => "receive",
            FlowIoRequest::SendAndReceive { .. } => "send_and_receive",
            FlowIoRequest::Sleep { .. } => "sleep",
            FlowIoRequest::WaitForLedgerCommit { .. } => "wait_for_ledger_commit",
            FlowIoRequest::ExecuteAsyncOperation { .. } => "execute_async_operation",
            FlowIoRequest::GetFlowInfo { .. } => "get_flow_info",
            FlowIoRequest::ForceCheckpoint => "force_checkpoint",
        }
    }
}

/// What the engine hands back to flow code when resuming it.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeValue {
    /// Nothing to deliver: initial start, completed send, sleep wake-up,
    /// forced checkpoint.
    Unit,
    /// A freshly created session handle.
    Session(SessionId),
    /// One received payload per requested session, in request order.
    Messages(Vec<(SessionId, SerializedBytes)>),
    /// Peer flow info per requested session, in request order.
    FlowInfos(Vec<(SessionId, FlowInfo)>),
    /// The awaited ledger transaction committed.
    LedgerTransaction(LedgerTransactionId),
    /// Result of a completed asynchronous operation.
    AsyncResult(serde_json::Value),
}

/// What flow code hands back to the engine when it stops running.
#[derive(Debug)]
pub enum FlowYield {
    /// Suspend on an I/O request. `may_skip_checkpoint` commits the
    /// transaction without persisting, for idempotent sections.
    Suspend {
        request: FlowIoRequest,
        may_skip_checkpoint: bool,
    },
    /// Open a new session towards `destination` and resume with its handle.
    InitiateSession { destination: Party },
    /// Push a subflow frame.
    EnterSubFlow {
        class_name: String,
        /// Present when the subflow establishes initiator semantics.
        initiating: Option<FlowInfo>,
        /// The subflow opts into timed-retry semantics.
        timed: bool,
    },
    /// Pop the current subflow frame.
    LeaveSubFlow,
    /// The flow completed cleanly.
    Finish { result: serde_json::Value },
    /// Flow code failed with an uncaught error.
    Errored(FlowErrorKind),
}

/// A running flow's business logic.
///
/// The engine calls [`resume`](FlowLogic::resume) with the outcome of the
/// previous suspension; the logic runs synchronously until it yields again.
/// Errors travelling towards the flow (peer errors, rejected initiations)
/// arrive via [`throw`](FlowLogic::throw), which the logic may catch and
/// recover from, or surface as [`FlowYield::Errored`].
pub trait FlowLogic: Send {
    /// Run until the next suspension point or completion.
    fn resume(&mut self, value: ResumeValue) -> FlowYield;

    /// Deliver an error into flow code at its current suspension point.
    ///
    /// The default surfaces the error uncaught.
    fn throw(&mut self, error: FlowError) -> FlowYield {
        FlowYield::Errored(error.kind)
    }

    /// Serialize the flow's local state for checkpointing.
    fn snapshot(&self) -> SerializedBytes;

    /// The asynchronous operation behind a pending
    /// [`FlowIoRequest::ExecuteAsyncOperation`], re-obtainable after
    /// rehydration since operation objects are never persisted.
    fn async_operation(&self) -> Option<Arc<dyn FlowAsyncOperation>> {
        None
    }
}

/// Shared handle to a flow's live logic object.
///
/// The fiber's serialized event processing is the only writer; the mutex
/// exists so state snapshots can be cloned across transition boundaries.
pub type FlowLogicHandle = Arc<Mutex<Box<dyn FlowLogic>>>;

/// Wrap a logic object into a shared handle.
pub fn logic_handle(logic: Box<dyn FlowLogic>) -> FlowLogicHandle {
    Arc::new(Mutex::new(logic))
}

/// User-provided asynchronous work a flow can suspend on.
#[async_trait]
pub trait FlowAsyncOperation: Send + Sync {
    /// Execute the operation. `dedup_id` is stable across retries of the
    /// same suspension, for operations that support idempotency keys.
    async fn execute(&self, dedup_id: &str) -> std::result::Result<serde_json::Value, FlowErrorKind>;
}

/// Factory for responder flows, registered per initiator class name.
pub trait InitiatedFlowFactory: Send + Sync {
    /// Build the responder logic for a new inbound session. `session_id`
    /// is our end of the initiated session.
    fn create(
        &self,
        session_id: SessionId,
        peer: &Party,
        first_payload: Option<&SerializedBytes>,
    ) -> std::result::Result<Box<dyn FlowLogic>, String>;

    /// Version info advertised in the session confirmation.
    fn flow_info(&self) -> FlowInfo;
}

/// Rehydrates logic objects from checkpointed bytes.
///
/// The engine persists opaque snapshots; only the business-logic runtime
/// knows how to turn them back into runnable objects.
pub trait FlowLogicHydrator: Send + Sync {
    /// Restore a logic object from its serialized locals.
    fn hydrate(&self, frozen: &SerializedBytes) -> std::result::Result<Box<dyn FlowLogic>, String>;
}
