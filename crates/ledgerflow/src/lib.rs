//! Durable flow engine for a peer-to-peer ledger node.
//!
//! Ledgerflow runs long-lived, resumable business protocols ("flows") that
//! suspend on network I/O, persist their state at every suspension point,
//! survive process restarts, coordinate with remote peers through a
//! deduplicated session protocol, and recover automatically from transient
//! and permanent failures.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       StateMachineManager                            │
//! │                                                                      │
//! │  peer messages / timers / start requests                             │
//! │        │ routed to the owning flow's private event queue             │
//! │        ▼                                                             │
//! │  ┌─────────────── fiber (one task per flow) ─────────────────┐       │
//! │  │  Event ─▶ Transition Engine (pure) ─▶ Actions + Continuation      │
//! │  │                    │                      │               │       │
//! │  │                    │                      ▼               │       │
//! │  │                    │            Action Executor           │       │
//! │  │                    │   (checkpoints, sends, transactions) │       │
//! │  │                    ▼                                      │       │
//! │  │            errors ─▶ Flow Hospital ─▶ retry / propagate   │       │
//! │  └───────────────────────────────────────────────────────────┘       │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Transitions are pure**: `(state, event) -> (new state, actions)`.
//!   Deciding happens in the [`StateMachine`], executing in the
//!   [`ActionExecutor`], inside a transaction bounded by explicit
//!   create/commit/rollback actions.
//! - **Each flow processes one event at a time** through its own queue;
//!   many fibers run concurrently on the shared runtime.
//! - **Checkpoints** persist `(io_request, serialized locals)` at every
//!   suspension, so any process can resume a flow from storage.
//! - **Outbound messages carry deterministic deduplication ids**: replaying
//!   a transition after a crash produces wire-identical messages.
//! - **The flow hospital** diagnoses errors and decides retry-from-safe-
//!   point versus propagation to counter-flows.
//!
//! Collaborators (checkpoint storage, the messaging transport, the
//! persistence/transaction manager, the business-logic runtime and the
//! clock) are consumed through narrow traits with in-memory
//! implementations for tests and embedding.

mod action;
mod checkpoint;
mod clock;
mod config;
mod dedup;
mod error;
mod event;
mod executor;
mod fiber;
pub mod hospital;
mod ids;
mod logic;
mod manager;
mod messaging;
mod persistence;
mod scheduler;
mod session;
mod storage;
mod transition;

pub use action::{Action, FlowRemovalReason, SendExisting, SendInitial};
pub use checkpoint::{
    Checkpoint, ErrorState, FlowStart, FlowState, FlowStatus, FutureHandle, InvocationContext,
    InvocationOrigin, SerializedCheckpoint, StateMachineState, SubFlow,
};
pub use clock::{Clock, SystemClock};
pub use config::{FlowTimeoutConfig, StateMachineConfig};
pub use dedup::{DeduplicationHandler, DeduplicationId, SenderDeduplicationId};
pub use error::{
    DatabaseErrorKind, Error, FlowError, FlowErrorKind, Result, SessionRejectReason,
};
pub use event::Event;
pub use executor::ActionExecutor;
pub use fiber::FlowSnapshot;
pub use hospital::{
    Diagnosis, FlowHospital, HospitalOutcomeRecord, MedicalHistory, MedicalRecord, Outcome,
    PropagatingFlowHospital, Staff, StaffedFlowHospital,
};
pub use ids::{FlowId, LedgerTransactionId, Party, SerializedBytes, SessionId};
pub use logic::{
    logic_handle, FlowAsyncOperation, FlowIoRequest, FlowLogic, FlowLogicHandle,
    FlowLogicHydrator, FlowYield, InitiatedFlowFactory, ResumeValue,
};
pub use manager::{
    Change, FlowHandle, FlowResult, ManagerInternal, NoopSoftLockRegistry, RemovalOutcome,
    SoftLockRegistry, StartFlowOptions, StateMachineManager, StateMachineManagerBuilder,
};
pub use messaging::{FlowMessaging, OnSessionMessage, OutboundMessage, RecordingFlowMessaging};
pub use persistence::{DbTransaction, InMemoryPersistence, PersistenceManager};
pub use scheduler::{
    timeout_delay, timeout_delay_with_jitter, FlowSleepScheduler, FlowTimeoutScheduler,
};
pub use session::{
    ExistingSessionMessage, ExistingSessionPayload, FlowInfo, InitialSessionMessage,
    InitiatedSessionState, SessionMessage, SessionState,
};
pub use storage::{CheckpointStorage, InMemoryCheckpointStorage, StoredCheckpoint};
pub use transition::{
    FlowContinuation, StateMachine, TransitionContext, TransitionResult,
};
