//! Error types: the crate-level error enum and the serializable flow-error
//! taxonomy that checkpoints and session messages carry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{FlowId, SessionId};

/// A `Result` alias with [`enum@Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by engine operations (storage, routing, lifecycle).
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to serialize or deserialize checkpoint or payload data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted checkpoint could not be restored.
    ///
    /// Outside strict reload mode the affected flow is skipped on restart;
    /// under strict reload mode this is fatal for the flow.
    #[error("failed to restore checkpoint for flow {flow_id}: {source}")]
    CheckpointRestore {
        flow_id: FlowId,
        #[source]
        source: serde_json::Error,
    },

    /// No live flow registered under the given id.
    #[error("unknown flow: {0}")]
    UnknownFlow(FlowId),

    /// No session-table entry for the given session id.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// A session id was already bound to a different flow.
    #[error("session {session_id} already bound to flow {existing}, cannot bind to {attempted}")]
    DuplicateSessionBinding {
        session_id: SessionId,
        existing: FlowId,
        attempted: FlowId,
    },

    /// A transaction was created while another was still open on the same
    /// flow. This is a programming error in transition logic.
    #[error("transaction already open for flow {0}")]
    TransactionAlreadyOpen(FlowId),

    /// A commit or storage side effect ran with no open transaction.
    #[error("no active transaction for flow {0}")]
    NoActiveTransaction(FlowId),

    /// The manager was driven through an invalid lifecycle edge.
    #[error("manager is {actual}, expected {expected}")]
    ManagerLifecycle {
        expected: &'static str,
        actual: &'static str,
    },

    /// Checkpoint storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Messaging transport failure.
    #[error("messaging error: {0}")]
    Messaging(String),
}

/// An error attached to a flow, carrying a stable origin id.
///
/// The `error_id` is generated once where the error first arises and is
/// carried unchanged as the error propagates to counter-flows, so peers
/// receiving the same failure by different paths can deduplicate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowError {
    pub error_id: i64,
    pub kind: FlowErrorKind,
}

impl FlowError {
    /// Wrap an error kind with a freshly generated origin id.
    pub fn new(kind: FlowErrorKind) -> Self {
        Self {
            error_id: rand::random(),
            kind,
        }
    }

    /// Wrap an error kind under a known origin id (peer-relayed errors).
    pub fn with_id(error_id: i64, kind: FlowErrorKind) -> Self {
        Self { error_id, kind }
    }
}

impl std::fmt::Display for FlowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_id, self.kind)
    }
}

/// The serializable taxonomy of failures a flow can carry.
///
/// Checkpoints, session messages and the hospital all match on these kinds,
/// so hospital routing works on explicit values rather than downcasting.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum FlowErrorKind {
    /// A business-level exception raised by flow code, deliverable to the
    /// counterparty as part of the protocol.
    #[error("flow exception: {message}")]
    FlowException { message: String },

    /// The counter-flow ended or errored where the protocol expected data.
    #[error("unexpected flow end: {message}")]
    UnexpectedFlowEnd { message: String },

    /// Session initiation was rejected by the counterparty.
    #[error("session rejected: {reason}")]
    SessionRejected { reason: SessionRejectReason },

    /// Database failure observed during a transition or side effect.
    #[error("database error ({kind:?}): {message}")]
    Database {
        kind: DatabaseErrorKind,
        message: String,
    },

    /// A timed flow exceeded its allotted time.
    #[error("flow timed out after {retry_count} retries")]
    FlowTimeout { retry_count: u32 },

    /// User-provided asynchronous work failed. The original failure is kept
    /// as the cause so the hospital can route it distinctly from ordinary
    /// transition errors.
    #[error("async operation failed: {message}")]
    AsyncOperationFailed {
        message: String,
        cause: Option<Box<FlowErrorKind>>,
    },

    /// Executing a transition's actions failed; the failure was folded into
    /// the flow's error state instead of crashing the fiber.
    #[error("state transition failed: {message}")]
    StateTransitionFailed {
        message: String,
        cause: Option<Box<FlowErrorKind>>,
    },

    /// Flow code explicitly requested hospitalization (overnight
    /// observation) instead of error propagation.
    #[error("flow hospitalized: {message}")]
    Hospitalize { message: String },

    /// The flow was killed by an operator.
    #[error("flow killed")]
    Killed,

    /// Internal engine failure.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl FlowErrorKind {
    /// Walk the cause chain looking for a kind matching `predicate`.
    pub fn mentions(&self, predicate: &dyn Fn(&FlowErrorKind) -> bool) -> bool {
        if predicate(self) {
            return true;
        }
        match self {
            FlowErrorKind::AsyncOperationFailed { cause, .. }
            | FlowErrorKind::StateTransitionFailed { cause, .. } => cause
                .as_deref()
                .is_some_and(|cause| cause.mentions(predicate)),
            _ => false,
        }
    }

    /// True when the cause chain contains a database deadlock.
    pub fn mentions_deadlock(&self) -> bool {
        self.mentions(&|kind| {
            matches!(
                kind,
                FlowErrorKind::Database {
                    kind: DatabaseErrorKind::Deadlock,
                    ..
                }
            )
        })
    }

    /// True when the cause chain contains a constraint violation.
    pub fn mentions_constraint_violation(&self) -> bool {
        self.mentions(&|kind| {
            matches!(
                kind,
                FlowErrorKind::Database {
                    kind: DatabaseErrorKind::ConstraintViolation,
                    ..
                }
            )
        })
    }
}

/// Classification of database failures relevant to hospital staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseErrorKind {
    Deadlock,
    ConstraintViolation,
    TransientConnection,
    Other,
}

/// Structured reasons a session initiation can be rejected.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SessionRejectReason {
    /// No responder flow is registered under the requested class name.
    #[error("unknown flow class {class_name}")]
    UnknownFlowClass { class_name: String },

    /// A responder factory exists but failed to build the flow.
    #[error("failed to initiate flow: {message}")]
    InitiationFailure { message: String },

    /// The responder node failed internally while establishing the session.
    #[error("unable to establish session: {message}")]
    Internal { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_id_is_preserved_by_with_id() {
        let error = FlowError::with_id(
            7,
            FlowErrorKind::FlowException {
                message: "declined".into(),
            },
        );
        assert_eq!(error.error_id, 7);
    }

    #[test]
    fn mentions_walks_cause_chain() {
        let kind = FlowErrorKind::StateTransitionFailed {
            message: "persist failed".into(),
            cause: Some(Box::new(FlowErrorKind::Database {
                kind: DatabaseErrorKind::Deadlock,
                message: "deadlock detected".into(),
            })),
        };

        assert!(kind.mentions_deadlock());
        assert!(!kind.mentions_constraint_violation());
    }

    #[test]
    fn direct_constraint_violation_is_found() {
        let kind = FlowErrorKind::Database {
            kind: DatabaseErrorKind::ConstraintViolation,
            message: "duplicate key".into(),
        };

        assert!(kind.mentions_constraint_violation());
    }

    #[test]
    fn unrelated_kind_mentions_nothing() {
        let kind = FlowErrorKind::FlowException {
            message: "nope".into(),
        };

        assert!(!kind.mentions_deadlock());
        assert!(!kind.mentions_constraint_violation());
    }
}
