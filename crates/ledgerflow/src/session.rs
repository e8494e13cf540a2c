//! Session states and the session wire protocol.
//!
//! A session is a point-to-point logical channel between two flows on
//! different nodes. Each session is a three-state machine scoped to one
//! flow-to-peer relationship:
//!
//! ```text
//! Uninitiated ──(send init)──▶ Initiating ──(confirm)──▶ Initiated{Live}
//!                                   │                        │
//!                                   └──(reject)              └──(end)──▶ Initiated{Ended}
//! ```
//!
//! Outbound messages sent while `Initiating` are buffered with their already
//! derived deduplication ids and flushed verbatim once the confirmation
//! arrives, so a crash between buffering and flushing replays identically.

use serde::{Deserialize, Serialize};

use crate::dedup::DeduplicationId;
use crate::error::FlowError;
use crate::ids::{Party, SerializedBytes, SessionId};

/// Version and application identity of a peer's flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInfo {
    pub flow_version: u32,
    pub app_name: String,
}

/// Liveness of a confirmed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatedSessionState {
    /// The peer flow is still running.
    Live,
    /// The peer flow sent its end-of-session message. Buffered data may
    /// still be pending consumption.
    Ended,
}

/// Per-session protocol state, stored in the checkpoint's session map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// The session handle exists but no initiation message has been sent.
    Uninitiated {
        destination: Party,
        /// Class name of the flow the counterparty should run.
        initiating_class: String,
        /// Our initiating flow's version info, quoted in the init message.
        initiating_flow_info: FlowInfo,
        source_session_id: SessionId,
        /// Extra entropy mixed into the peer's deduplication seed.
        additional_entropy: u64,
    },

    /// Initiation sent, confirmation pending. Outbound messages buffer here.
    Initiating {
        destination: Party,
        buffered_messages: Vec<(DeduplicationId, ExistingSessionPayload)>,
        /// Set when the peer rejected the initiation.
        rejection_error: Option<FlowError>,
        deduplication_seed: String,
    },

    /// Confirmed: the peer party and sink session id are resolved.
    Initiated {
        peer: Party,
        peer_flow_info: FlowInfo,
        /// The peer's session id; all outbound traffic addresses it.
        peer_sink_session_id: SessionId,
        /// Messages received and not yet consumed by the flow.
        received_messages: Vec<ExistingSessionPayload>,
        liveness: InitiatedSessionState,
        /// The peer reported a flow error on this session.
        other_side_errored: bool,
        deduplication_seed: String,
    },
}

impl SessionState {
    /// The seed this session derives outbound deduplication ids from.
    pub fn deduplication_seed(&self) -> String {
        match self {
            SessionState::Uninitiated {
                source_session_id,
                additional_entropy,
                ..
            } => uninitiated_seed(*source_session_id, *additional_entropy),
            SessionState::Initiating {
                deduplication_seed, ..
            }
            | SessionState::Initiated {
                deduplication_seed, ..
            } => deduplication_seed.clone(),
        }
    }

    /// The counterparty this session talks to, once known.
    pub fn counterparty(&self) -> &Party {
        match self {
            SessionState::Uninitiated { destination, .. }
            | SessionState::Initiating { destination, .. } => destination,
            SessionState::Initiated { peer, .. } => peer,
        }
    }
}

/// Seed for a session we initiate.
pub(crate) fn uninitiated_seed(source_session_id: SessionId, additional_entropy: u64) -> String {
    format!("R-{}-{}", source_session_id.to_raw(), additional_entropy)
}

/// Seed for a session created on the responder side from an init message.
pub(crate) fn initiated_seed(initiator_session_id: SessionId, initiation_entropy: u64) -> String {
    format!("D-{}-{}", initiator_session_id.to_raw(), initiation_entropy)
}

/// Any message of the session protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMessage {
    Initial(InitialSessionMessage),
    Existing(ExistingSessionMessage),
}

/// The handshake opener sent to a counterparty to start a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSessionMessage {
    pub initiator_session_id: SessionId,
    /// Entropy the responder mixes into its deduplication seed.
    pub initiation_entropy: u64,
    /// Class name of the responder flow to instantiate.
    pub initiator_flow_class_name: String,
    pub flow_version: u32,
    pub app_name: String,
    /// Optional payload delivered with the handshake itself.
    pub first_payload: Option<SerializedBytes>,
}

/// A message on an already-opened session, addressed to the recipient's
/// session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExistingSessionMessage {
    pub recipient_session_id: SessionId,
    pub payload: ExistingSessionPayload,
}

/// Payload variants carried over a confirmed (or confirming) session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExistingSessionPayload {
    /// Responder's handshake reply: its own session id and flow info.
    Confirm {
        initiated_session_id: SessionId,
        initiated_flow_info: FlowInfo,
    },
    /// Application data.
    Data { payload: SerializedBytes },
    /// A flow error relayed to this session. `error_id` is the stable origin
    /// id used for cross-peer deduplication of the same failure.
    Error {
        /// Present when the failure was a deliberate, protocol-visible flow
        /// exception; absent for opaque counter-flow failures.
        flow_exception: Option<crate::error::FlowErrorKind>,
        error_id: i64,
    },
    /// The responder refused to open the session.
    Reject { message: String, error_id: i64 },
    /// Orderly end of the sending side's participation.
    End,
}

impl ExistingSessionPayload {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ExistingSessionPayload::Confirm { .. } => "confirm",
            ExistingSessionPayload::Data { .. } => "data",
            ExistingSessionPayload::Error { .. } => "error",
            ExistingSessionPayload::Reject { .. } => "reject",
            ExistingSessionPayload::End => "end",
        }
    }
}
