//! Deterministic message identifiers and the deduplication seam.
//!
//! Every replayable outbound message is keyed by a [`DeduplicationId`]
//! derived from the sending session's seed, the flow's suspension count and
//! the message's index within the transition. Replaying the same
//! pre-suspension computation from the same checkpoint therefore regenerates
//! the exact same ids, which is what makes retried sends idempotent at the
//! receiving deduplication layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::SessionId;

/// A stable key identifying one logical message delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeduplicationId(pub String);

impl DeduplicationId {
    /// Id for a normal in-session message.
    ///
    /// Unique per (session seed, suspension count, index of the message
    /// within the emitting transition), and reproducible on replay.
    pub fn for_normal(seed: &str, number_of_suspends: u32, index: usize) -> Self {
        Self(format!("N-{seed}-{number_of_suspends}-{index}"))
    }

    /// Id for an error message propagated to a session.
    ///
    /// Keyed by the originating error id and the recipient session so the
    /// same failure reaching a peer via different paths deduplicates.
    pub fn for_error(error_id: i64, recipient_session_id: SessionId) -> Self {
        Self(format!("E-{error_id}-{}", recipient_session_id.to_raw()))
    }

    /// Random id for a message that is never replayed (e.g. session
    /// rejections emitted outside any checkpointed transition).
    pub fn random() -> Self {
        Self(format!("X-{}", Uuid::new_v4()))
    }

    /// Borrow the raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeduplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deduplication id together with the sending node's process identity,
/// used by receivers for high-water-mark deduplication of live senders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderDeduplicationId {
    pub deduplication_id: DeduplicationId,
    /// `None` when the flow was resumed from a checkpoint, which excludes it
    /// from high-water-marking.
    pub sender_uuid: Option<Uuid>,
}

/// Hook pair attached to every externally delivered event.
///
/// `inside_database_transaction` persists the fact that the message was
/// consumed (so a crash after commit never re-processes it);
/// `after_database_transaction` acknowledges the delivery to the broker.
/// Acknowledgement failures must never fail the governing transaction: the
/// executor logs and swallows them, accepting a redundant redelivery.
pub trait DeduplicationHandler: Send + Sync {
    /// Persist the deduplication fact inside the current transaction.
    fn inside_database_transaction(&self) -> crate::Result<()>;

    /// Acknowledge the delivery after the transaction committed.
    fn after_database_transaction(&self) -> crate::Result<()>;

    /// True when this handler guards a flow-start trigger (an initial
    /// session message or an external start request) rather than an
    /// in-session delivery.
    fn is_flow_start(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_ids_are_deterministic() {
        let a = DeduplicationId::for_normal("R-17-99", 3, 0);
        let b = DeduplicationId::for_normal("R-17-99", 3, 0);

        assert_eq!(a, b);
        assert_eq!(a.as_str(), "N-R-17-99-3-0");
    }

    #[test]
    fn normal_ids_vary_by_suspend_count_and_index() {
        let base = DeduplicationId::for_normal("S", 1, 0);

        assert_ne!(base, DeduplicationId::for_normal("S", 2, 0));
        assert_ne!(base, DeduplicationId::for_normal("S", 1, 1));
    }

    #[test]
    fn error_ids_key_on_error_and_recipient() {
        let id = DeduplicationId::for_error(-5, SessionId::from_raw(8));
        assert_eq!(id.as_str(), "E--5-8");
    }

    #[test]
    fn random_ids_differ() {
        assert_ne!(DeduplicationId::random(), DeduplicationId::random());
    }
}
