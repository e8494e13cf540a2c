//! Messaging transport seam.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::dedup::{DeduplicationHandler, SenderDeduplicationId};
use crate::error::Result;
use crate::ids::Party;
use crate::session::SessionMessage;

/// Callback invoked by the transport for every inbound session message.
pub type OnSessionMessage =
    Arc<dyn Fn(Party, SessionMessage, Arc<dyn DeduplicationHandler>) + Send + Sync>;

/// Outbound half of the session transport. Payloads travel as opaque
/// serialized blobs on a fixed session topic; delivery retries are keyed by
/// the deduplication id so the receiving side can discard duplicates.
#[async_trait]
pub trait FlowMessaging: Send + Sync + 'static {
    /// Queue one session message for delivery.
    async fn send_session_message(
        &self,
        destination: &Party,
        message: SessionMessage,
        dedup: SenderDeduplicationId,
    ) -> Result<()>;

    /// Start delivering inbound messages to `on_message`.
    async fn start(&self, on_message: OnSessionMessage) -> Result<()>;
}

/// A sent message captured by [`RecordingFlowMessaging`].
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub destination: Party,
    pub message: SessionMessage,
    pub dedup: SenderDeduplicationId,
}

/// Transport stub that records outbound traffic. Used by tests and by
/// single-node embeddings that wire their own delivery.
#[derive(Default)]
pub struct RecordingFlowMessaging {
    sent: Mutex<Vec<OutboundMessage>>,
    on_message: Mutex<Option<OnSessionMessage>>,
}

impl RecordingFlowMessaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Deliver a message inbound, as the network would.
    pub fn deliver(
        &self,
        sender: Party,
        message: SessionMessage,
        handler: Arc<dyn DeduplicationHandler>,
    ) {
        let callback = self.on_message.lock().expect("callback lock").clone();
        if let Some(callback) = callback {
            callback(sender, message, handler);
        }
    }
}

#[async_trait]
impl FlowMessaging for RecordingFlowMessaging {
    async fn send_session_message(
        &self,
        destination: &Party,
        message: SessionMessage,
        dedup: SenderDeduplicationId,
    ) -> Result<()> {
        self.sent.lock().expect("sent lock").push(OutboundMessage {
            destination: destination.clone(),
            message,
            dedup,
        });
        Ok(())
    }

    async fn start(&self, on_message: OnSessionMessage) -> Result<()> {
        *self.on_message.lock().expect("callback lock") = Some(on_message);
        Ok(())
    }
}
