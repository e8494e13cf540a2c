//! The action executor: runs the side effects a transition decided on,
//! against the real collaborators, inside the flow's transaction.

use std::sync::Arc;

use tracing::{error, warn};

use crate::action::{Action, SendExisting, SendInitial};
use crate::checkpoint::{FutureHandle, StateMachineState};
use crate::dedup::{DeduplicationId, SenderDeduplicationId};
use crate::error::{Error, FlowError, FlowErrorKind, Result};
use crate::event::Event;
use crate::hospital::EventSender;
use crate::ids::FlowId;
use crate::manager::ManagerInternal;
use crate::messaging::FlowMessaging;
use crate::persistence::{DbTransaction, PersistenceManager};
use crate::scheduler::FlowSleepScheduler;
use crate::session::{
    ExistingSessionMessage, ExistingSessionPayload, InitiatedSessionState, SessionMessage,
    SessionState,
};
use crate::storage::CheckpointStorage;

/// Executes actions for one flow. Owns the flow's single transaction slot:
/// opening a second transaction while one is open is a programming error,
/// and storage side effects outside a transaction are rejected.
pub struct ActionExecutor {
    flow_id: FlowId,
    storage: Arc<dyn CheckpointStorage>,
    messaging: Arc<dyn FlowMessaging>,
    persistence: Arc<dyn PersistenceManager>,
    manager: Arc<dyn ManagerInternal>,
    sleep_scheduler: FlowSleepScheduler,
    self_sender: EventSender,
    current_transaction: Option<Box<dyn DbTransaction>>,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        flow_id: FlowId,
        storage: Arc<dyn CheckpointStorage>,
        messaging: Arc<dyn FlowMessaging>,
        persistence: Arc<dyn PersistenceManager>,
        manager: Arc<dyn ManagerInternal>,
        sleep_scheduler: FlowSleepScheduler,
        self_sender: EventSender,
    ) -> Self {
        Self {
            flow_id,
            storage,
            messaging,
            persistence,
            manager,
            sleep_scheduler,
            self_sender,
            current_transaction: None,
        }
    }

    /// True while the flow's transaction is open.
    pub fn transaction_open(&self) -> bool {
        self.current_transaction.is_some()
    }

    /// Roll back the open transaction, if any. Used by the fiber when an
    /// action fails mid-transition.
    pub async fn rollback_open_transaction(&mut self) {
        if let Some(tx) = self.current_transaction.take() {
            if let Err(rollback_error) = tx.rollback().await {
                error!(flow_id = %self.flow_id, error = %rollback_error, "Rollback failed");
            }
        }
    }

    /// Execute one action. `state` is the transition's new state; executors
    /// for waits record their future handle on it.
    pub async fn execute(&mut self, action: Action, state: &mut StateMachineState) -> Result<()> {
        match action {
            Action::TrackTransaction { transaction_id } => {
                self.manager.track_transaction(self.flow_id, transaction_id);
                Ok(())
            }
            Action::SendInitial(send) => self.send_initial(send).await,
            Action::SendExisting(send) => self.send_existing(send).await,
            Action::SendMultiple { initial, existing } => {
                for send in initial {
                    self.send_initial(send).await?;
                }
                for send in existing {
                    self.send_existing(send).await?;
                }
                Ok(())
            }
            Action::PersistCheckpoint {
                flow_id,
                checkpoint,
                is_update,
            } => {
                self.require_transaction()?;
                let serialized = checkpoint.to_serialized()?;
                if is_update {
                    self.storage.update_checkpoint(flow_id, serialized).await?;
                } else {
                    self.storage.add_checkpoint(flow_id, serialized).await?;
                }
                // Hospitalized checkpoints keep their error on record for
                // operator inspection.
                if checkpoint.status == crate::checkpoint::FlowStatus::Hospitalized {
                    if let crate::checkpoint::ErrorState::Errored { errors, .. } =
                        &checkpoint.error_state
                    {
                        self.storage
                            .add_flow_exception(flow_id, errors.first().clone())
                            .await?;
                    }
                }
                Ok(())
            }
            Action::RemoveCheckpoint { flow_id } => {
                self.require_transaction()?;
                self.storage.remove_checkpoint(flow_id).await
            }
            Action::UpdateFlowStatus { flow_id, status } => {
                self.require_transaction()?;
                self.storage.update_status(flow_id, status).await
            }
            Action::PersistDeduplicationFacts { handlers } => {
                self.require_transaction()?;
                for handler in handlers {
                    handler.inside_database_transaction()?;
                }
                Ok(())
            }
            Action::AcknowledgeMessages { handlers } => {
                for handler in handlers {
                    // An acknowledgement failure must never fail the
                    // governing transaction; dedup makes redelivery safe.
                    if let Err(ack_error) = handler.after_database_transaction() {
                        warn!(
                            flow_id = %self.flow_id,
                            error = %ack_error,
                            "Failed to acknowledge message delivery"
                        );
                    }
                }
                Ok(())
            }
            Action::PropagateErrors {
                errors,
                sessions,
                sender_uuid,
            } => {
                self.propagate_errors(errors, sessions, sender_uuid).await
            }
            Action::AddSessionBinding { session_id } => {
                self.manager.add_session_binding(self.flow_id, session_id)
            }
            Action::RemoveSessionBindings { session_ids } => {
                self.manager.remove_session_bindings(&session_ids);
                Ok(())
            }
            Action::SignalFlowHasStarted => {
                self.manager.signal_flow_has_started(self.flow_id);
                Ok(())
            }
            Action::RemoveFlow { reason, last_state } => {
                self.manager
                    .remove_flow(self.flow_id, reason, *last_state)
                    .await;
                Ok(())
            }
            Action::MoveFlowToPaused { last_state } => {
                self.manager
                    .move_flow_to_paused(self.flow_id, *last_state)
                    .await;
                Ok(())
            }
            Action::ScheduleEvent(event) => {
                let _ = self.self_sender.send(event);
                Ok(())
            }
            Action::SleepUntil { until } => {
                self.sleep_scheduler
                    .sleep(state, self.self_sender.clone(), until);
                Ok(())
            }
            Action::CreateTransaction => {
                if self.current_transaction.is_some() {
                    return Err(Error::TransactionAlreadyOpen(self.flow_id));
                }
                self.current_transaction = Some(self.persistence.new_transaction().await?);
                Ok(())
            }
            Action::CommitTransaction => {
                let tx = self
                    .current_transaction
                    .take()
                    .ok_or(Error::NoActiveTransaction(self.flow_id))?;
                tx.commit().await
            }
            Action::RollbackTransaction => {
                match self.current_transaction.take() {
                    Some(tx) => tx.rollback().await,
                    None => {
                        warn!(flow_id = %self.flow_id, "Rollback requested with no open transaction");
                        Ok(())
                    }
                }
            }
            Action::ExecuteAsyncOperation {
                dedup_id,
                operation,
            } => {
                let sender = self.self_sender.clone();
                let task = tokio::spawn(async move {
                    let event = match operation.execute(&dedup_id).await {
                        Ok(value) => Event::AsyncOperationCompletion(value),
                        // Wrapped so the hospital can tell user async
                        // failures apart from transition failures.
                        Err(kind) => Event::AsyncOperationThrows(
                            FlowErrorKind::AsyncOperationFailed {
                                message: kind.to_string(),
                                cause: Some(Box::new(kind)),
                            },
                        ),
                    };
                    let _ = sender.send(event);
                });
                state.future = Some(FutureHandle::new(task.abort_handle()));
                Ok(())
            }
            Action::ReleaseSoftLocks { lock_id } => {
                self.manager.release_soft_locks(lock_id);
                Ok(())
            }
            Action::RetryFlowFromSafePoint => {
                self.manager
                    .retry_flow_from_safe_point(self.flow_id, state)
                    .await;
                Ok(())
            }
            Action::ScheduleFlowTimeout => {
                self.manager.schedule_flow_timeout(self.flow_id);
                Ok(())
            }
            Action::CancelFlowTimeout => {
                self.manager.cancel_flow_timeout(self.flow_id);
                Ok(())
            }
        }
    }

    fn require_transaction(&self) -> Result<()> {
        if self.current_transaction.is_none() {
            return Err(Error::NoActiveTransaction(self.flow_id));
        }
        Ok(())
    }

    async fn send_initial(&self, send: SendInitial) -> Result<()> {
        self.messaging
            .send_session_message(
                &send.destination,
                SessionMessage::Initial(send.message),
                send.dedup,
            )
            .await
    }

    async fn send_existing(&self, send: SendExisting) -> Result<()> {
        self.messaging
            .send_session_message(&send.peer, SessionMessage::Existing(send.message), send.dedup)
            .await
    }

    /// Relay each error to every live confirmed session except those whose
    /// other side already errored (including the error's own origin).
    async fn propagate_errors(
        &self,
        errors: Vec<FlowError>,
        sessions: Vec<SessionState>,
        sender_uuid: Option<uuid::Uuid>,
    ) -> Result<()> {
        for error in &errors {
            for session in &sessions {
                let SessionState::Initiated {
                    peer,
                    peer_sink_session_id,
                    liveness: InitiatedSessionState::Live,
                    other_side_errored: false,
                    ..
                } = session
                else {
                    continue;
                };
                let flow_exception = match &error.kind {
                    kind @ FlowErrorKind::FlowException { .. } => Some(kind.clone()),
                    _ => None,
                };
                let message = ExistingSessionMessage {
                    recipient_session_id: *peer_sink_session_id,
                    payload: ExistingSessionPayload::Error {
                        flow_exception,
                        error_id: error.error_id,
                    },
                };
                let dedup = SenderDeduplicationId {
                    deduplication_id: DeduplicationId::for_error(
                        error.error_id,
                        *peer_sink_session_id,
                    ),
                    sender_uuid,
                };
                self.messaging
                    .send_session_message(peer, SessionMessage::Existing(message), dedup)
                    .await?;
            }
        }
        Ok(())
    }
}
