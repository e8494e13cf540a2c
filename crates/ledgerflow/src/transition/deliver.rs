//! Transition for inbound session messages.

use std::sync::Arc;

use uuid::Uuid;

use crate::action::{Action, SendExisting};
use crate::checkpoint::StateMachineState;
use crate::dedup::{DeduplicationHandler, SenderDeduplicationId};
use crate::error::{FlowError, FlowErrorKind, SessionRejectReason};
use crate::event::Event;
use crate::ids::Party;
use crate::session::{
    ExistingSessionMessage, ExistingSessionPayload, InitiatedSessionState, SessionState,
};

use super::{FlowContinuation, TransitionBuilder, TransitionContext, TransitionResult};

/// Fold one inbound message into the owning session's state and schedule a
/// work-check. The message's deduplication handler joins the pending set and
/// is persisted/acknowledged at the next checkpoint.
pub(crate) fn transition(
    ctx: &TransitionContext,
    state: &StateMachineState,
    message: ExistingSessionMessage,
    sender: Party,
    handler: Arc<dyn DeduplicationHandler>,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    builder
        .current_state
        .pending_deduplication_handlers
        .push(handler);

    let session_id = message.recipient_session_id;
    let payload_kind = message.payload.kind();
    let outcome = match builder.current_state.checkpoint.sessions.get_mut(&session_id) {
        None => Err("no such session".to_owned()),
        Some(session) => apply_payload(session, message.payload, &sender, state.sender_uuid),
    };

    match outcome {
        Ok(flushed) => {
            if !flushed.is_empty() {
                builder.actions.push(Action::SendMultiple {
                    initial: vec![],
                    existing: flushed,
                });
            }
        }
        Err(detail) => {
            builder.fresh_error(FlowErrorKind::Internal {
                message: format!(
                    "cannot deliver {payload_kind} message to session {session_id}: {detail}"
                ),
            });
        }
    }

    builder
        .actions
        .push(Action::ScheduleEvent(Event::DoRemainingWork));
    builder.build(FlowContinuation::ProcessEvents)
}

/// Apply one payload to a session, returning any sends unblocked by it
/// (buffered messages flushed on confirmation).
fn apply_payload(
    session: &mut SessionState,
    payload: ExistingSessionPayload,
    sender: &Party,
    sender_uuid: Option<Uuid>,
) -> Result<Vec<SendExisting>, String> {
    match payload {
        ExistingSessionPayload::Confirm {
            initiated_session_id,
            initiated_flow_info,
        } => {
            let SessionState::Initiating {
                buffered_messages,
                deduplication_seed,
                ..
            } = session
            else {
                return Err(format!("confirmation on {} session", state_name(session)));
            };
            let buffered: Vec<_> = buffered_messages.drain(..).collect();
            let seed = std::mem::take(deduplication_seed);
            *session = SessionState::Initiated {
                peer: sender.clone(),
                peer_flow_info: initiated_flow_info,
                peer_sink_session_id: initiated_session_id,
                received_messages: vec![],
                liveness: InitiatedSessionState::Live,
                other_side_errored: false,
                deduplication_seed: seed,
            };
            Ok(buffered
                .into_iter()
                .map(|(dedup, payload)| SendExisting {
                    peer: sender.clone(),
                    message: ExistingSessionMessage {
                        recipient_session_id: initiated_session_id,
                        payload,
                    },
                    dedup: SenderDeduplicationId {
                        deduplication_id: dedup,
                        sender_uuid,
                    },
                })
                .collect())
        }
        ExistingSessionPayload::Reject { message, error_id } => {
            let SessionState::Initiating {
                rejection_error, ..
            } = session
            else {
                return Err(format!("rejection on {} session", state_name(session)));
            };
            *rejection_error = Some(FlowError::with_id(
                error_id,
                FlowErrorKind::SessionRejected {
                    reason: SessionRejectReason::InitiationFailure { message },
                },
            ));
            Ok(vec![])
        }
        payload @ (ExistingSessionPayload::Data { .. } | ExistingSessionPayload::Error { .. }) => {
            let SessionState::Initiated {
                received_messages, ..
            } = session
            else {
                return Err(format!(
                    "{} message on {} session",
                    payload.kind(),
                    state_name(session)
                ));
            };
            received_messages.push(payload);
            Ok(vec![])
        }
        ExistingSessionPayload::End => {
            let SessionState::Initiated { liveness, .. } = session else {
                return Err(format!("end message on {} session", state_name(session)));
            };
            *liveness = InitiatedSessionState::Ended;
            Ok(vec![])
        }
    }
}

fn state_name(session: &SessionState) -> &'static str {
    match session {
        SessionState::Uninitiated { .. } => "uninitiated",
        SessionState::Initiating { .. } => "initiating",
        SessionState::Initiated { .. } => "initiated",
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::dedup::DeduplicationId;
    use crate::ids::{SerializedBytes, SessionId};

    struct NoopHandler;

    impl DeduplicationHandler for NoopHandler {
        fn inside_database_transaction(&self) -> crate::Result<()> {
            Ok(())
        }

        fn after_database_transaction(&self) -> crate::Result<()> {
            Ok(())
        }
    }

    fn initiating_state(buffered: Vec<(DeduplicationId, ExistingSessionPayload)>) -> SessionState {
        SessionState::Initiating {
            destination: Party::new("O=Peer"),
            buffered_messages: buffered,
            rejection_error: None,
            deduplication_seed: "R-1-2".into(),
        }
    }

    fn initiated_state() -> SessionState {
        SessionState::Initiated {
            peer: Party::new("O=Peer"),
            peer_flow_info: test_flow_info(),
            peer_sink_session_id: SessionId::from_raw(2),
            received_messages: vec![],
            liveness: InitiatedSessionState::Live,
            other_side_errored: false,
            deduplication_seed: "R-1-2".into(),
        }
    }

    fn deliver(
        state: &StateMachineState,
        session_id: SessionId,
        payload: ExistingSessionPayload,
    ) -> TransitionResult {
        test_machine().transition(
            state,
            crate::event::Event::DeliverSessionMessage {
                message: ExistingSessionMessage {
                    recipient_session_id: session_id,
                    payload,
                },
                sender: Party::new("O=Peer"),
                handler: Arc::new(NoopHandler),
            },
        )
    }

    #[test]
    fn confirm_promotes_session_and_flushes_buffered_sends() {
        let session_id = SessionId::from_raw(1);
        let buffered = vec![(
            DeduplicationId::for_normal("R-1-2", 1, 0),
            ExistingSessionPayload::Data {
                payload: SerializedBytes::new(vec![3]),
            },
        )];
        let state = test_state(
            initiating_checkpoint().with_session(session_id, initiating_state(buffered)),
        );

        let result = deliver(
            &state,
            session_id,
            ExistingSessionPayload::Confirm {
                initiated_session_id: SessionId::from_raw(50),
                initiated_flow_info: test_flow_info(),
            },
        );

        match &result.new_state.checkpoint.sessions[&session_id] {
            SessionState::Initiated {
                peer_sink_session_id,
                deduplication_seed,
                ..
            } => {
                assert_eq!(*peer_sink_session_id, SessionId::from_raw(50));
                // The seed survives the promotion so replay stays stable.
                assert_eq!(deduplication_seed, "R-1-2");
            }
            other => panic!("expected initiated session, got {other:?}"),
        }
        let flushed: Vec<_> = result
            .actions
            .iter()
            .filter_map(|a| match a {
                Action::SendMultiple { existing, .. } => Some(existing),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(flushed.len(), 1);
        // Buffered messages keep the dedup id derived when they were queued.
        assert_eq!(
            flushed[0].dedup.deduplication_id,
            DeduplicationId::for_normal("R-1-2", 1, 0)
        );
        assert_eq!(
            flushed[0].message.recipient_session_id,
            SessionId::from_raw(50)
        );
    }

    #[test]
    fn reject_records_rejection_error() {
        let session_id = SessionId::from_raw(1);
        let state =
            test_state(initiating_checkpoint().with_session(session_id, initiating_state(vec![])));

        let result = deliver(
            &state,
            session_id,
            ExistingSessionPayload::Reject {
                message: "unknown flow class app.Settle".into(),
                error_id: 99,
            },
        );

        match &result.new_state.checkpoint.sessions[&session_id] {
            SessionState::Initiating {
                rejection_error: Some(error),
                ..
            } => {
                assert_eq!(error.error_id, 99);
            }
            other => panic!("expected rejection recorded, got {other:?}"),
        }
    }

    #[test]
    fn data_is_buffered_on_initiated_session() {
        let session_id = SessionId::from_raw(1);
        let state =
            test_state(initiating_checkpoint().with_session(session_id, initiated_state()));

        let result = deliver(
            &state,
            session_id,
            ExistingSessionPayload::Data {
                payload: SerializedBytes::new(vec![8]),
            },
        );

        match &result.new_state.checkpoint.sessions[&session_id] {
            SessionState::Initiated {
                received_messages, ..
            } => assert_eq!(received_messages.len(), 1),
            other => panic!("expected initiated session, got {other:?}"),
        }
        assert_eq!(result.new_state.pending_deduplication_handlers.len(), 1);
        assert!(result
            .actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleEvent(Event::DoRemainingWork))));
    }

    #[test]
    fn end_marks_session_ended() {
        let session_id = SessionId::from_raw(1);
        let state =
            test_state(initiating_checkpoint().with_session(session_id, initiated_state()));

        let result = deliver(&state, session_id, ExistingSessionPayload::End);

        match &result.new_state.checkpoint.sessions[&session_id] {
            SessionState::Initiated { liveness, .. } => {
                assert_eq!(*liveness, InitiatedSessionState::Ended);
            }
            other => panic!("expected initiated session, got {other:?}"),
        }
    }

    #[test]
    fn data_on_uninitiated_session_errors_the_flow() {
        let session_id = SessionId::from_raw(1);
        let state = test_state(initiating_checkpoint().with_session(
            session_id,
            SessionState::Uninitiated {
                destination: Party::new("O=Peer"),
                initiating_class: "app.Settle".into(),
                initiating_flow_info: test_flow_info(),
                source_session_id: session_id,
                additional_entropy: 1,
            },
        ));

        let result = deliver(
            &state,
            session_id,
            ExistingSessionPayload::Data {
                payload: SerializedBytes::new(vec![8]),
            },
        );

        assert!(result.new_state.checkpoint.error_state.is_errored());
    }
}
