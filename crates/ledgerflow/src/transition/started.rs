//! Transitions for a flow suspended on an I/O request.
//!
//! By the time these run, the suspension's checkpoint is persisted (unless
//! skipped) and the user transaction committed; this module decides whether
//! the request can complete now or must keep waiting.

use indexmap::IndexMap;

use crate::action::{Action, SendExisting, SendInitial};
use crate::checkpoint::{FlowState, StateMachineState};
use crate::dedup::{DeduplicationId, SenderDeduplicationId};
use crate::error::{FlowError, FlowErrorKind};
use crate::ids::{SerializedBytes, SessionId};
use crate::logic::{FlowIoRequest, ResumeValue};
use crate::session::{
    ExistingSessionMessage, ExistingSessionPayload, FlowInfo, InitialSessionMessage,
    InitiatedSessionState, SessionState,
};

use super::{FlowContinuation, TransitionBuilder, TransitionContext, TransitionResult};

pub(crate) fn transition(
    ctx: &TransitionContext,
    state: &StateMachineState,
    io_request: FlowIoRequest,
    frozen_fiber: SerializedBytes,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);

    // Errors already waiting on the involved sessions beat the request.
    let errors = collect_relevant_errors(&mut builder, &io_request);
    if let Some(first) = errors.into_iter().next() {
        let continuation = builder.throw_into_flow(first);
        return terminate_ended_sessions(builder.build(continuation));
    }

    let continuation = match io_request {
        FlowIoRequest::Send { session_to_message } => {
            send_to_sessions(&mut builder, &session_to_message);
            if builder.is_errored() {
                FlowContinuation::ProcessEvents
            } else {
                builder.resume_flow_logic(ResumeValue::Unit)
            }
        }
        FlowIoRequest::Receive { sessions } => {
            send_initial_messages_if_needed(&mut builder, &sessions);
            match poll_session_messages(&mut builder, &sessions) {
                Ok(Some(messages)) => builder.resume_flow_logic(ResumeValue::Messages(messages)),
                Ok(None) => FlowContinuation::ProcessEvents,
                Err(kind) => builder.throw_into_flow(FlowError::new(kind)),
            }
        }
        FlowIoRequest::SendAndReceive { session_to_message } => {
            let sessions: Vec<_> = session_to_message.keys().copied().collect();
            send_to_sessions(&mut builder, &session_to_message);
            if builder.is_errored() {
                FlowContinuation::ProcessEvents
            } else {
                match poll_session_messages(&mut builder, &sessions) {
                    Ok(Some(messages)) => {
                        builder.resume_flow_logic(ResumeValue::Messages(messages))
                    }
                    Ok(None) => {
                        // The sends are done; what remains is a plain receive.
                        builder.current_state.checkpoint.flow_state = FlowState::Started {
                            io_request: FlowIoRequest::Receive { sessions },
                            frozen_fiber,
                        };
                        FlowContinuation::ProcessEvents
                    }
                    Err(kind) => builder.throw_into_flow(FlowError::new(kind)),
                }
            }
        }
        FlowIoRequest::Sleep { wake_up_after } => {
            if state.is_waiting_for_future {
                FlowContinuation::ProcessEvents
            } else {
                builder.current_state.is_waiting_for_future = true;
                builder.actions.push(Action::SleepUntil {
                    until: wake_up_after,
                });
                FlowContinuation::ProcessEvents
            }
        }
        FlowIoRequest::WaitForLedgerCommit { transaction_id } => {
            if state.is_waiting_for_future {
                FlowContinuation::ProcessEvents
            } else {
                builder.current_state.is_waiting_for_future = true;
                builder.actions.push(Action::CreateTransaction);
                builder
                    .actions
                    .push(Action::TrackTransaction { transaction_id });
                builder.actions.push(Action::CommitTransaction);
                FlowContinuation::ProcessEvents
            }
        }
        FlowIoRequest::ExecuteAsyncOperation { .. } => {
            if state.is_waiting_for_future {
                FlowContinuation::ProcessEvents
            } else {
                let operation = state
                    .logic
                    .lock()
                    .ok()
                    .and_then(|logic| logic.async_operation());
                match operation {
                    Some(operation) => {
                        // Suspension count keys the id so re-executions of the
                        // same wait share an idempotency key.
                        let dedup_id = format!(
                            "{}:{}",
                            ctx.flow_id, state.checkpoint.number_of_suspends
                        );
                        builder.current_state.is_waiting_for_future = true;
                        builder.actions.push(Action::ExecuteAsyncOperation {
                            dedup_id,
                            operation,
                        });
                    }
                    None => {
                        builder.fresh_error(FlowErrorKind::Internal {
                            message: "suspended on an async operation the logic cannot provide"
                                .into(),
                        });
                    }
                }
                FlowContinuation::ProcessEvents
            }
        }
        FlowIoRequest::GetFlowInfo { sessions } => {
            send_initial_messages_if_needed(&mut builder, &sessions);
            match flow_infos_from_sessions(&builder, &sessions) {
                Some(infos) => builder.resume_flow_logic(ResumeValue::FlowInfos(infos)),
                None => FlowContinuation::ProcessEvents,
            }
        }
        FlowIoRequest::ForceCheckpoint => builder.resume_flow_logic(ResumeValue::Unit),
    };

    terminate_ended_sessions(builder.build(continuation))
}

/// Sessions the request touches, in request order.
fn requested_sessions(io_request: &FlowIoRequest) -> Vec<SessionId> {
    match io_request {
        FlowIoRequest::Send { session_to_message }
        | FlowIoRequest::SendAndReceive { session_to_message } => {
            session_to_message.keys().copied().collect()
        }
        FlowIoRequest::Receive { sessions } | FlowIoRequest::GetFlowInfo { sessions } => {
            sessions.clone()
        }
        FlowIoRequest::WaitForLedgerCommit { .. } => vec![],
        FlowIoRequest::Sleep { .. }
        | FlowIoRequest::ExecuteAsyncOperation { .. }
        | FlowIoRequest::ForceCheckpoint => vec![],
    }
}

/// Gather errors that must reach flow code before the request proceeds:
/// initiation rejections, peer-relayed errors, and accesses to sessions
/// that no longer exist.
fn collect_relevant_errors(
    builder: &mut TransitionBuilder<'_>,
    io_request: &FlowIoRequest,
) -> Vec<FlowError> {
    let mut errors = vec![];
    for session_id in requested_sessions(io_request) {
        match builder.current_state.checkpoint.sessions.get_mut(&session_id) {
            None => {
                errors.push(FlowError::new(FlowErrorKind::UnexpectedFlowEnd {
                    message: format!("tried to access ended session {session_id}"),
                }));
            }
            Some(SessionState::Initiating {
                rejection_error: Some(error),
                ..
            }) => {
                errors.push(error.clone());
            }
            Some(SessionState::Initiated {
                peer,
                received_messages,
                other_side_errored,
                ..
            }) => {
                if let Some(ExistingSessionPayload::Error { .. }) = received_messages.first() {
                    let ExistingSessionPayload::Error {
                        flow_exception,
                        error_id,
                    } = received_messages.remove(0)
                    else {
                        unreachable!()
                    };
                    *other_side_errored = true;
                    let kind = match flow_exception {
                        Some(kind) => kind,
                        None => FlowErrorKind::UnexpectedFlowEnd {
                            message: format!("counter-flow on {peer} errored"),
                        },
                    };
                    errors.push(FlowError::with_id(error_id, kind));
                }
            }
            Some(_) => {}
        }
    }
    errors
}

/// Turn every `Uninitiated` session in the request into `Initiating` by
/// emitting its handshake message.
fn send_initial_messages_if_needed(builder: &mut TransitionBuilder<'_>, sessions: &[SessionId]) {
    let suspends = builder.current_state.checkpoint.number_of_suspends;
    let sender_uuid = builder.current_state.sender_uuid;
    let mut index = 0usize;
    for session_id in sessions {
        let Some(session) = builder.current_state.checkpoint.sessions.get(session_id) else {
            builder.fresh_error(FlowErrorKind::Internal {
                message: format!("cannot find session {session_id}"),
            });
            return;
        };
        let SessionState::Uninitiated {
            destination,
            initiating_class,
            initiating_flow_info,
            source_session_id,
            additional_entropy,
        } = session.clone()
        else {
            continue;
        };

        let seed = crate::session::uninitiated_seed(source_session_id, additional_entropy);
        let message = initial_session_message(
            source_session_id,
            additional_entropy,
            &initiating_class,
            &initiating_flow_info,
            None,
        );
        let dedup = SenderDeduplicationId {
            deduplication_id: DeduplicationId::for_normal(&seed, suspends, index),
            sender_uuid,
        };
        index += 1;
        builder.actions.push(Action::SendInitial(SendInitial {
            destination: destination.clone(),
            message,
            dedup,
        }));
        builder.current_state.checkpoint.sessions.insert(
            *session_id,
            SessionState::Initiating {
                destination,
                buffered_messages: vec![],
                rejection_error: None,
                deduplication_seed: seed,
            },
        );
    }
}

/// Route one payload to each target session according to its state:
/// uninitiated sessions fold the payload into their handshake, initiating
/// sessions buffer it, confirmed sessions send directly.
fn send_to_sessions(
    builder: &mut TransitionBuilder<'_>,
    session_to_message: &IndexMap<SessionId, SerializedBytes>,
) {
    let suspends = builder.current_state.checkpoint.number_of_suspends;
    let sender_uuid = builder.current_state.sender_uuid;
    let mut initial = vec![];
    let mut existing = vec![];
    let mut index = 0usize;

    for (session_id, payload) in session_to_message {
        let Some(session) = builder.current_state.checkpoint.sessions.get(session_id) else {
            builder.fresh_error(FlowErrorKind::Internal {
                message: format!("cannot find session {session_id}"),
            });
            return;
        };
        match session.clone() {
            SessionState::Uninitiated {
                destination,
                initiating_class,
                initiating_flow_info,
                source_session_id,
                additional_entropy,
            } => {
                let seed =
                    crate::session::uninitiated_seed(source_session_id, additional_entropy);
                let message = initial_session_message(
                    source_session_id,
                    additional_entropy,
                    &initiating_class,
                    &initiating_flow_info,
                    Some(payload.clone()),
                );
                initial.push(SendInitial {
                    destination: destination.clone(),
                    message,
                    dedup: SenderDeduplicationId {
                        deduplication_id: DeduplicationId::for_normal(&seed, suspends, index),
                        sender_uuid,
                    },
                });
                index += 1;
                builder.current_state.checkpoint.sessions.insert(
                    *session_id,
                    SessionState::Initiating {
                        destination,
                        buffered_messages: vec![],
                        rejection_error: None,
                        deduplication_seed: seed,
                    },
                );
            }
            SessionState::Initiating {
                destination,
                mut buffered_messages,
                rejection_error,
                deduplication_seed,
            } => {
                let dedup = DeduplicationId::for_normal(&deduplication_seed, suspends, index);
                index += 1;
                buffered_messages.push((
                    dedup,
                    ExistingSessionPayload::Data {
                        payload: payload.clone(),
                    },
                ));
                builder.current_state.checkpoint.sessions.insert(
                    *session_id,
                    SessionState::Initiating {
                        destination,
                        buffered_messages,
                        rejection_error,
                        deduplication_seed,
                    },
                );
            }
            SessionState::Initiated {
                peer,
                peer_sink_session_id,
                deduplication_seed,
                ..
            } => {
                existing.push(SendExisting {
                    peer,
                    message: ExistingSessionMessage {
                        recipient_session_id: peer_sink_session_id,
                        payload: ExistingSessionPayload::Data {
                            payload: payload.clone(),
                        },
                    },
                    dedup: SenderDeduplicationId {
                        deduplication_id: DeduplicationId::for_normal(
                            &deduplication_seed,
                            suspends,
                            index,
                        ),
                        sender_uuid,
                    },
                });
                index += 1;
            }
        }
    }

    if !initial.is_empty() || !existing.is_empty() {
        builder
            .actions
            .push(Action::SendMultiple { initial, existing });
    }
}

/// Take one buffered payload per requested session, or report why that is
/// not possible yet.
///
/// Returns `Ok(None)` while any session still waits for data; an error when
/// a session ended where data was expected.
fn poll_session_messages(
    builder: &mut TransitionBuilder<'_>,
    sessions: &[SessionId],
) -> Result<Option<Vec<(SessionId, SerializedBytes)>>, FlowErrorKind> {
    // First pass: decide without mutating, so an incomplete poll leaves
    // every queue intact.
    for session_id in sessions {
        match builder.current_state.checkpoint.sessions.get(session_id) {
            Some(SessionState::Initiated {
                received_messages,
                liveness,
                ..
            }) => match received_messages.first() {
                Some(ExistingSessionPayload::Data { .. }) => {}
                Some(ExistingSessionPayload::End) | None
                    if *liveness == InitiatedSessionState::Ended =>
                {
                    return Err(FlowErrorKind::UnexpectedFlowEnd {
                        message:
                            "received session end message where a data message was expected"
                                .into(),
                    });
                }
                Some(other) => {
                    return Err(FlowErrorKind::Internal {
                        message: format!(
                            "unexpected {} message buffered on session {session_id}",
                            other.kind()
                        ),
                    });
                }
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }

    let mut result = vec![];
    for session_id in sessions {
        let Some(SessionState::Initiated {
            received_messages, ..
        }) = builder.current_state.checkpoint.sessions.get_mut(session_id)
        else {
            unreachable!("checked above");
        };
        let ExistingSessionPayload::Data { payload } = received_messages.remove(0) else {
            unreachable!("checked above");
        };
        result.push((*session_id, payload));
    }
    Ok(Some(result))
}

fn flow_infos_from_sessions(
    builder: &TransitionBuilder<'_>,
    sessions: &[SessionId],
) -> Option<Vec<(SessionId, FlowInfo)>> {
    let mut infos = vec![];
    for session_id in sessions {
        match builder.current_state.checkpoint.sessions.get(session_id) {
            Some(SessionState::Initiated { peer_flow_info, .. }) => {
                infos.push((*session_id, peer_flow_info.clone()));
            }
            _ => return None,
        }
    }
    Some(infos)
}

fn initial_session_message(
    source_session_id: SessionId,
    additional_entropy: u64,
    initiating_class: &str,
    initiating_flow_info: &FlowInfo,
    first_payload: Option<SerializedBytes>,
) -> InitialSessionMessage {
    InitialSessionMessage {
        initiator_session_id: source_session_id,
        initiation_entropy: additional_entropy,
        initiator_flow_class_name: initiating_class.to_owned(),
        flow_version: initiating_flow_info.flow_version,
        app_name: initiating_flow_info.app_name.clone(),
        first_payload,
    }
}

/// Drop sessions whose peer ended them once their buffered data is fully
/// consumed, releasing their routing-table entries.
fn terminate_ended_sessions(mut result: TransitionResult) -> TransitionResult {
    let ended: Vec<SessionId> = result
        .new_state
        .checkpoint
        .sessions
        .iter()
        .filter_map(|(id, session)| match session {
            SessionState::Initiated {
                liveness: InitiatedSessionState::Ended,
                received_messages,
                ..
            } if received_messages.is_empty() => Some(*id),
            _ => None,
        })
        .collect();
    if !ended.is_empty() {
        for id in &ended {
            result.new_state.checkpoint.sessions.shift_remove(id);
        }
        result
            .actions
            .push(Action::RemoveSessionBindings { session_ids: ended });
    }
    result
}
