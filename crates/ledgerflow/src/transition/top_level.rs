//! Top-level event dispatch: the transition function capable of handling
//! any event.

use crate::action::{Action, SendExisting};
use crate::checkpoint::{ErrorState, FlowState, FlowStatus, SubFlow};
use crate::dedup::{DeduplicationId, SenderDeduplicationId};
use crate::error::{FlowError, FlowErrorKind};
use crate::event::Event;
use crate::ids::{LedgerTransactionId, Party};
use crate::logic::{FlowIoRequest, ResumeValue};
use crate::session::{
    ExistingSessionMessage, ExistingSessionPayload, FlowInfo, InitiatedSessionState, SessionState,
};

use super::{
    deliver, error_prop, started, FlowContinuation, TransitionBuilder, TransitionContext,
    TransitionResult,
};

pub(crate) fn transition(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    event: Event,
) -> TransitionResult {
    if state.is_killed {
        return error_prop::killed_flow_transition(ctx, state);
    }

    match event {
        Event::DoRemainingWork => do_remaining_work(ctx, state),
        Event::DeliverSessionMessage {
            message,
            sender,
            handler,
        } => deliver::transition(ctx, state, message, sender, handler),
        Event::Error(error) => error_transition(ctx, state, error),
        Event::TransactionCommitted(id) => transaction_committed(ctx, state, id),
        Event::SoftShutdown => soft_shutdown(ctx, state),
        Event::StartErrorPropagation => start_error_propagation(ctx, state),
        Event::EnterSubFlow {
            class_name,
            initiating,
            timed,
        } => enter_sub_flow(ctx, state, class_name, initiating, timed),
        Event::LeaveSubFlow => leave_sub_flow(ctx, state),
        Event::Suspend {
            io_request,
            may_skip_checkpoint,
            fiber,
        } => suspend(ctx, state, io_request, may_skip_checkpoint, fiber),
        Event::FlowFinish { result } => flow_finish(ctx, state, result),
        Event::InitiateFlow { destination } => initiate_flow(ctx, state, destination),
        Event::AsyncOperationCompletion(value) => async_operation_completion(ctx, state, value),
        Event::AsyncOperationThrows(kind) => async_operation_throws(ctx, state, kind),
        Event::RetryFlowFromSafePoint => retry_from_safe_point(ctx, state),
        Event::ReloadFlowFromCheckpointAfterSuspend => retry_from_safe_point(ctx, state),
        Event::OvernightObservation => overnight_observation(ctx, state),
        Event::WakeUpFromSleep => wake_up_from_sleep(ctx, state),
        Event::Pause => pause(ctx, state),
    }
}

/// Work-check: route to whatever the flow state needs next. Idempotent:
/// re-delivery with no new external input is a no-op.
fn do_remaining_work(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    match &state.checkpoint.error_state {
        ErrorState::Clean => {
            if state.is_flow_resumed {
                return TransitionResult::unchanged(state.clone());
            }
            match &state.checkpoint.flow_state {
                FlowState::Unstarted { .. } => unstarted_flow(ctx, state),
                FlowState::Started {
                    io_request,
                    frozen_fiber,
                } => started::transition(ctx, state, io_request.clone(), frozen_fiber.clone()),
                FlowState::Finished => TransitionResult::unchanged(state.clone()),
            }
        }
        ErrorState::Errored { propagating, .. } => {
            if *propagating {
                error_prop::propagate(ctx, state)
            } else {
                // Parked: the hospital decides what happens next.
                TransitionResult::unchanged(state.clone())
            }
        }
    }
}

/// First run of a flow: persist the initial checkpoint (unless the start
/// trigger is replayable) and hand control to flow code.
fn unstarted_flow(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);

    if !state.is_any_checkpoint_persisted && !state.is_start_idempotent {
        builder.current_state.pending_deduplication_handlers = vec![];
        builder.current_state.is_any_checkpoint_persisted = true;
        builder.actions.push(Action::CreateTransaction);
        builder.actions.push(Action::PersistCheckpoint {
            flow_id: ctx.flow_id,
            checkpoint: builder.current_state.checkpoint.clone(),
            is_update: false,
        });
        builder.actions.push(Action::PersistDeduplicationFacts {
            handlers: state.pending_deduplication_handlers.clone(),
        });
        builder.actions.push(Action::CommitTransaction);
        builder.actions.push(Action::AcknowledgeMessages {
            handlers: state.pending_deduplication_handlers.clone(),
        });
    }
    builder.actions.push(Action::SignalFlowHasStarted);
    let continuation = builder.resume_flow_logic(ResumeValue::Unit);
    builder.build(continuation)
}

fn error_transition(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    error: FlowError,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    // Close the user transaction if the error interrupted running flow code.
    if state.is_flow_resumed {
        builder.actions.push(Action::RollbackTransaction);
        builder.current_state.is_flow_resumed = false;
    }
    builder.add_error(error);
    builder.build(FlowContinuation::ProcessEvents)
}

fn transaction_committed(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    transaction_id: LedgerTransactionId,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    let waiting_for_this = state.is_waiting_for_future
        && matches!(
            &state.checkpoint.flow_state,
            FlowState::Started {
                io_request: FlowIoRequest::WaitForLedgerCommit { transaction_id: id },
                ..
            } if *id == transaction_id
        );

    if waiting_for_this {
        builder.current_state.is_waiting_for_future = false;
        builder.current_state.future = None;
        if builder.is_errored() {
            return builder.build(FlowContinuation::ProcessEvents);
        }
        let continuation =
            builder.resume_flow_logic(ResumeValue::LedgerTransaction(transaction_id));
        builder.build(continuation)
    } else {
        builder.fresh_error(FlowErrorKind::Internal {
            message: format!("unexpected ledger commit notification for {transaction_id}"),
        });
        builder.build(FlowContinuation::ProcessEvents)
    }
}

/// Leave the checkpoint where it is; the flow resumes at the next restart.
fn soft_shutdown(
    _ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut last_state = state.clone();
    last_state.is_removed = true;
    let session_ids: Vec<_> = state.checkpoint.sessions.keys().copied().collect();
    TransitionResult {
        new_state: last_state.clone(),
        actions: vec![
            Action::RemoveSessionBindings { session_ids },
            Action::RemoveFlow {
                reason: crate::action::FlowRemovalReason::SoftShutdown,
                last_state: Box::new(last_state),
            },
        ],
        continuation: FlowContinuation::Abort,
    }
}

fn start_error_propagation(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    match &state.checkpoint.error_state {
        ErrorState::Clean => {
            builder.fresh_error(FlowErrorKind::Internal {
                message: "error propagation requested on a clean flow".into(),
            });
        }
        ErrorState::Errored {
            errors,
            propagated_index,
            ..
        } => {
            builder.current_state.checkpoint.error_state = ErrorState::Errored {
                errors: errors.clone(),
                propagated_index: *propagated_index,
                propagating: true,
            };
            builder
                .actions
                .push(Action::ScheduleEvent(Event::DoRemainingWork));
        }
    }
    builder.build(FlowContinuation::ProcessEvents)
}

fn enter_sub_flow(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    class_name: String,
    initiating: Option<FlowInfo>,
    timed: bool,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    let had_timed = state.checkpoint.contains_timed_sub_flow();
    let frame = match initiating {
        Some(flow_info) => SubFlow::Initiating {
            class_to_initiate_with: class_name,
            flow_info,
            timed,
        },
        None => SubFlow::Inlined { class_name, timed },
    };
    builder.current_state.checkpoint.sub_flow_stack.push(frame);
    // One scheduled timeout covers every timed frame on the stack.
    if timed && !had_timed {
        builder.actions.push(Action::ScheduleFlowTimeout);
    }
    let continuation = builder.resume_flow_logic(ResumeValue::Unit);
    builder.build(continuation)
}

fn leave_sub_flow(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    if state.checkpoint.sub_flow_stack.len() <= 1 {
        // The top-level frame only leaves with the flow itself.
        builder.fresh_error(FlowErrorKind::Internal {
            message: "attempted to leave the top-level subflow".into(),
        });
        return builder.build(FlowContinuation::ProcessEvents);
    }
    let popped = builder.current_state.checkpoint.sub_flow_stack.pop();
    let popped_timed = popped.as_ref().is_some_and(SubFlow::is_timed);
    if popped_timed && !builder.current_state.checkpoint.contains_timed_sub_flow() {
        builder.actions.push(Action::CancelFlowTimeout);
    }
    let continuation = builder.resume_flow_logic(ResumeValue::Unit);
    builder.build(continuation)
}

/// Flow code suspended: advance the suspension count, capture the request
/// and locals, persist and commit (or just commit when the checkpoint may
/// be skipped), then check for remaining work.
fn suspend(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    io_request: FlowIoRequest,
    may_skip_checkpoint: bool,
    fiber: crate::ids::SerializedBytes,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);

    builder.current_state.checkpoint.number_of_suspends += 1;
    builder.current_state.checkpoint.flow_state = FlowState::Started {
        io_request,
        frozen_fiber: fiber,
    };
    builder.current_state.is_flow_resumed = false;

    if may_skip_checkpoint {
        builder.actions.push(Action::CommitTransaction);
        builder
            .actions
            .push(Action::ScheduleEvent(Event::DoRemainingWork));
    } else {
        builder.current_state.pending_deduplication_handlers = vec![];
        builder.current_state.is_any_checkpoint_persisted = true;
        builder.actions.push(Action::PersistCheckpoint {
            flow_id: ctx.flow_id,
            checkpoint: builder.current_state.checkpoint.clone(),
            is_update: state.is_any_checkpoint_persisted,
        });
        builder.actions.push(Action::PersistDeduplicationFacts {
            handlers: state.pending_deduplication_handlers.clone(),
        });
        builder.actions.push(Action::CommitTransaction);
        builder.actions.push(Action::AcknowledgeMessages {
            handlers: state.pending_deduplication_handlers.clone(),
        });
        let next = if ctx.config.reload_checkpoint_after_suspend {
            Event::ReloadFlowFromCheckpointAfterSuspend
        } else {
            Event::DoRemainingWork
        };
        builder.actions.push(Action::ScheduleEvent(next));
    }

    builder.build(FlowContinuation::ProcessEvents)
}

fn flow_finish(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    result: serde_json::Value,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    match &state.checkpoint.error_state {
        ErrorState::Clean => {
            builder.current_state.checkpoint.number_of_suspends += 1;
            builder.current_state.checkpoint.flow_state = FlowState::Finished;
            builder.current_state.checkpoint.status = FlowStatus::Completed;
            builder.current_state.pending_deduplication_handlers = vec![];
            builder.current_state.is_flow_resumed = false;
            builder.current_state.is_removed = true;

            if state.is_any_checkpoint_persisted {
                builder.actions.push(Action::RemoveCheckpoint {
                    flow_id: ctx.flow_id,
                });
            }
            builder.actions.push(Action::PersistDeduplicationFacts {
                handlers: state.pending_deduplication_handlers.clone(),
            });
            builder.actions.push(Action::ReleaseSoftLocks {
                lock_id: Some(*ctx.flow_id.uuid()),
            });
            builder.actions.push(Action::CommitTransaction);
            builder.actions.push(Action::AcknowledgeMessages {
                handlers: state.pending_deduplication_handlers.clone(),
            });

            let session_ids: Vec<_> = builder
                .current_state
                .checkpoint
                .sessions
                .keys()
                .copied()
                .collect();
            let end_messages = end_session_messages(&builder.current_state);
            builder
                .actions
                .push(Action::RemoveSessionBindings { session_ids });
            builder.actions.push(Action::RemoveFlow {
                reason: crate::action::FlowRemovalReason::OrderlyFinish { result },
                last_state: Box::new(builder.current_state.clone()),
            });
            for send in end_messages {
                builder.actions.push(Action::SendExisting(send));
            }
            builder.build(FlowContinuation::Abort)
        }
        ErrorState::Errored { .. } => {
            builder.current_state.is_flow_resumed = false;
            builder.actions.push(Action::RollbackTransaction);
            builder.build(FlowContinuation::ProcessEvents)
        }
    }
}

/// End-of-session notifications for every confirmed live session, keyed by
/// the post-finish suspension count so retries replay identically.
fn end_session_messages(state: &crate::checkpoint::StateMachineState) -> Vec<SendExisting> {
    let checkpoint = &state.checkpoint;
    checkpoint
        .sessions
        .values()
        .enumerate()
        .filter_map(|(index, session)| match session {
            SessionState::Initiated {
                peer,
                peer_sink_session_id,
                liveness: InitiatedSessionState::Live,
                deduplication_seed,
                ..
            } => Some(SendExisting {
                peer: peer.clone(),
                message: ExistingSessionMessage {
                    recipient_session_id: *peer_sink_session_id,
                    payload: ExistingSessionPayload::End,
                },
                dedup: SenderDeduplicationId {
                    deduplication_id: DeduplicationId::for_normal(
                        deduplication_seed,
                        checkpoint.number_of_suspends,
                        index,
                    ),
                    sender_uuid: state.sender_uuid,
                },
            }),
            _ => None,
        })
        .collect()
}

/// Create a new session handle towards `destination`, derived from the
/// innermost initiating subflow frame.
fn initiate_flow(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    destination: Party,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    let Some(SubFlow::Initiating {
        class_to_initiate_with,
        flow_info,
        ..
    }) = state.checkpoint.closest_initiating_sub_flow().cloned()
    else {
        builder.fresh_error(FlowErrorKind::Internal {
            message: "session initiation outside an initiating subflow".into(),
        });
        return builder.build(FlowContinuation::ProcessEvents);
    };

    let source_session_id = crate::ids::SessionId::random();
    let additional_entropy: u64 = rand::random();
    builder.current_state.checkpoint.sessions.insert(
        source_session_id,
        SessionState::Uninitiated {
            destination,
            initiating_class: class_to_initiate_with,
            initiating_flow_info: flow_info,
            source_session_id,
            additional_entropy,
        },
    );
    builder.actions.push(Action::AddSessionBinding {
        session_id: source_session_id,
    });
    let continuation = builder.resume_flow_logic(ResumeValue::Session(source_session_id));
    builder.build(continuation)
}

fn async_operation_completion(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    value: serde_json::Value,
) -> TransitionResult {
    if !state.is_waiting_for_future {
        return TransitionResult::unchanged(state.clone());
    }
    let mut builder = TransitionBuilder::new(ctx, state);
    builder.current_state.is_waiting_for_future = false;
    builder.current_state.future = None;
    let continuation = builder.resume_flow_logic(ResumeValue::AsyncResult(value));
    builder.build(continuation)
}

fn async_operation_throws(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
    kind: FlowErrorKind,
) -> TransitionResult {
    if !state.is_waiting_for_future {
        return TransitionResult::unchanged(state.clone());
    }
    let mut builder = TransitionBuilder::new(ctx, state);
    builder.current_state.is_waiting_for_future = false;
    builder.current_state.future = None;
    let continuation = builder.throw_into_flow(FlowError::new(kind));
    builder.build(continuation)
}

fn retry_from_safe_point(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    builder.actions.push(Action::RetryFlowFromSafePoint);
    builder.build(FlowContinuation::Abort)
}

/// Keep the flow in the hospital: mark the checkpoint `Hospitalized` so it
/// retries automatically at the next restart, persisting only the
/// flow-start deduplication facts so the start trigger is not re-consumed.
fn overnight_observation(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);

    let (start_handlers, other_handlers): (Vec<_>, Vec<_>) = state
        .pending_deduplication_handlers
        .iter()
        .cloned()
        .partition(|handler| handler.is_flow_start());

    builder.current_state.checkpoint.status = FlowStatus::Hospitalized;
    builder.current_state.pending_deduplication_handlers = other_handlers;
    builder.current_state.is_any_checkpoint_persisted = true;

    builder.actions.push(Action::CreateTransaction);
    builder.actions.push(Action::PersistDeduplicationFacts {
        handlers: start_handlers.clone(),
    });
    builder.actions.push(Action::PersistCheckpoint {
        flow_id: ctx.flow_id,
        checkpoint: builder.current_state.checkpoint.clone(),
        is_update: state.is_any_checkpoint_persisted,
    });
    builder.actions.push(Action::CommitTransaction);
    builder.actions.push(Action::AcknowledgeMessages {
        handlers: start_handlers,
    });
    builder.build(FlowContinuation::ProcessEvents)
}

fn wake_up_from_sleep(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let sleeping = matches!(
        &state.checkpoint.flow_state,
        FlowState::Started {
            io_request: FlowIoRequest::Sleep { .. },
            ..
        }
    );
    if !sleeping {
        return TransitionResult::unchanged(state.clone());
    }
    let mut builder = TransitionBuilder::new(ctx, state);
    builder.current_state.is_waiting_for_future = false;
    builder.current_state.future = None;
    let continuation = builder.resume_flow_logic(ResumeValue::Unit);
    builder.build(continuation)
}

fn pause(
    ctx: &TransitionContext,
    state: &crate::checkpoint::StateMachineState,
) -> TransitionResult {
    let mut builder = TransitionBuilder::new(ctx, state);
    if !state.is_flow_resumed {
        builder.actions.push(Action::CreateTransaction);
    }
    builder.current_state.checkpoint.status = FlowStatus::Paused;
    builder.actions.push(Action::UpdateFlowStatus {
        flow_id: ctx.flow_id,
        status: FlowStatus::Paused,
    });
    builder.actions.push(Action::CommitTransaction);
    builder.actions.push(Action::MoveFlowToPaused {
        last_state: Box::new(builder.current_state.clone()),
    });
    builder.build(FlowContinuation::Abort)
}
