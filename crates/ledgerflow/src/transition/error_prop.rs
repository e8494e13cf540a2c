//! Error propagation and killed-flow transitions: the two paths that end a
//! flow with a failure.

use nonempty::NonEmpty;

use crate::action::{Action, FlowRemovalReason};
use crate::checkpoint::{ErrorState, StateMachineState};
use crate::error::{FlowError, FlowErrorKind};

use super::{FlowContinuation, TransitionBuilder, TransitionContext, TransitionResult};

/// Relay not-yet-propagated errors to every live session, delete the
/// checkpoint and remove the flow. Only runs once `propagating` is set;
/// re-delivery after completion is a no-op.
pub(crate) fn propagate(
    ctx: &TransitionContext,
    state: &StateMachineState,
) -> TransitionResult {
    let ErrorState::Errored {
        errors,
        propagated_index,
        ..
    } = &state.checkpoint.error_state
    else {
        return TransitionResult::unchanged(state.clone());
    };

    if state.is_removed && *propagated_index == errors.len() {
        return TransitionResult::unchanged(state.clone());
    }

    let to_propagate: Vec<FlowError> = errors.iter().skip(*propagated_index).cloned().collect();
    let all_errors = errors.clone();

    let mut builder = TransitionBuilder::new(ctx, state);
    builder.current_state.checkpoint.error_state = ErrorState::Errored {
        errors: all_errors.clone(),
        propagated_index: errors.len(),
        propagating: true,
    };
    builder.current_state.pending_deduplication_handlers = vec![];
    builder.current_state.is_removed = true;

    remove_with_errors(&mut builder, state, to_propagate, all_errors);
    builder.build(FlowContinuation::Abort)
}

/// Terminal transition for a killed flow: whatever event arrives, tear the
/// flow down, notify sessions and remove storage.
pub(crate) fn killed_flow_transition(
    ctx: &TransitionContext,
    state: &StateMachineState,
) -> TransitionResult {
    if state.is_removed {
        return TransitionResult::unchanged(state.clone());
    }

    let killed = FlowError::new(FlowErrorKind::Killed);
    let mut builder = TransitionBuilder::new(ctx, state);
    builder.current_state.checkpoint.error_state = ErrorState::Errored {
        errors: NonEmpty::new(killed.clone()),
        propagated_index: 1,
        propagating: true,
    };
    builder.current_state.pending_deduplication_handlers = vec![];
    builder.current_state.is_removed = true;

    remove_with_errors(
        &mut builder,
        state,
        vec![killed.clone()],
        NonEmpty::new(killed),
    );
    builder.build(FlowContinuation::Abort)
}

/// Common tail of both failure paths: persist what must survive, notify
/// sessions, release routing state and remove the flow.
fn remove_with_errors(
    builder: &mut TransitionBuilder<'_>,
    starting_state: &StateMachineState,
    to_propagate: Vec<FlowError>,
    all_errors: NonEmpty<FlowError>,
) {
    builder.actions.push(Action::CreateTransaction);
    if starting_state.is_any_checkpoint_persisted {
        builder.actions.push(Action::RemoveCheckpoint {
            flow_id: builder.ctx.flow_id,
        });
    }
    builder.actions.push(Action::PersistDeduplicationFacts {
        handlers: starting_state.pending_deduplication_handlers.clone(),
    });
    builder.actions.push(Action::CommitTransaction);
    builder.actions.push(Action::AcknowledgeMessages {
        handlers: starting_state.pending_deduplication_handlers.clone(),
    });
    builder.actions.push(Action::PropagateErrors {
        errors: to_propagate,
        sessions: starting_state
            .checkpoint
            .sessions
            .values()
            .cloned()
            .collect(),
        sender_uuid: starting_state.sender_uuid,
    });
    builder.actions.push(Action::RemoveSessionBindings {
        session_ids: starting_state.checkpoint.sessions.keys().copied().collect(),
    });
    builder.actions.push(Action::RemoveFlow {
        reason: FlowRemovalReason::ErrorFinish { errors: all_errors },
        last_state: Box::new(builder.current_state.clone()),
    });
}
