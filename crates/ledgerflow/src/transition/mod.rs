//! The pure transition engine.
//!
//! Given the current [`StateMachineState`] and an [`Event`], produce a
//! [`TransitionResult`]: the next state, the side effects to run, and how
//! to continue. Deciding happens here and only here; executing happens in
//! the action executor. Transitions touch no storage and no network, which
//! is what makes them testable in isolation.

mod deliver;
mod error_prop;
mod started;
mod top_level;

use std::sync::Arc;

use crate::action::Action;
use crate::checkpoint::StateMachineState;
use crate::config::StateMachineConfig;
use crate::error::{FlowError, FlowErrorKind};
use crate::event::Event;
use crate::ids::FlowId;
use crate::logic::ResumeValue;

/// How the fiber should proceed after executing a transition's actions.
#[derive(Debug)]
pub enum FlowContinuation {
    /// Keep draining the event queue.
    ProcessEvents,
    /// Hand control back to flow code with the given value.
    Resume(ResumeValue),
    /// Deliver an error into flow code at its suspension point.
    Throw(FlowError),
    /// Stop processing events; the flow is leaving the manager (removal,
    /// retry replacement, pause or death).
    Abort,
}

/// Output of the transition function.
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: StateMachineState,
    pub actions: Vec<Action>,
    pub continuation: FlowContinuation,
}

impl TransitionResult {
    /// A no-op transition: unchanged state, no actions.
    pub fn unchanged(state: StateMachineState) -> Self {
        Self {
            new_state: state,
            actions: vec![],
            continuation: FlowContinuation::ProcessEvents,
        }
    }
}

/// Per-flow context threaded through every transition.
#[derive(Clone)]
pub struct TransitionContext {
    pub flow_id: FlowId,
    pub config: Arc<StateMachineConfig>,
}

/// The transition function for one flow.
#[derive(Clone)]
pub struct StateMachine {
    pub context: TransitionContext,
}

impl StateMachine {
    pub fn new(flow_id: FlowId, config: Arc<StateMachineConfig>) -> Self {
        Self {
            context: TransitionContext { flow_id, config },
        }
    }

    /// Compute the transition for `event` from `state`.
    pub fn transition(&self, state: &StateMachineState, event: Event) -> TransitionResult {
        top_level::transition(&self.context, state, event)
    }
}

/// Mutable scaffolding for composing a transition.
pub(crate) struct TransitionBuilder<'a> {
    pub ctx: &'a TransitionContext,
    /// Whether control was already with flow code when the event arrived.
    starting_resumed: bool,
    pub current_state: StateMachineState,
    pub actions: Vec<Action>,
}

impl<'a> TransitionBuilder<'a> {
    pub fn new(ctx: &'a TransitionContext, starting_state: &StateMachineState) -> Self {
        Self {
            ctx,
            starting_resumed: starting_state.is_flow_resumed,
            current_state: starting_state.clone(),
            actions: vec![],
        }
    }

    /// Hand control back to flow code. Opens the flow's transaction when
    /// control is returning from a suspension (as opposed to events
    /// processed synchronously while flow code is already running).
    pub fn resume_flow_logic(&mut self, value: ResumeValue) -> FlowContinuation {
        if !self.starting_resumed {
            self.actions.push(Action::CreateTransaction);
        }
        self.current_state.is_flow_resumed = true;
        FlowContinuation::Resume(value)
    }

    /// Deliver an error into flow code, with the same transaction handling
    /// as a resume.
    pub fn throw_into_flow(&mut self, error: FlowError) -> FlowContinuation {
        if !self.starting_resumed {
            self.actions.push(Action::CreateTransaction);
        }
        self.current_state.is_flow_resumed = true;
        FlowContinuation::Throw(error)
    }

    /// Fold a fresh error into the flow's error state.
    pub fn fresh_error(&mut self, kind: FlowErrorKind) {
        self.add_error(FlowError::new(kind));
    }

    /// Fold an existing error (stable id) into the flow's error state.
    pub fn add_error(&mut self, error: FlowError) {
        let error_state = std::mem::replace(
            &mut self.current_state.checkpoint.error_state,
            crate::checkpoint::ErrorState::Clean,
        );
        self.current_state.checkpoint.error_state = error_state.add_errors(vec![error]);
    }

    pub fn is_errored(&self) -> bool {
        self.current_state.checkpoint.error_state.is_errored()
    }

    pub fn build(self, continuation: FlowContinuation) -> TransitionResult {
        TransitionResult {
            new_state: self.current_state,
            actions: self.actions,
            continuation,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures for transition unit tests.

    use std::sync::Arc;

    use crate::checkpoint::{
        Checkpoint, FlowStart, InvocationContext, StateMachineState, SubFlow,
    };
    use crate::config::StateMachineConfig;
    use crate::ids::{Party, SerializedBytes};
    use crate::logic::{logic_handle, FlowLogic, FlowYield, ResumeValue};
    use crate::session::FlowInfo;

    use super::StateMachine;

    /// Logic stub for transitions that never resume user code.
    pub struct InertLogic;

    impl FlowLogic for InertLogic {
        fn resume(&mut self, _value: ResumeValue) -> FlowYield {
            FlowYield::Finish {
                result: serde_json::Value::Null,
            }
        }

        fn snapshot(&self) -> SerializedBytes {
            SerializedBytes::new(vec![])
        }
    }

    pub fn test_flow_info() -> FlowInfo {
        FlowInfo {
            flow_version: 1,
            app_name: "settlement".into(),
        }
    }

    pub fn initiating_checkpoint() -> Checkpoint {
        Checkpoint::new(
            InvocationContext::rpc("tester"),
            Party::new("O=Us"),
            SubFlow::Initiating {
                class_to_initiate_with: "app.Settle".into(),
                flow_info: test_flow_info(),
                timed: false,
            },
            FlowStart::Explicit,
            SerializedBytes::new(vec![0]),
        )
    }

    pub fn test_state(checkpoint: Checkpoint) -> StateMachineState {
        StateMachineState::new(
            checkpoint,
            logic_handle(Box::new(InertLogic)),
            None,
            false,
            false,
            Some(uuid::Uuid::new_v4()),
        )
    }

    pub fn test_machine() -> StateMachine {
        StateMachine::new(
            crate::ids::FlowId::random(),
            Arc::new(StateMachineConfig::default()),
        )
    }
}
