use thiserror::Error;

use crate::domain::session::{FieldName, SessionState};
use crate::flows::states::{IntakeAction, IntakeEvent, TransitionOutcome};

/// The slot-filling booking flow. Pure transition table: the async runtime
/// decides which [`IntakeEvent`] a turn produced, this engine decides where
/// the session goes and which actions the runtime must perform.
#[derive(Clone, Debug, Default)]
pub struct IntakeFlow;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: SessionState, event: IntakeEvent },
}

impl IntakeFlow {
    pub fn initial_state(&self) -> SessionState {
        SessionState::New
    }

    pub fn apply(
        &self,
        current: SessionState,
        event: IntakeEvent,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        use IntakeAction::{
            ClearScheduledAt, DeleteSession, DispatchBooking, PromptField, RepeatYesNo,
            SendCancelled, SendHoursNotice, SendSummary,
        };
        use IntakeEvent::{
            CancelRequested, ConfirmAccepted, ConfirmRejected, ConfirmUnclear, FieldsComplete,
            FieldsRemaining, TimeRejected,
        };
        use SessionState::{AwaitingConfirmation, Cancelled, Collecting, Confirmed, New};

        let (to, actions) = match (current, event) {
            (New | Collecting, FieldsRemaining(next)) => (Collecting, vec![PromptField(next)]),
            (New | Collecting, TimeRejected) => (Collecting, vec![SendHoursNotice]),
            (New | Collecting, FieldsComplete) => (AwaitingConfirmation, vec![SendSummary]),
            (AwaitingConfirmation, ConfirmAccepted) => {
                (Confirmed, vec![DispatchBooking, DeleteSession])
            }
            (AwaitingConfirmation, ConfirmRejected) => {
                (Collecting, vec![ClearScheduledAt, PromptField(FieldName::ScheduledAt)])
            }
            (AwaitingConfirmation, ConfirmUnclear) => (AwaitingConfirmation, vec![RepeatYesNo]),
            (New | Collecting | AwaitingConfirmation, CancelRequested) => {
                (Cancelled, vec![SendCancelled, DeleteSession])
            }
            (state, event) => {
                return Err(FlowTransitionError::InvalidTransition { state, event });
            }
        };

        Ok(TransitionOutcome { from: current, to, event, actions })
    }
}
