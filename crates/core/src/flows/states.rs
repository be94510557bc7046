use serde::{Deserialize, Serialize};

use crate::domain::session::{FieldName, SessionState};

/// What the current turn established about the session, after the extractor
/// patch has been merged and any candidate time has been validated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntakeEvent {
    /// At least one required field is still unset; carries the next field to
    /// prompt for in priority order.
    FieldsRemaining(FieldName),
    /// Every required field holds a validated value.
    FieldsComplete,
    /// A candidate time was extracted but fell outside clinic hours.
    TimeRejected,
    ConfirmAccepted,
    ConfirmRejected,
    ConfirmUnclear,
    CancelRequested,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntakeAction {
    PromptField(FieldName),
    SendHoursNotice,
    SendSummary,
    RepeatYesNo,
    ClearScheduledAt,
    DispatchBooking,
    DeleteSession,
    SendCancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub from: SessionState,
    pub to: SessionState,
    pub event: IntakeEvent,
    pub actions: Vec<IntakeAction>,
}
