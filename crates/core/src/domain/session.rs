use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsultType {
    Opd,
    Video,
}

impl ConsultType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Opd => "in-clinic (OPD)",
            Self::Video => "video consult",
        }
    }
}

impl std::str::FromStr for ConsultType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "opd" | "clinic" | "in-clinic" | "in person" | "offline" => Ok(Self::Opd),
            "video" | "online" | "teleconsult" => Ok(Self::Video),
            _ => Err(()),
        }
    }
}

/// Field keys the extractor may propose. The first four are required for a
/// booking and double as the fixed prompt priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    PatientName,
    ScheduledAt,
    Reason,
    ContactPhone,
    ConsultType,
}

impl FieldName {
    pub const REQUIRED: [FieldName; 4] =
        [Self::PatientName, Self::ScheduledAt, Self::Reason, Self::ContactPhone];

    pub fn key(&self) -> &'static str {
        match self {
            Self::PatientName => "patient_name",
            Self::ScheduledAt => "scheduled_at",
            Self::Reason => "reason",
            Self::ContactPhone => "contact_phone",
            Self::ConsultType => "consult_type",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFields {
    pub patient_name: Option<String>,
    pub contact_phone: Option<String>,
    pub reason: Option<String>,
    pub consult_type: Option<ConsultType>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl BookingFields {
    pub fn is_set(&self, field: FieldName) -> bool {
        match field {
            FieldName::PatientName => self.patient_name.is_some(),
            FieldName::ScheduledAt => self.scheduled_at.is_some(),
            FieldName::Reason => self.reason.is_some(),
            FieldName::ContactPhone => self.contact_phone.is_some(),
            FieldName::ConsultType => self.consult_type.is_some(),
        }
    }

    /// First unset required field in prompt priority order.
    pub fn first_missing(&self) -> Option<FieldName> {
        FieldName::REQUIRED.into_iter().find(|field| !self.is_set(*field))
    }

    pub fn is_complete(&self) -> bool {
        self.first_missing().is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    New,
    Collecting,
    AwaitingConfirmation,
    Confirmed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: UserId,
    pub fields: BookingFields,
    pub state: SessionState,
    /// Re-prompt attempts for the field currently being collected; reset
    /// whenever the pending field changes.
    pub attempts: u8,
    pub pending_field: Option<FieldName>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Compare-and-swap token. A fresh session starts at zero; the store
    /// bumps it on every successful upsert.
    pub version: u64,
}

impl Session {
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            fields: BookingFields::default(),
            state: SessionState::New,
            attempts: 0,
            pending_field: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::{AwaitingConfirmation, Cancelled, Collecting, Confirmed, New};

        matches!(
            (self.state, next),
            (New, Collecting)
                | (New, AwaitingConfirmation)
                | (Collecting, Collecting)
                | (Collecting, AwaitingConfirmation)
                | (AwaitingConfirmation, Confirmed)
                | (AwaitingConfirmation, Collecting)
                | (AwaitingConfirmation, AwaitingConfirmation)
                | (New, Cancelled)
                | (Collecting, Cancelled)
                | (AwaitingConfirmation, Cancelled)
        )
    }

    pub fn transition_to(&mut self, next: SessionState) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            self.state = next;
            return Ok(());
        }

        Err(DomainError::InvalidSessionTransition { from: self.state, to: next })
    }

    /// Marks the named field as the one currently being prompted for,
    /// counting repeat prompts against the re-prompt cap.
    pub fn note_prompt(&mut self, field: FieldName) {
        if self.pending_field == Some(field) {
            self.attempts = self.attempts.saturating_add(1);
        } else {
            self.pending_field = Some(field);
            self.attempts = 1;
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    pub fn is_idle_expired(&self, now: DateTime<Utc>, idle: chrono::Duration) -> bool {
        now.signed_duration_since(self.updated_at) > idle
    }
}
