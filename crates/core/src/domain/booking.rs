use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{ConsultType, Session, UserId};
use crate::errors::DomainError;

/// Snapshot of a fully collected session, handed to the dispatcher on the
/// confirmation edge. Construction fails if any required field is unset, so
/// a dispatcher never sees a partial booking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedBooking {
    pub user_id: UserId,
    pub patient_name: String,
    pub contact_phone: String,
    pub reason: String,
    pub consult_type: Option<ConsultType>,
    pub scheduled_at: DateTime<Utc>,
    /// Idempotency key for sinks that support one: stable for a given
    /// confirmed session, distinct across re-bookings by the same user.
    pub booking_key: String,
}

impl TryFrom<&Session> for ConfirmedBooking {
    type Error = DomainError;

    fn try_from(session: &Session) -> Result<Self, Self::Error> {
        let missing = |field: &str| {
            DomainError::InvariantViolation(format!(
                "session for {} reached confirmation without {field}",
                session.user_id.0
            ))
        };

        Ok(Self {
            user_id: session.user_id.clone(),
            patient_name: session.fields.patient_name.clone().ok_or_else(|| missing("name"))?,
            contact_phone: session.fields.contact_phone.clone().ok_or_else(|| missing("phone"))?,
            reason: session.fields.reason.clone().ok_or_else(|| missing("reason"))?,
            consult_type: session.fields.consult_type,
            scheduled_at: session.fields.scheduled_at.ok_or_else(|| missing("scheduled time"))?,
            booking_key: format!("{}#{}", session.user_id.0, session.created_at.timestamp()),
        })
    }
}
