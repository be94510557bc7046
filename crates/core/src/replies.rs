use crate::domain::booking::ConfirmedBooking;
use crate::domain::session::{BookingFields, FieldName};
use crate::hours::ClinicHours;

/// The single plain-text reply a turn produces. Every path through the state
/// machine ends in exactly one of these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
}

impl Reply {
    fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

pub fn menu() -> Reply {
    Reply::new(
        "Hello! This is the clinic front desk. I can book an appointment for you - \
         just tell me the patient's name, a preferred date and time, the reason for \
         the visit, and a contact phone number. You can also send everything in one \
         message.",
    )
}

pub fn prompt(field: FieldName) -> Reply {
    let text = match field {
        FieldName::PatientName => "May I have the patient's full name?",
        FieldName::ScheduledAt => {
            "What date and time would you prefer for the appointment? For example: 26 Jan 3pm."
        }
        FieldName::Reason => "What is the reason for the visit?",
        FieldName::ContactPhone => "Which phone number should we use to reach you?",
        FieldName::ConsultType => "Would you prefer an in-clinic visit or a video consult?",
    };
    Reply::new(text)
}

pub fn hours_notice(hours: &ClinicHours) -> Reply {
    Reply::new(format!(
        "That time is outside our consultation hours ({}). Could you pick another slot?",
        hours.describe()
    ))
}

pub fn summary(fields: &BookingFields, hours: &ClinicHours) -> Reply {
    let name = fields.patient_name.as_deref().unwrap_or("-");
    let phone = fields.contact_phone.as_deref().unwrap_or("-");
    let reason = fields.reason.as_deref().unwrap_or("-");
    let when = fields
        .scheduled_at
        .map(|at| at.with_timezone(&hours.offset()).format("%a %-d %b, %-I:%M%P").to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut text = format!(
        "Here is what I have:\n- Patient: {name}\n- When: {when}\n- Reason: {reason}\n- Phone: {phone}"
    );
    if let Some(consult_type) = fields.consult_type {
        text.push_str(&format!("\n- Visit type: {}", consult_type.label()));
    }
    text.push_str("\n\nShall I confirm this appointment? Please reply yes or no.");
    Reply::new(text)
}

pub fn yes_no_reprompt() -> Reply {
    Reply::new("Sorry, I didn't catch that. Should I confirm the appointment? Please reply yes or no.")
}

pub fn confirmed(booking: &ConfirmedBooking, hours: &ClinicHours) -> Reply {
    let when =
        booking.scheduled_at.with_timezone(&hours.offset()).format("%a %-d %b at %-I:%M%P");
    Reply::new(format!(
        "Done! {}'s appointment is booked for {when}. We'll see you then.",
        booking.patient_name
    ))
}

pub fn dispatch_failed() -> Reply {
    Reply::new(
        "We hit a technical issue while booking your appointment, so it is not confirmed \
         yet. Please reply yes to try again.",
    )
}

pub fn apology(field: Option<FieldName>) -> Reply {
    let follow_up = field.map(prompt).map(|reply| reply.text).unwrap_or_default();
    let text = if follow_up.is_empty() {
        "Sorry, something went wrong on our side. Could you send that again?".to_string()
    } else {
        format!("Sorry, something went wrong on our side. {follow_up}")
    };
    Reply::new(text)
}

pub fn handoff() -> Reply {
    Reply::new(
        "I'm having trouble understanding. I've asked our front-desk staff to follow up \
         with you directly - or you can call the clinic during consultation hours.",
    )
}

pub fn already_confirmed() -> Reply {
    Reply::new(
        "Your appointment is already confirmed - no need to reply again. Message me if you \
         want to book another visit.",
    )
}

pub fn cancelled() -> Reply {
    Reply::new("No problem, I've cancelled this booking request. Message me anytime to start over.")
}
