pub mod classify;
pub mod config;
pub mod domain;
pub mod errors;
pub mod fields;
pub mod flows;
pub mod hours;
pub mod replies;

pub use classify::MessageKind;
pub use domain::booking::ConfirmedBooking;
pub use domain::session::{BookingFields, ConsultType, FieldName, Session, SessionState, UserId};
pub use errors::DomainError;
pub use fields::{FieldPatch, MergeOutcome};
pub use flows::engine::{FlowTransitionError, IntakeFlow};
pub use flows::states::{IntakeAction, IntakeEvent, TransitionOutcome};
pub use hours::ClinicHours;
pub use replies::Reply;
