pub mod engine;
pub mod states;

pub use engine::{FlowTransitionError, IntakeFlow};
pub use states::{IntakeAction, IntakeEvent, TransitionOutcome};
