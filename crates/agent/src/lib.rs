//! Intake Runtime - extractor integration and turn orchestration
//!
//! This crate is the asynchronous half of the booking engine:
//! - Wraps the external text-to-fields service behind `FieldExtractor`
//! - Performs the external booking side effect behind `BookingDispatcher`
//! - Drives one conversational turn end to end (`runtime`): load session,
//!   classify, extract and merge, apply the flow transition, dispatch on the
//!   confirmation edge, save with compare-and-swap
//!
//! # Safety Principle
//!
//! The LLM is strictly a translator. It proposes raw field values and
//! nothing else; validation, state transitions and the dispatch decision are
//! deterministic and live in `frontdesk-core`.

pub mod dispatch;
pub mod extractor;
pub mod llm;
pub mod runtime;

pub use dispatch::{BookingDispatcher, DispatchAck, DispatchError, NoopDispatcher};
pub use extractor::{ExtractError, FieldExtractor, LlmFieldExtractor};
pub use llm::{HttpLlmClient, LlmClient};
pub use runtime::{InboundMessage, IntakeRuntime, RuntimeConfig};
