use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::time::timeout;
use tracing::{info, warn};

use frontdesk_core::config::AppConfig;
use frontdesk_core::{
    classify, fields, replies, ClinicHours, ConfirmedBooking, FieldName, IntakeAction,
    IntakeEvent, IntakeFlow, MessageKind, Reply, Session, SessionState, UserId,
};
use frontdesk_store::{SessionStore, StoreError};

use crate::dispatch::{BookingDispatcher, DispatchError};
use crate::extractor::{ExtractError, FieldExtractor};

/// One inbound user message as delivered by the channel boundary. Delivery
/// is at-least-once; `message_id` identifies redeliveries for logging.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub user_id: UserId,
    pub raw_text: String,
    pub message_id: String,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub extract_timeout: StdDuration,
    pub dispatch_timeout: StdDuration,
    pub reprompt_cap: u8,
    pub session_idle: Duration,
    pub max_turn_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            extract_timeout: StdDuration::from_secs(20),
            dispatch_timeout: StdDuration::from_secs(10),
            reprompt_cap: 3,
            session_idle: Duration::minutes(30),
            max_turn_retries: 3,
        }
    }
}

impl RuntimeConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            extract_timeout: StdDuration::from_secs(config.llm.timeout_secs),
            dispatch_timeout: StdDuration::from_secs(config.dispatch.timeout_secs),
            reprompt_cap: config.clinic.reprompt_cap,
            session_idle: Duration::seconds(config.clinic.session_idle_secs as i64),
            ..Self::default()
        }
    }
}

enum TurnFailure {
    /// Lost the compare-and-swap; the whole step is replayed against the
    /// fresh session so the user's message is never silently dropped.
    Conflict,
    Fatal(StoreError),
}

impl From<StoreError> for TurnFailure {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict { .. } => Self::Conflict,
            other => Self::Fatal(other),
        }
    }
}

/// Drives one conversational turn end to end. Every inbound message yields
/// exactly one reply; no internal failure short of store corruption ends
/// the conversation.
pub struct IntakeRuntime<S, E, D> {
    store: S,
    extractor: E,
    dispatcher: D,
    hours: ClinicHours,
    flow: IntakeFlow,
    config: RuntimeConfig,
}

impl<S, E, D> IntakeRuntime<S, E, D>
where
    S: SessionStore,
    E: FieldExtractor,
    D: BookingDispatcher,
{
    pub fn new(
        store: S,
        extractor: E,
        dispatcher: D,
        hours: ClinicHours,
        config: RuntimeConfig,
    ) -> Self {
        Self { store, extractor, dispatcher, hours, flow: IntakeFlow, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn handle_message(&self, message: &InboundMessage) -> Result<Reply, StoreError> {
        for attempt in 0..self.config.max_turn_retries {
            match self.try_turn(message, Utc::now()).await {
                Ok(reply) => return Ok(reply),
                Err(TurnFailure::Conflict) => {
                    warn!(
                        event_name = "turn.store_conflict_retry",
                        correlation_id = %message.message_id,
                        user_id = %message.user_id.0,
                        attempt,
                        "lost session compare-and-swap; replaying turn"
                    );
                }
                Err(TurnFailure::Fatal(error)) => return Err(error),
            }
        }

        warn!(
            event_name = "turn.retries_exhausted",
            correlation_id = %message.message_id,
            user_id = %message.user_id.0,
            "turn kept losing the compare-and-swap; degrading to apology"
        );
        Ok(replies::apology(None))
    }

    async fn try_turn(
        &self,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<Reply, TurnFailure> {
        let kind = classify::classify(&message.raw_text);
        let existing = self.load_active(&message.user_id, now).await?;

        if let Some(session) = &existing {
            // A Confirmed session only exists inside the dispatch window of
            // another worker; the duplicate must not dispatch again.
            if session.state == SessionState::Confirmed {
                return Ok(replies::already_confirmed());
            }
        }

        let awaiting = existing.as_ref().map(|session| session.state)
            == Some(SessionState::AwaitingConfirmation);

        match kind {
            MessageKind::Greeting if !awaiting => Ok(replies::menu()),
            MessageKind::Cancel => self.cancel_turn(existing, message).await,
            _ => {
                let session = existing
                    .unwrap_or_else(|| Session::new(message.user_id.clone(), now));
                if session.state == SessionState::AwaitingConfirmation {
                    self.confirmation_turn(session, kind, message, now).await
                } else {
                    self.collection_turn(session, message, now).await
                }
            }
        }
    }

    async fn load_active(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, TurnFailure> {
        let Some(session) = self.store.get(user_id).await.map_err(TurnFailure::Fatal)? else {
            return Ok(None);
        };

        let stale = session.state == SessionState::Cancelled
            || session.is_idle_expired(now, self.config.session_idle);
        if stale {
            self.store.delete(user_id).await.map_err(TurnFailure::Fatal)?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    async fn cancel_turn(
        &self,
        existing: Option<Session>,
        message: &InboundMessage,
    ) -> Result<Reply, TurnFailure> {
        if let Some(session) = existing {
            // Transition is validated even though the session is deleted, so
            // the flow graph stays the single source of truth.
            if self.flow.apply(session.state, IntakeEvent::CancelRequested).is_ok() {
                self.store.delete(&session.user_id).await.map_err(TurnFailure::Fatal)?;
                info!(
                    event_name = "turn.booking_cancelled",
                    correlation_id = %message.message_id,
                    user_id = %session.user_id.0,
                    "booking request cancelled by user"
                );
            }
        }
        Ok(replies::cancelled())
    }

    async fn collection_turn(
        &self,
        mut session: Session,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<Reply, TurnFailure> {
        let known = known_fields(&session);
        let patch = match timeout(
            self.config.extract_timeout,
            self.extractor.extract(&message.raw_text, &known),
        )
        .await
        {
            Ok(Ok(patch)) => patch,
            Ok(Err(error)) => return Ok(self.extraction_apology(&session, message, error)),
            Err(_elapsed) => {
                return Ok(self.extraction_apology(&session, message, ExtractError::Timeout));
            }
        };

        let merge = fields::apply_patch(&mut session.fields, &patch, &self.hours);
        let event = if merge.time_rejected {
            IntakeEvent::TimeRejected
        } else if session.fields.is_complete() {
            IntakeEvent::FieldsComplete
        } else {
            // first_missing is Some by the is_complete check above.
            match session.fields.first_missing() {
                Some(next) => IntakeEvent::FieldsRemaining(next),
                None => IntakeEvent::FieldsComplete,
            }
        };

        let Ok(outcome) = self.flow.apply(session.state, event) else {
            warn!(
                event_name = "turn.unexpected_flow_rejection",
                correlation_id = %message.message_id,
                user_id = %session.user_id.0,
                state = ?session.state,
                turn_event = ?event,
                "collection event rejected by flow engine"
            );
            return Ok(replies::apology(session.fields.first_missing()));
        };

        if session.transition_to(outcome.to).is_err() {
            return Ok(replies::apology(session.fields.first_missing()));
        }

        let mut reply = replies::apology(None);
        for action in &outcome.actions {
            match action {
                IntakeAction::PromptField(field) => {
                    session.note_prompt(*field);
                    reply = if session.attempts > self.config.reprompt_cap {
                        info!(
                            event_name = "turn.handoff_cap_reached",
                            correlation_id = %message.message_id,
                            user_id = %session.user_id.0,
                            field = field.key(),
                            attempts = session.attempts,
                            "re-prompt cap reached; escalating to staff handoff"
                        );
                        replies::handoff()
                    } else {
                        replies::prompt(*field)
                    };
                }
                IntakeAction::SendHoursNotice => reply = replies::hours_notice(&self.hours),
                IntakeAction::SendSummary => {
                    session.pending_field = None;
                    session.attempts = 0;
                    reply = replies::summary(&session.fields, &self.hours);
                }
                _ => {}
            }
        }

        session.touch(now);
        self.store.upsert(session).await?;
        Ok(reply)
    }

    async fn confirmation_turn(
        &self,
        mut session: Session,
        kind: MessageKind,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<Reply, TurnFailure> {
        match kind {
            MessageKind::Affirmative => self.dispatch_turn(session, message, now).await,
            MessageKind::Negative => {
                // Reject-confirmation edge: only the time is cleared; name,
                // reason and phone stay captured.
                let Ok(outcome) =
                    self.flow.apply(session.state, IntakeEvent::ConfirmRejected)
                else {
                    return Ok(replies::apology(None));
                };
                if session.transition_to(outcome.to).is_err() {
                    return Ok(replies::apology(None));
                }

                let mut reply = replies::prompt(FieldName::ScheduledAt);
                for action in &outcome.actions {
                    match action {
                        IntakeAction::ClearScheduledAt => session.fields.scheduled_at = None,
                        IntakeAction::PromptField(field) => {
                            session.note_prompt(*field);
                            reply = replies::prompt(*field);
                        }
                        _ => {}
                    }
                }

                session.touch(now);
                self.store.upsert(session).await?;
                Ok(reply)
            }
            _ => {
                session.touch(now);
                self.store.upsert(session).await?;
                Ok(replies::yes_no_reprompt())
            }
        }
    }

    /// The exactly-once protocol: reserve the `Confirmed` state through the
    /// compare-and-swap first, then perform the side effect, then delete.
    /// A redelivered confirmation either loses the swap and replays against
    /// a terminal/absent session, or never sees `AwaitingConfirmation`.
    async fn dispatch_turn(
        &self,
        mut session: Session,
        message: &InboundMessage,
        now: DateTime<Utc>,
    ) -> Result<Reply, TurnFailure> {
        let booking = match ConfirmedBooking::try_from(&session) {
            Ok(booking) => booking,
            Err(error) => {
                warn!(
                    event_name = "turn.summary_without_fields",
                    correlation_id = %message.message_id,
                    user_id = %session.user_id.0,
                    error = %error,
                    "confirmation reached without a complete field set"
                );
                return Ok(replies::apology(session.fields.first_missing()));
            }
        };

        if session.transition_to(SessionState::Confirmed).is_err() {
            return Ok(replies::apology(None));
        }
        session.touch(now);
        let reserved = self.store.upsert(session).await?;

        let dispatched = match timeout(
            self.config.dispatch_timeout,
            self.dispatcher.dispatch(&booking),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(DispatchError::Timeout),
        };

        match dispatched {
            Ok(ack) => {
                self.store.delete(&reserved.user_id).await.map_err(TurnFailure::Fatal)?;
                info!(
                    event_name = "dispatch.booking_confirmed",
                    correlation_id = %message.message_id,
                    user_id = %reserved.user_id.0,
                    reference = %ack.reference,
                    "booking dispatched and session closed"
                );
                Ok(replies::confirmed(&booking, &self.hours))
            }
            Err(error) => {
                warn!(
                    event_name = "dispatch.booking_failed",
                    correlation_id = %message.message_id,
                    user_id = %reserved.user_id.0,
                    error = %error,
                    "dispatch failed; booking stays pending for retry"
                );
                // Compensating rollback of the reservation, not a
                // user-visible transition; the next affirmative retries.
                let mut revert = reserved;
                revert.state = SessionState::AwaitingConfirmation;
                revert.touch(now);
                if let Err(error) = self.store.upsert(revert).await {
                    warn!(
                        event_name = "dispatch.reservation_release_failed",
                        correlation_id = %message.message_id,
                        error = %error,
                        "could not release confirmation reservation"
                    );
                }
                Ok(replies::dispatch_failed())
            }
        }
    }

    fn extraction_apology(
        &self,
        session: &Session,
        message: &InboundMessage,
        error: ExtractError,
    ) -> Reply {
        warn!(
            event_name = "turn.extraction_failed",
            correlation_id = %message.message_id,
            user_id = %session.user_id.0,
            error = %error,
            "extractor failed; re-prompting without state change"
        );
        replies::apology(session.pending_field.or_else(|| session.fields.first_missing()))
    }
}

fn known_fields(session: &Session) -> Vec<FieldName> {
    [
        FieldName::PatientName,
        FieldName::ScheduledAt,
        FieldName::Reason,
        FieldName::ContactPhone,
        FieldName::ConsultType,
    ]
    .into_iter()
    .filter(|field| session.fields.is_set(*field))
    .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};

    use frontdesk_core::{
        ClinicHours, ConfirmedBooking, FieldName, FieldPatch, SessionState, UserId,
    };
    use frontdesk_store::{InMemorySessionStore, SessionStore, StoreError};

    use crate::dispatch::{BookingDispatcher, DispatchAck, DispatchError};
    use crate::extractor::{ExtractError, FieldExtractor};

    use super::{InboundMessage, IntakeRuntime, RuntimeConfig};

    struct ScriptedExtractor {
        patches: Mutex<VecDeque<Result<FieldPatch, ExtractError>>>,
    }

    impl ScriptedExtractor {
        fn new(patches: Vec<Result<FieldPatch, ExtractError>>) -> Self {
            Self { patches: Mutex::new(patches.into_iter().collect()) }
        }
    }

    #[async_trait]
    impl FieldExtractor for ScriptedExtractor {
        async fn extract(
            &self,
            _raw_text: &str,
            _known_fields: &[FieldName],
        ) -> Result<FieldPatch, ExtractError> {
            self.patches
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Ok(FieldPatch::default()))
        }
    }

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
        failures_remaining: AtomicUsize,
        last_booking: Mutex<Option<ConfirmedBooking>>,
    }

    impl CountingDispatcher {
        fn failing_once() -> Self {
            let dispatcher = Self::default();
            dispatcher.failures_remaining.store(1, Ordering::SeqCst);
            dispatcher
        }
    }

    #[async_trait]
    impl BookingDispatcher for CountingDispatcher {
        async fn dispatch(
            &self,
            booking: &ConfirmedBooking,
        ) -> Result<DispatchAck, DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(DispatchError::Transport("sink offline".to_string()));
            }
            *self.last_booking.lock().expect("booking lock") = Some(booking.clone());
            Ok(DispatchAck { reference: booking.booking_key.clone() })
        }
    }

    type TestRuntime =
        IntakeRuntime<Arc<InMemorySessionStore>, ScriptedExtractor, Arc<CountingDispatcher>>;

    fn runtime(
        patches: Vec<Result<FieldPatch, ExtractError>>,
        dispatcher: Arc<CountingDispatcher>,
    ) -> (TestRuntime, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = IntakeRuntime::new(
            Arc::clone(&store),
            ScriptedExtractor::new(patches),
            dispatcher,
            ClinicHours::default(),
            RuntimeConfig::default(),
        );
        (runtime, store)
    }

    fn message(text: &str, id: u32) -> InboundMessage {
        InboundMessage {
            user_id: UserId("whatsapp:+919876543210".to_string()),
            raw_text: text.to_string(),
            message_id: format!("msg-{id}"),
        }
    }

    fn patch(values: &[(FieldName, &str)]) -> Result<FieldPatch, ExtractError> {
        let mut patch = FieldPatch::default();
        for (field, value) in values {
            patch.set(*field, *value);
        }
        Ok(patch)
    }

    // Monday 3pm IST, inside the default window.
    const VALID_TIME: &str = "2026-01-26T15:00";

    #[tokio::test]
    async fn greeting_yields_menu_without_creating_a_session() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(vec![], dispatcher);

        let reply = runtime.handle_message(&message("Hello!", 1)).await.expect("reply");
        assert!(reply.text.contains("book an appointment"));
        assert!(store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn full_round_trip_dispatches_exactly_once_with_all_fields() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(
            vec![
                patch(&[]),
                patch(&[(FieldName::PatientName, "Ravi")]),
                patch(&[(FieldName::ScheduledAt, VALID_TIME)]),
                patch(&[(FieldName::Reason, "checkup")]),
                patch(&[(FieldName::ContactPhone, "9876543210")]),
            ],
            Arc::clone(&dispatcher),
        );

        let reply = runtime.handle_message(&message("I need an appointment", 1)).await.unwrap();
        assert!(reply.text.contains("full name"));

        let reply = runtime.handle_message(&message("Ravi", 2)).await.unwrap();
        assert!(reply.text.contains("date and time"));

        let reply = runtime.handle_message(&message("26 Jan 3pm", 3)).await.unwrap();
        assert!(reply.text.contains("reason"));

        let reply = runtime.handle_message(&message("checkup", 4)).await.unwrap();
        assert!(reply.text.contains("phone"));

        let reply = runtime.handle_message(&message("9876543210", 5)).await.unwrap();
        assert!(reply.text.contains("yes or no"), "summary expected, got: {}", reply.text);

        let reply = runtime.handle_message(&message("yes", 6)).await.unwrap();
        assert!(reply.text.contains("booked"), "got: {}", reply.text);

        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        let booking = dispatcher.last_booking.lock().unwrap().clone().expect("booking captured");
        assert_eq!(booking.patient_name, "Ravi");
        assert_eq!(booking.contact_phone, "9876543210");
        assert_eq!(booking.reason, "checkup");
        assert!(booking.scheduled_at > Utc::now() - Duration::days(365 * 10));

        // Terminal sessions are deleted.
        assert!(store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn one_shot_message_skips_straight_to_summary() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(
            vec![patch(&[
                (FieldName::PatientName, "Ravi"),
                (FieldName::ScheduledAt, VALID_TIME),
                (FieldName::Reason, "checkup"),
                (FieldName::ContactPhone, "9876543210"),
            ])],
            dispatcher,
        );

        let reply = runtime
            .handle_message(&message("Ravi, 26 Jan 3pm, checkup, 9876543210", 1))
            .await
            .unwrap();
        assert!(reply.text.contains("Ravi"));
        assert!(reply.text.contains("yes or no"));

        let session = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session saved");
        assert_eq!(session.state, SessionState::AwaitingConfirmation);
    }

    #[tokio::test]
    async fn out_of_hours_candidate_is_rejected_with_hours_notice() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        // 8am IST on a Monday, outside the 1:30pm-6:30pm window.
        let (runtime, store) = runtime(
            vec![patch(&[(FieldName::ScheduledAt, "2026-01-26T08:00")])],
            dispatcher,
        );

        let reply = runtime.handle_message(&message("26 Jan 8am", 1)).await.unwrap();
        assert!(reply.text.contains("outside our consultation hours"), "got: {}", reply.text);

        let session = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session saved");
        assert_eq!(session.state, SessionState::Collecting);
        assert_eq!(session.fields.scheduled_at, None);
    }

    #[tokio::test]
    async fn no_at_confirmation_clears_only_the_time() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(
            vec![patch(&[
                (FieldName::PatientName, "Ravi"),
                (FieldName::ScheduledAt, VALID_TIME),
                (FieldName::Reason, "checkup"),
                (FieldName::ContactPhone, "9876543210"),
            ])],
            Arc::clone(&dispatcher),
        );

        runtime.handle_message(&message("book me in", 1)).await.unwrap();
        let reply = runtime.handle_message(&message("no", 2)).await.unwrap();
        assert!(reply.text.contains("date and time"), "got: {}", reply.text);

        let session = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session kept");
        assert_eq!(session.state, SessionState::Collecting);
        assert_eq!(session.fields.scheduled_at, None);
        assert_eq!(session.fields.patient_name.as_deref(), Some("Ravi"));
        assert_eq!(session.fields.reason.as_deref(), Some("checkup"));
        assert_eq!(session.fields.contact_phone.as_deref(), Some("9876543210"));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unrecognized_reply_at_confirmation_repeats_yes_no_without_summary() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, _store) = runtime(
            vec![patch(&[
                (FieldName::PatientName, "Ravi"),
                (FieldName::ScheduledAt, VALID_TIME),
                (FieldName::Reason, "checkup"),
                (FieldName::ContactPhone, "9876543210"),
            ])],
            dispatcher,
        );

        runtime.handle_message(&message("book me in", 1)).await.unwrap();
        let reply = runtime.handle_message(&message("maybe later", 2)).await.unwrap();
        assert!(reply.text.contains("yes or no"));
        assert!(!reply.text.contains("Ravi"), "summary must not be re-sent");
    }

    #[tokio::test]
    async fn extractor_failure_degrades_to_apology_and_same_prompt() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(
            vec![
                patch(&[(FieldName::PatientName, "Ravi")]),
                Err(ExtractError::Transport("llm unreachable".to_string())),
            ],
            dispatcher,
        );

        runtime.handle_message(&message("I'm Ravi", 1)).await.unwrap();
        let before = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session");

        let reply = runtime.handle_message(&message("26 Jan 3pm", 2)).await.unwrap();
        assert!(reply.text.contains("Sorry"));
        assert!(reply.text.contains("date and time"), "re-asks the pending field");

        let after = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session");
        assert_eq!(after.fields, before.fields, "fields unchanged on extractor failure");
        assert_eq!(after.state, before.state);
    }

    #[tokio::test]
    async fn duplicate_yes_after_confirmation_does_not_redispatch() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, _store) = runtime(
            vec![
                patch(&[
                    (FieldName::PatientName, "Ravi"),
                    (FieldName::ScheduledAt, VALID_TIME),
                    (FieldName::Reason, "checkup"),
                    (FieldName::ContactPhone, "9876543210"),
                ]),
                // Redelivered "yes" lands on a fresh session and goes
                // through extraction like any other text would.
                patch(&[]),
            ],
            Arc::clone(&dispatcher),
        );

        runtime.handle_message(&message("book me in", 1)).await.unwrap();
        runtime.handle_message(&message("yes", 2)).await.unwrap();
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        let reply = runtime.handle_message(&message("yes", 2)).await.unwrap();
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1, "no second side effect");
        assert!(!reply.text.contains("booked for"));
    }

    #[tokio::test]
    async fn dispatch_failure_keeps_booking_pending_and_next_yes_retries() {
        let dispatcher = Arc::new(CountingDispatcher::failing_once());
        let (runtime, store) = runtime(
            vec![patch(&[
                (FieldName::PatientName, "Ravi"),
                (FieldName::ScheduledAt, VALID_TIME),
                (FieldName::Reason, "checkup"),
                (FieldName::ContactPhone, "9876543210"),
            ])],
            Arc::clone(&dispatcher),
        );

        runtime.handle_message(&message("book me in", 1)).await.unwrap();
        let reply = runtime.handle_message(&message("yes", 2)).await.unwrap();
        assert!(reply.text.contains("technical issue"), "got: {}", reply.text);

        let session = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session still pending");
        assert_eq!(session.state, SessionState::AwaitingConfirmation);

        let reply = runtime.handle_message(&message("yes", 3)).await.unwrap();
        assert!(reply.text.contains("booked"), "got: {}", reply.text);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2, "one failure, one success");
    }

    #[tokio::test]
    async fn reprompt_cap_escalates_to_handoff() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = IntakeRuntime::new(
            Arc::clone(&store),
            ScriptedExtractor::new(vec![]),
            dispatcher,
            ClinicHours::default(),
            RuntimeConfig { reprompt_cap: 2, ..RuntimeConfig::default() },
        );

        let first = runtime.handle_message(&message("mumble", 1)).await.unwrap();
        assert!(first.text.contains("full name"));
        let second = runtime.handle_message(&message("mumble", 2)).await.unwrap();
        assert!(second.text.contains("full name"));

        let third = runtime.handle_message(&message("mumble", 3)).await.unwrap();
        assert!(third.text.contains("front-desk staff"), "got: {}", third.text);
    }

    #[tokio::test]
    async fn greeting_mid_collection_leaves_fields_untouched() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(
            vec![patch(&[(FieldName::PatientName, "Ravi")])],
            dispatcher,
        );

        runtime.handle_message(&message("I'm Ravi", 1)).await.unwrap();
        let reply = runtime.handle_message(&message("hi", 2)).await.unwrap();
        assert!(reply.text.contains("book an appointment"));

        let session = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session kept");
        assert_eq!(session.fields.patient_name.as_deref(), Some("Ravi"));
        assert_eq!(session.state, SessionState::Collecting);
    }

    #[tokio::test]
    async fn cancel_deletes_the_active_session() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let (runtime, store) = runtime(
            vec![patch(&[(FieldName::PatientName, "Ravi")])],
            dispatcher,
        );

        runtime.handle_message(&message("I'm Ravi", 1)).await.unwrap();
        let reply = runtime.handle_message(&message("cancel", 2)).await.unwrap();
        assert!(reply.text.contains("cancelled"));
        assert!(store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn idle_expired_session_restarts_from_scratch() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = IntakeRuntime::new(
            Arc::clone(&store),
            ScriptedExtractor::new(vec![
                patch(&[(FieldName::PatientName, "Ravi")]),
                patch(&[]),
            ]),
            dispatcher,
            ClinicHours::default(),
            RuntimeConfig { session_idle: Duration::minutes(30), ..RuntimeConfig::default() },
        );

        runtime.handle_message(&message("I'm Ravi", 1)).await.unwrap();

        // Age the stored session past the idle window.
        let user = UserId("whatsapp:+919876543210".to_string());
        let mut aged = store.get(&user).await.expect("get").expect("session");
        aged.updated_at = stale_timestamp();
        store.upsert(aged).await.expect("age session");

        let reply = runtime.handle_message(&message("continue please", 2)).await.unwrap();
        assert!(reply.text.contains("full name"), "fresh session starts over: {}", reply.text);
    }

    fn stale_timestamp() -> DateTime<Utc> {
        Utc::now() - Duration::minutes(45)
    }

    /// Never resolves; the runtime's own timeout has to cut the call off.
    struct StalledExtractor;

    #[async_trait]
    impl FieldExtractor for StalledExtractor {
        async fn extract(
            &self,
            _raw_text: &str,
            _known_fields: &[FieldName],
        ) -> Result<FieldPatch, ExtractError> {
            std::future::pending::<()>().await;
            Ok(FieldPatch::default())
        }
    }

    struct StalledDispatcher;

    #[async_trait]
    impl BookingDispatcher for StalledDispatcher {
        async fn dispatch(
            &self,
            _booking: &ConfirmedBooking,
        ) -> Result<DispatchAck, DispatchError> {
            std::future::pending::<()>().await;
            Err(DispatchError::Timeout)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_extractor_times_out_into_an_apology_without_state_change() {
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = IntakeRuntime::new(
            Arc::clone(&store),
            StalledExtractor,
            Arc::new(CountingDispatcher::default()),
            ClinicHours::default(),
            RuntimeConfig::default(),
        );

        let reply = runtime.handle_message(&message("I need a booking", 1)).await.expect("reply");
        assert!(reply.text.contains("Sorry"), "got: {}", reply.text);
        assert!(reply.text.contains("full name"), "re-asks the first missing field");

        // The failed turn must not have persisted anything.
        assert!(store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_dispatcher_times_out_and_keeps_the_booking_pending() {
        let store = Arc::new(InMemorySessionStore::new());
        let runtime = IntakeRuntime::new(
            Arc::clone(&store),
            ScriptedExtractor::new(vec![patch(&[
                (FieldName::PatientName, "Ravi"),
                (FieldName::ScheduledAt, VALID_TIME),
                (FieldName::Reason, "checkup"),
                (FieldName::ContactPhone, "9876543210"),
            ])]),
            StalledDispatcher,
            ClinicHours::default(),
            RuntimeConfig::default(),
        );

        runtime.handle_message(&message("book me in", 1)).await.expect("summary");
        let reply = runtime.handle_message(&message("yes", 2)).await.expect("reply");
        assert!(reply.text.contains("technical issue"), "got: {}", reply.text);

        let session = store
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("session still pending");
        assert_eq!(session.state, SessionState::AwaitingConfirmation);
        assert!(session.fields.is_complete(), "captured fields survive the timeout");
    }

    mod conflict_injection {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        use async_trait::async_trait;
        use chrono::{DateTime, Duration, Utc};

        use frontdesk_core::{Session, UserId};
        use frontdesk_store::{InMemorySessionStore, SessionStore, StoreError};

        /// Fails the first `n` upserts with a conflict, then delegates.
        pub struct ConflictingStore {
            pub inner: Arc<InMemorySessionStore>,
            pub conflicts_remaining: AtomicUsize,
        }

        #[async_trait]
        impl SessionStore for ConflictingStore {
            async fn get(&self, user_id: &UserId) -> Result<Option<Session>, StoreError> {
                self.inner.get(user_id).await
            }

            async fn upsert(&self, session: Session) -> Result<Session, StoreError> {
                if self.conflicts_remaining.load(Ordering::SeqCst) > 0 {
                    self.conflicts_remaining.fetch_sub(1, Ordering::SeqCst);
                    return Err(StoreError::Conflict {
                        user_id: session.user_id.0.clone(),
                        expected: session.version,
                        found: session.version + 1,
                    });
                }
                self.inner.upsert(session).await
            }

            async fn delete(&self, user_id: &UserId) -> Result<(), StoreError> {
                self.inner.delete(user_id).await
            }

            async fn sweep_expired(
                &self,
                now: DateTime<Utc>,
                idle: Duration,
            ) -> Result<usize, StoreError> {
                self.inner.sweep_expired(now, idle).await
            }
        }
    }

    #[tokio::test]
    async fn lost_compare_and_swap_replays_the_turn_instead_of_dropping_it() {
        use conflict_injection::ConflictingStore;

        let dispatcher = Arc::new(CountingDispatcher::default());
        let inner = Arc::new(InMemorySessionStore::new());
        let store = ConflictingStore {
            inner: Arc::clone(&inner),
            conflicts_remaining: AtomicUsize::new(1),
        };
        let runtime = IntakeRuntime::new(
            store,
            ScriptedExtractor::new(vec![
                patch(&[(FieldName::PatientName, "Ravi")]),
                // Replay after the injected conflict extracts again.
                patch(&[(FieldName::PatientName, "Ravi")]),
            ]),
            dispatcher,
            ClinicHours::default(),
            RuntimeConfig::default(),
        );

        let reply = runtime.handle_message(&message("I'm Ravi", 1)).await.expect("reply");
        assert!(reply.text.contains("date and time"), "turn replayed to success");

        let session = inner
            .get(&UserId("whatsapp:+919876543210".to_string()))
            .await
            .expect("get")
            .expect("saved by the replay");
        assert_eq!(session.fields.patient_name.as_deref(), Some("Ravi"));
    }
}
