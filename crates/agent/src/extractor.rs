use async_trait::async_trait;
use thiserror::Error;

use frontdesk_core::{FieldName, FieldPatch};

use crate::llm::LlmClient;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extractor service unavailable: {0}")]
    Transport(String),
    #[error("extractor call timed out")]
    Timeout,
}

/// Turns one raw message into proposed field values. Best-effort and not
/// required to be deterministic; the state machine re-asks for anything the
/// extractor fails to resolve.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    /// `known_fields` are the fields the session has already captured; the
    /// extractor is asked only about the rest.
    async fn extract(
        &self,
        raw_text: &str,
        known_fields: &[FieldName],
    ) -> Result<FieldPatch, ExtractError>;
}

pub struct LlmFieldExtractor<C> {
    client: C,
}

impl<C> LlmFieldExtractor<C>
where
    C: LlmClient,
{
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C> FieldExtractor for LlmFieldExtractor<C>
where
    C: LlmClient,
{
    async fn extract(
        &self,
        raw_text: &str,
        known_fields: &[FieldName],
    ) -> Result<FieldPatch, ExtractError> {
        let wanted = wanted_fields(known_fields);
        if wanted.is_empty() {
            return Ok(FieldPatch::default());
        }

        let prompt = build_prompt(raw_text, &wanted);
        let completion = self
            .client
            .complete(&prompt)
            .await
            .map_err(|err| ExtractError::Transport(err.to_string()))?;

        // Malformed or empty model output is an empty patch, never a failed
        // turn; the state machine re-prompts instead.
        Ok(parse_patch(&completion, &wanted))
    }
}

fn wanted_fields(known_fields: &[FieldName]) -> Vec<FieldName> {
    [
        FieldName::PatientName,
        FieldName::ScheduledAt,
        FieldName::Reason,
        FieldName::ContactPhone,
        FieldName::ConsultType,
    ]
    .into_iter()
    .filter(|field| !known_fields.contains(field))
    .collect()
}

fn build_prompt(raw_text: &str, wanted: &[FieldName]) -> String {
    let keys = wanted.iter().map(|field| field.key()).collect::<Vec<_>>().join(", ");
    format!(
        "You extract appointment details from a patient's WhatsApp message.\n\
         Return ONLY a JSON object. Allowed keys: {keys}. Omit any key the \
         message does not clearly state. Values are strings. For \
         scheduled_at use ISO format YYYY-MM-DDTHH:MM in clinic local time. \
         For consult_type use \"opd\" or \"video\".\n\nMessage: {raw_text}"
    )
}

/// Lenient decode of the model output: the first JSON object found is used,
/// unknown keys are dropped, non-string scalars are coerced, and anything
/// unreadable yields an empty patch.
fn parse_patch(completion: &str, wanted: &[FieldName]) -> FieldPatch {
    let mut patch = FieldPatch::default();

    let Some(start) = completion.find('{') else {
        return patch;
    };
    let Some(end) = completion.rfind('}') else {
        return patch;
    };
    if end < start {
        return patch;
    }

    let Ok(object) =
        serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(&completion[start..=end])
    else {
        return patch;
    };

    for field in wanted {
        let Some(value) = object.get(field.key()) else {
            continue;
        };
        let raw = match value {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Number(number) => number.to_string(),
            _ => continue,
        };
        if !raw.trim().is_empty() {
            patch.set(*field, raw);
        }
    }

    patch
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;

    use frontdesk_core::FieldName;

    use crate::llm::LlmClient;

    use super::{parse_patch, wanted_fields, ExtractError, FieldExtractor, LlmFieldExtractor};

    struct CannedLlm(&'static str);

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    const ALL: [FieldName; 5] = [
        FieldName::PatientName,
        FieldName::ScheduledAt,
        FieldName::Reason,
        FieldName::ContactPhone,
        FieldName::ConsultType,
    ];

    #[tokio::test]
    async fn extracts_fields_from_model_json() {
        let extractor = LlmFieldExtractor::new(CannedLlm(
            r#"Here you go: {"patient_name": "Ravi", "scheduled_at": "2026-01-26T15:00",
               "reason": "checkup", "contact_phone": "9876543210"}"#,
        ));

        let patch = extractor.extract("Ravi, 26 Jan 3pm, checkup, 9876543210", &[]).await
            .expect("extract");
        assert_eq!(patch.get(FieldName::PatientName), Some("Ravi"));
        assert_eq!(patch.get(FieldName::ScheduledAt), Some("2026-01-26T15:00"));
        assert_eq!(patch.len(), 4);
    }

    #[tokio::test]
    async fn already_known_fields_are_not_requested_or_returned() {
        let extractor =
            LlmFieldExtractor::new(CannedLlm(r#"{"patient_name": "Someone Else", "reason": "x"}"#));

        let patch = extractor
            .extract("my name is someone else", &[FieldName::PatientName])
            .await
            .expect("extract");
        assert_eq!(patch.get(FieldName::PatientName), None);
        assert_eq!(patch.get(FieldName::Reason), Some("x"));
    }

    #[tokio::test]
    async fn fully_known_session_short_circuits_without_a_model_call() {
        let extractor = LlmFieldExtractor::new(FailingLlm);
        let patch = extractor.extract("anything", &ALL).await.expect("no call made");
        assert!(patch.is_empty());
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_extract_error() {
        let extractor = LlmFieldExtractor::new(FailingLlm);
        let error = extractor.extract("hello", &[]).await.expect_err("must fail");
        assert!(matches!(error, ExtractError::Transport(_)));
    }

    #[test]
    fn garbage_output_parses_to_an_empty_patch() {
        assert!(parse_patch("I could not find anything", &ALL).is_empty());
        assert!(parse_patch("{not json at all]", &ALL).is_empty());
        assert!(parse_patch("", &ALL).is_empty());
    }

    #[test]
    fn unknown_keys_and_blank_values_are_dropped() {
        let patch = parse_patch(
            r#"{"patient_name": "  ", "favourite_colour": "blue", "contact_phone": 9876543210}"#,
            &ALL,
        );
        assert_eq!(patch.get(FieldName::PatientName), None);
        assert_eq!(patch.get(FieldName::ContactPhone), Some("9876543210"));
        assert_eq!(patch.len(), 1);
    }

    #[test]
    fn wanted_fields_excludes_known() {
        let wanted = wanted_fields(&[FieldName::PatientName, FieldName::ContactPhone]);
        assert_eq!(
            wanted,
            vec![FieldName::ScheduledAt, FieldName::Reason, FieldName::ConsultType]
        );
    }
}
