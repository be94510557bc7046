use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::session::{BookingFields, ConsultType, FieldName};
use crate::hours::ClinicHours;

/// Partial mapping of field name to proposed raw value, as produced by the
/// extractor. Values are untyped strings; typing and validation happen at
/// merge time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPatch {
    values: BTreeMap<FieldName, String>,
}

impl FieldPatch {
    pub fn set(&mut self, field: FieldName, value: impl Into<String>) {
        self.values.insert(field, value.into());
    }

    pub fn get(&self, field: FieldName) -> Option<&str> {
        self.values.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Fields newly filled by this patch, in priority order.
    pub filled: Vec<FieldName>,
    /// A candidate time was proposed but fell outside clinic hours. The
    /// candidate is discarded, never stored tentatively.
    pub time_rejected: bool,
}

/// Merges a patch into the session fields. Only fields currently unset are
/// filled; a noisy message can never clobber previously captured data. A
/// scheduled time is stored only after it passes the hours validator.
pub fn apply_patch(
    fields: &mut BookingFields,
    patch: &FieldPatch,
    hours: &ClinicHours,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();

    for field in FieldName::REQUIRED {
        if fields.is_set(field) {
            continue;
        }
        let Some(raw) = patch.get(field) else {
            continue;
        };

        match field {
            FieldName::PatientName => {
                if let Some(name) = non_empty(raw) {
                    fields.patient_name = Some(name);
                    outcome.filled.push(field);
                }
            }
            FieldName::Reason => {
                if let Some(reason) = non_empty(raw) {
                    fields.reason = Some(reason);
                    outcome.filled.push(field);
                }
            }
            FieldName::ContactPhone => {
                if let Some(phone) = parse_phone(raw) {
                    fields.contact_phone = Some(phone);
                    outcome.filled.push(field);
                }
            }
            FieldName::ScheduledAt => match parse_scheduled_at(raw, hours) {
                Some(candidate) if hours.is_open(candidate) => {
                    fields.scheduled_at = Some(candidate);
                    outcome.filled.push(field);
                }
                Some(_) => outcome.time_rejected = true,
                None => {}
            },
            // Not in REQUIRED; handled opportunistically below.
            FieldName::ConsultType => {}
        }
    }

    if fields.consult_type.is_none() {
        if let Some(raw) = patch.get(FieldName::ConsultType) {
            if let Ok(consult_type) = raw.parse::<ConsultType>() {
                fields.consult_type = Some(consult_type);
                outcome.filled.push(FieldName::ConsultType);
            }
        }
    }

    outcome
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Normalizes a phone value to bare digits. Separators and a leading `+`
/// country prefix are tolerated; anything else is rejected.
pub fn parse_phone(raw: &str) -> Option<String> {
    let mut digits = String::new();
    for character in raw.trim().trim_start_matches('+').chars() {
        if character.is_ascii_digit() {
            digits.push(character);
        } else if !matches!(character, ' ' | '-' | '(' | ')') {
            return None;
        }
    }

    (7..=15).contains(&digits.len()).then_some(digits)
}

/// Parses an extractor-proposed timestamp. The extractor is prompted to emit
/// ISO-8601 without an offset, which is read as clinic-local time; a full
/// RFC 3339 value is accepted as-is.
pub fn parse_scheduled_at(raw: &str, hours: &ClinicHours) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();

    if let Ok(absolute) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(absolute.with_timezone(&Utc));
    }

    const LOCAL_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"];
    for format in LOCAL_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return naive
                .and_local_timezone(hours.offset())
                .single()
                .map(|local| local.with_timezone(&Utc));
        }
    }

    None
}
