/// How the state machine should read an inbound message before any
/// extraction happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// Salutation token; answered with the static menu, never mutates state.
    Greeting,
    /// Literal affirmative at the confirmation prompt.
    Affirmative,
    /// Literal negative at the confirmation prompt.
    Negative,
    /// Explicit request to abandon the booking.
    Cancel,
    /// Anything else; goes through the extractor.
    Text,
}

const GREETINGS: [&str; 7] =
    ["hi", "hello", "hey", "namaste", "good morning", "good afternoon", "good evening"];

pub fn classify(raw_text: &str) -> MessageKind {
    let normalized = normalize_token(raw_text);

    if GREETINGS.contains(&normalized.as_str()) {
        return MessageKind::Greeting;
    }
    // Affirmative/negative vocabulary is deliberately the literal set.
    match normalized.as_str() {
        "yes" => MessageKind::Affirmative,
        "no" => MessageKind::Negative,
        "cancel" => MessageKind::Cancel,
        _ => MessageKind::Text,
    }
}

fn normalize_token(raw_text: &str) -> String {
    raw_text.trim().trim_end_matches(['!', '.', '?']).trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::{classify, MessageKind};

    #[test]
    fn greetings_match_case_insensitively_with_punctuation() {
        assert_eq!(classify("Hello!"), MessageKind::Greeting);
        assert_eq!(classify("  NAMASTE  "), MessageKind::Greeting);
        assert_eq!(classify("good morning."), MessageKind::Greeting);
    }

    #[test]
    fn literal_yes_and_no_only() {
        assert_eq!(classify("YES"), MessageKind::Affirmative);
        assert_eq!(classify("no"), MessageKind::Negative);
        // Richer phrasing stays unrecognized by decision.
        assert_eq!(classify("yeah"), MessageKind::Text);
        assert_eq!(classify("sure"), MessageKind::Text);
        assert_eq!(classify("yes please"), MessageKind::Text);
    }

    #[test]
    fn everything_else_routes_to_extraction() {
        assert_eq!(classify("Ravi, 26 Jan 3pm, checkup, 9876543210"), MessageKind::Text);
        assert_eq!(classify("I want to book an appointment"), MessageKind::Text);
    }

    #[test]
    fn cancel_token_is_recognized() {
        assert_eq!(classify("Cancel"), MessageKind::Cancel);
    }
}
