use std::sync::OnceLock;

use regex::Regex;

/// A defensively parsed oracle answer. Anything the parser cannot read stays
/// `None` and reads back as the conservative default: absent, confidence 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOracleResponse {
    raw: String,
    presence: Option<bool>,
    percentage: Option<u8>,
}

impl ParsedOracleResponse {
    pub fn parse(text: &str) -> Self {
        let raw = text.trim().to_string();
        Self {
            presence: parse_presence(&raw),
            percentage: parse_percentage(&raw),
            raw,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn presence(&self) -> Option<bool> {
        self.presence
    }

    pub fn percentage(&self) -> Option<u8> {
        self.percentage
    }

    pub fn is_present(&self) -> bool {
        self.presence.unwrap_or(false)
    }

    pub fn confidence(&self) -> u8 {
        self.percentage.unwrap_or(0)
    }
}

fn yes_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\byes\b").expect("valid yes pattern"))
}

fn no_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\bno\b").expect("valid no pattern"))
}

fn integer_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+").expect("valid integer pattern"))
}

fn parse_presence(text: &str) -> Option<bool> {
    if yes_pattern().is_match(text) {
        return Some(true);
    }
    if no_pattern().is_match(text) {
        return Some(false);
    }
    None
}

/// First run of digits, clamped to 100. Runs too long to fit count as 100.
fn parse_percentage(text: &str) -> Option<u8> {
    let digits = integer_pattern().find(text)?.as_str();
    let value = digits.parse::<u64>().unwrap_or(u64::MAX);
    Some(value.min(100) as u8)
}

#[cfg(test)]
mod tests {
    use super::ParsedOracleResponse;

    #[test]
    fn yes_and_no_answers() {
        assert!(ParsedOracleResponse::parse("YES").is_present());
        assert!(ParsedOracleResponse::parse("  yes.\n").is_present());
        assert_eq!(ParsedOracleResponse::parse("No").presence(), Some(false));
        assert!(!ParsedOracleResponse::parse("No").is_present());
    }

    #[test]
    fn yes_must_be_a_whole_word() {
        let parsed = ParsedOracleResponse::parse("eyesight test");
        assert_eq!(parsed.presence(), None);
        assert!(!parsed.is_present());
    }

    #[test]
    fn percentage_takes_first_integer() {
        assert_eq!(ParsedOracleResponse::parse("75").confidence(), 75);
        assert_eq!(ParsedOracleResponse::parse("About 40%, maybe 60").confidence(), 40);
        assert_eq!(ParsedOracleResponse::parse("Confidence: 100%").confidence(), 100);
    }

    #[test]
    fn percentage_is_clamped() {
        assert_eq!(ParsedOracleResponse::parse("250").confidence(), 100);
        assert_eq!(
            ParsedOracleResponse::parse("99999999999999999999999").confidence(),
            100
        );
    }

    #[test]
    fn unparseable_answers_fall_back_to_defaults() {
        let parsed = ParsedOracleResponse::parse("I cannot tell from this image.");
        assert_eq!(parsed.percentage(), None);
        assert_eq!(parsed.confidence(), 0);
        assert!(!parsed.is_present());

        let empty = ParsedOracleResponse::parse("");
        assert_eq!(empty.confidence(), 0);
        assert!(!empty.is_present());
        assert_eq!(empty.raw(), "");
    }
}
