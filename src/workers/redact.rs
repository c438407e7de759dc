//! PII redaction applied before any transcript text is persisted.
//!
//! Redaction is not reversible; the raw recognizer output never reaches
//! the store or the evaluation prompt.

use std::sync::OnceLock;

use regex::Regex;

/// Replacement token for long digit runs
pub const REDACTED_PHONE: &str = "[REDACTED_PHONE]";

/// Replacement token for email addresses
pub const REDACTED_EMAIL: &str = "[REDACTED_EMAIL]";

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{10,}\b").unwrap())
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
    })
}

/// Replace phone-number-length digit runs and email addresses with
/// redaction tokens
pub fn redact_pii(text: &str) -> String {
    let redacted = phone_re().replace_all(text, REDACTED_PHONE);
    email_re().replace_all(&redacted, REDACTED_EMAIL).into_owned()
}
