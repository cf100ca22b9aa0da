//! Sender check and code extraction.
//!
//! [`CodeFilter::evaluate`] is a pure function of a [`MessageRecord`]: no I/O,
//! deterministic for a given record and configuration.

use crate::matcher::Matcher;
use crate::message::MessageRecord;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// A code extracted from an allowed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// UID of the originating message.
    pub uid: u32,
    /// The captured code.
    pub code: String,
    /// Arrival time of the originating message.
    pub received_at: DateTime<Utc>,
}

/// Accepts messages from one sender and extracts the code from their body.
///
/// The subject is not searched.
pub struct CodeFilter {
    allowed_sender: String,
    matcher: Box<dyn Matcher>,
}

impl CodeFilter {
    /// Creates a filter for `allowed_sender` using `matcher`.
    #[must_use]
    pub fn new(allowed_sender: &str, matcher: impl Matcher + 'static) -> Self {
        Self {
            allowed_sender: normalize_address(allowed_sender),
            matcher: Box::new(matcher),
        }
    }

    /// Returns the normalized allowed sender.
    #[must_use]
    pub fn allowed_sender(&self) -> &str {
        &self.allowed_sender
    }

    /// Returns the extraction for `record`, or `None` when the sender is not
    /// allowed, the body is empty, or the pattern does not match.
    #[must_use]
    pub fn evaluate(&self, record: &MessageRecord) -> Option<Extraction> {
        let sender = record.sender.as_deref().map(normalize_address);
        if sender.as_deref() != Some(self.allowed_sender.as_str()) {
            debug!(
                uid = record.uid,
                sender = sender.as_deref().unwrap_or("<none>"),
                "Skipping message from other sender"
            );
            return None;
        }

        if record.body.trim().is_empty() {
            warn!(uid = record.uid, "Message from allowed sender has an empty body");
            return None;
        }

        match self.matcher.find_match(&record.body) {
            Some(code) => Some(Extraction {
                uid: record.uid,
                code: code.into_owned(),
                received_at: record.received_at,
            }),
            None => {
                debug!(
                    uid = record.uid,
                    matcher = %self.matcher.description(),
                    "No code found in message"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for CodeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeFilter")
            .field("allowed_sender", &self.allowed_sender)
            .field("matcher", &self.matcher.description())
            .finish()
    }
}

/// Trims and lowercases an address for exact comparison.
#[must_use]
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::RegexMatcher;

    fn record(sender: Option<&str>, body: &str) -> MessageRecord {
        MessageRecord {
            uid: 42,
            sender: sender.map(str::to_string),
            subject: Some("Verification".into()),
            received_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            body: body.into(),
        }
    }

    fn filter() -> CodeFilter {
        CodeFilter::new("sender@example.com", RegexMatcher::new(r"(\d{6})").unwrap())
    }

    #[test]
    fn test_allowed_sender_code_extracted() {
        let extraction = filter()
            .evaluate(&record(Some("sender@example.com"), "Your code: 482917"))
            .unwrap();
        assert_eq!(extraction.code, "482917");
        assert_eq!(extraction.uid, 42);
        assert_eq!(extraction.received_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_other_sender_ignored_regardless_of_body() {
        let filter = filter();
        for body in ["Your code: 482917", "", "123456 654321"] {
            assert_eq!(filter.evaluate(&record(Some("spoof@example.com"), body)), None);
        }
        assert_eq!(filter.evaluate(&record(None, "Your code: 482917")), None);
    }

    #[test]
    fn test_sender_comparison_is_case_normalized() {
        let extraction = filter().evaluate(&record(Some(" Sender@EXAMPLE.com "), "code 111222"));
        assert_eq!(extraction.map(|e| e.code).as_deref(), Some("111222"));
    }

    #[test]
    fn test_lookalike_sender_is_not_a_match() {
        let filter = filter();
        assert_eq!(
            filter.evaluate(&record(Some("sender@example.com.evil"), "code 111222")),
            None
        );
        assert_eq!(
            filter.evaluate(&record(Some("xsender@example.com"), "code 111222")),
            None
        );
    }

    #[test]
    fn test_no_match_and_empty_body() {
        let filter = filter();
        assert_eq!(filter.evaluate(&record(Some("sender@example.com"), "no digits")), None);
        assert_eq!(filter.evaluate(&record(Some("sender@example.com"), "  \r\n")), None);
    }

    #[test]
    fn test_first_match_in_document_order() {
        let extraction = filter()
            .evaluate(&record(Some("sender@example.com"), "old 000111, new 999888"))
            .unwrap();
        assert_eq!(extraction.code, "000111");
    }

    #[test]
    fn test_subject_is_not_searched() {
        let mut message = record(Some("sender@example.com"), "see subject");
        message.subject = Some("Code 123123".into());
        assert_eq!(filter().evaluate(&message), None);
    }
}
