//! Code extraction from message text.
//!
//! The [`Matcher`] trait is the seam the filter uses; [`RegexMatcher`] is the
//! configured implementation.
//!
//! ```
//! use otp_relay::matcher::{Matcher, RegexMatcher};
//!
//! let matcher = RegexMatcher::new(r"(\d{6})").unwrap();
//! assert_eq!(matcher.find_match("Your code: 482917").as_deref(), Some("482917"));
//! ```

use regex::Regex;
use std::borrow::Cow;

/// Pattern used when `CODE_PATTERN` is not configured: six digits standing alone.
pub const DEFAULT_CODE_PATTERN: &str = r"\b(\d{6})\b";

/// Extracts a code from message text.
pub trait Matcher: Send + Sync {
    /// Returns the first match in document order, or `None`.
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>>;

    /// Returns a human-readable description used in logs.
    fn description(&self) -> &str;
}

/// Regex-based matcher.
///
/// The first capture group is the code. A pattern without capture groups
/// yields the whole match.
#[derive(Debug, Clone)]
pub struct RegexMatcher {
    regex: Regex,
    description: String,
}

impl RegexMatcher {
    /// Compiles a matcher from a pattern.
    ///
    /// # Errors
    ///
    /// Returns an error if the regex pattern is invalid.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(pattern)?;
        Ok(Self {
            description: format!("regex pattern: {pattern}"),
            regex,
        })
    }

    /// Returns the matcher for [`DEFAULT_CODE_PATTERN`].
    ///
    /// # Panics
    ///
    /// Never panics: the default pattern is a valid regex.
    #[must_use]
    pub fn default_code() -> Self {
        Self::new(DEFAULT_CODE_PATTERN).expect("default code pattern is valid")
    }

    /// Returns the source pattern.
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

impl Matcher for RegexMatcher {
    fn find_match<'a>(&self, text: &'a str) -> Option<Cow<'a, str>> {
        let caps = self.regex.captures(text)?;
        caps.get(1)
            .or_else(|| caps.get(0))
            .map(|m| Cow::Borrowed(m.as_str()))
    }

    fn description(&self) -> &str {
        &self.description
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_group_is_extracted() {
        let matcher = RegexMatcher::new(r"code:\s*(\d+)").unwrap();
        assert_eq!(
            matcher.find_match("Your code: 12345").as_deref(),
            Some("12345")
        );
        assert_eq!(matcher.find_match("No code here"), None);
    }

    #[test]
    fn test_pattern_without_groups_uses_whole_match() {
        let matcher = RegexMatcher::new(r"\d{6}").unwrap();
        assert_eq!(matcher.find_match("pin 654321").as_deref(), Some("654321"));
    }

    #[test]
    fn test_first_match_wins() {
        let matcher = RegexMatcher::new(r"(\d{6})").unwrap();
        assert_eq!(
            matcher.find_match("first 111111 then 222222").as_deref(),
            Some("111111")
        );
    }

    #[test]
    fn test_default_code_pattern() {
        let matcher = RegexMatcher::default_code();
        assert_eq!(
            matcher.find_match("Your code is 123456.").as_deref(),
            Some("123456")
        );
        assert_eq!(matcher.find_match("Code: 12345"), None);
        assert_eq!(matcher.find_match("Order 1234567"), None);
    }

    #[test]
    fn test_match_is_borrowed() {
        let matcher = RegexMatcher::default_code();
        let result = matcher.find_match("code 987654");
        assert!(matches!(result, Some(Cow::Borrowed(_))));
    }
}
