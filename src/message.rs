//! Message records built from fetched RFC 5322 messages.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use tracing::warn;

/// One fetched message, reduced to what the filter needs.
///
/// Records are ephemeral: built per fetch and dropped after processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Server-assigned UID.
    pub uid: u32,
    /// Address from the `From` header, if one could be parsed.
    pub sender: Option<String>,
    /// Decoded `Subject` header.
    pub subject: Option<String>,
    /// `Date` header in UTC, or the fetch time when the header is unusable.
    pub received_at: DateTime<Utc>,
    /// Text searched for the code: first `text/plain` part, else first
    /// `text/html` part, else the top-level body.
    pub body: String,
}

impl MessageRecord {
    /// Parses a raw message fetched under `uid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ParseMessage`] if the message structure or its body
    /// cannot be decoded.
    pub fn parse(uid: u32, raw: &[u8]) -> Result<Self> {
        let parsed = mailparse::parse_mail(raw).map_err(|source| Error::ParseMessage { uid, source })?;

        let sender = parsed
            .headers
            .get_first_value("From")
            .and_then(|from| first_address(&from));
        let subject = parsed.headers.get_first_value("Subject");
        let received_at = parsed
            .headers
            .get_first_value("Date")
            .and_then(|date| mailparse::dateparse(&date).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(|| {
                warn!(uid, "Message has no usable Date header, using fetch time");
                Utc::now()
            });
        let body = select_body(&parsed).map_err(|source| Error::ParseMessage { uid, source })?;

        Ok(Self {
            uid,
            sender,
            subject,
            received_at,
            body,
        })
    }
}

/// Returns the first mailbox address of an address-list header.
fn first_address(header: &str) -> Option<String> {
    let list = mailparse::addrparse(header).ok()?;
    list.iter().find_map(|addr| match addr {
        MailAddr::Single(info) => Some(info.addr.clone()),
        MailAddr::Group(group) => group.addrs.first().map(|info| info.addr.clone()),
    })
}

/// Picks the text searched for the code.
fn select_body(parsed: &ParsedMail<'_>) -> std::result::Result<String, mailparse::MailParseError> {
    if parsed.subparts.is_empty() {
        return parsed.get_body();
    }

    for mimetype in ["text/plain", "text/html"] {
        if let Some(part) = find_part(parsed, mimetype) {
            return part.get_body();
        }
    }

    parsed.get_body()
}

/// Depth-first search for the first leaf part with the given MIME type.
fn find_part<'a, 'b>(parsed: &'a ParsedMail<'b>, mimetype: &str) -> Option<&'a ParsedMail<'b>> {
    if parsed.subparts.is_empty() {
        return parsed
            .ctype
            .mimetype
            .eq_ignore_ascii_case(mimetype)
            .then_some(parsed);
    }
    parsed
        .subparts
        .iter()
        .find_map(|part| find_part(part, mimetype))
}
