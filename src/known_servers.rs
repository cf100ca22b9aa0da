//! IMAP host discovery from the mailbox address.
//!
//! Used when `IMAP_HOST` is not configured.
//!
//! ```
//! use otp_relay::known_servers::imap_host_for;
//!
//! assert_eq!(imap_host_for("someone@gmail.com"), "imap.gmail.com");
//! assert_eq!(imap_host_for("someone@example.org"), "imap.example.org");
//! ```

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// IMAP hosts of common providers, keyed by lowercase domain.
static PROVIDERS: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("gmail.com", "imap.gmail.com"),
        ("googlemail.com", "imap.gmail.com"),
        ("yahoo.com", "imap.mail.yahoo.com"),
        ("hotmail.com", "outlook.office365.com"),
        ("outlook.com", "outlook.office365.com"),
        ("live.com", "outlook.office365.com"),
        ("icloud.com", "imap.mail.me.com"),
        ("me.com", "imap.mail.me.com"),
        ("mac.com", "imap.mail.me.com"),
        ("aol.com", "imap.aol.com"),
        ("yandex.ru", "imap.yandex.ru"),
        ("yandex.com", "imap.yandex.ru"),
        ("mail.ru", "imap.mail.ru"),
        ("bk.ru", "imap.mail.ru"),
        ("inbox.ru", "imap.mail.ru"),
        ("list.ru", "imap.mail.ru"),
        ("gmx.net", "imap.gmx.net"),
        ("gmx.de", "imap.gmx.net"),
        ("gmx.com", "imap.gmx.net"),
        ("web.de", "imap.web.de"),
        ("t-online.de", "secureimap.t-online.de"),
    ]
    .into_iter()
    .collect()
});

/// Returns the IMAP host for a mailbox address.
///
/// Unknown domains fall back to `imap.<domain>`. The lookup is case-insensitive.
#[must_use]
pub fn imap_host_for(email: &str) -> String {
    let domain = email
        .rsplit_once('@')
        .map_or(email, |(_, domain)| domain)
        .trim()
        .to_ascii_lowercase();

    PROVIDERS
        .get(domain.as_str())
        .map_or_else(|| format!("imap.{domain}"), |host| (*host).to_string())
}
