//! Error types for the otp-relay crate.
//!
//! Errors fall into the categories of [`ErrorCategory`]. Configuration errors are
//! fatal at startup; every session-scoped error is recovered by the watch loop
//! through a reconnect under backoff; delivery errors are scoped to one message.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while watching the mailbox and relaying codes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration errors (fatal at startup, NOT retryable)
    // ─────────────────────────────────────────────────────────────────────────
    /// One or more required settings are absent or empty.
    #[error("missing required configuration: {}", keys.join(", "))]
    MissingConfig {
        /// Names of the missing keys.
        keys: Vec<String>,
    },

    /// A setting is present but invalid.
    #[error("invalid configuration for {key}: {message}")]
    InvalidConfig {
        /// Name of the offending key.
        key: String,
        /// Description of the problem.
        message: String,
    },

    /// Invalid email address format.
    #[error("invalid email format for {key}: {email}")]
    InvalidEmailFormat {
        /// Name of the offending key.
        key: String,
        /// The invalid email address.
        email: String,
    },

    /// The extraction pattern does not compile.
    #[error("invalid code pattern '{pattern}'")]
    InvalidPattern {
        /// The rejected pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// Invalid DNS name for TLS.
    #[error("invalid DNS name for host '{host}'")]
    InvalidDnsName {
        /// The invalid hostname.
        host: String,
        /// The underlying DNS name error.
        #[source]
        source: rustls::client::InvalidDnsNameError,
    },

    /// The HTTP client for the notifier could not be built.
    #[error("failed to build HTTP client")]
    HttpClient {
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Authentication errors (RETRYABLE under backoff, logged distinctly)
    // ─────────────────────────────────────────────────────────────────────────
    /// IMAP login failed.
    #[error("IMAP login failed for {email}")]
    ImapLogin {
        /// The email address used for login.
        email: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Authentication timeout.
    #[error("authentication timeout for {email} after {timeout:?}")]
    AuthTimeout {
        /// The email address used for authentication.
        email: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Network errors (RETRYABLE)
    // ─────────────────────────────────────────────────────────────────────────
    /// Failed to establish TCP connection.
    #[error("failed to connect to {target}")]
    TcpConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to establish TLS connection.
    #[error("failed to establish TLS connection to {target}")]
    TlsConnect {
        /// The target address that failed.
        target: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to connect via SOCKS5 proxy.
    #[error("failed to connect via SOCKS5 proxy {proxy_host} to {target}")]
    Socks5Connect {
        /// The SOCKS5 proxy hostname.
        proxy_host: String,
        /// The target address.
        target: String,
        /// The underlying SOCKS5 error.
        #[source]
        source: tokio_socks::Error,
    },

    /// Connection timeout.
    #[error("connection timeout to {target} after {timeout:?}")]
    ConnectTimeout {
        /// The target address.
        target: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Mailbox selection timeout.
    #[error("folder selection timeout for '{folder}' after {timeout:?}")]
    SelectTimeout {
        /// The folder name.
        folder: String,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// Search or fetch timeout.
    #[error("message fetch timeout after {timeout:?}")]
    FetchTimeout {
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// An IDLE command or its DONE got no completion in time.
    #[error("IMAP {command} not completed within {timeout:?}")]
    IdleTimeout {
        /// The command that stalled.
        command: &'static str,
        /// The timeout duration that was exceeded.
        timeout: Duration,
    },

    /// The server connection dropped.
    #[error("connection to IMAP server lost")]
    ConnectionLost {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // IMAP protocol errors (RETRYABLE - unexpected server behavior)
    // ─────────────────────────────────────────────────────────────────────────
    /// An operation was attempted without an authenticated session.
    #[error("no authenticated IMAP session")]
    NotConnected,

    /// CAPABILITY query failed.
    #[error("IMAP CAPABILITY command failed")]
    ImapCapabilities {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to select the folder.
    #[error("failed to select folder '{folder}'")]
    SelectFolder {
        /// The folder name.
        folder: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IDLE exchange failed.
    #[error("IMAP IDLE failed")]
    ImapIdle {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP NOOP failed.
    #[error("IMAP NOOP command failed")]
    ImapNoop {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP search failed.
    #[error("IMAP search failed")]
    ImapSearch {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP fetch failed.
    #[error("IMAP fetch failed for UID set {uid_set}")]
    ImapFetch {
        /// The UID set that failed.
        uid_set: String,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP STORE failed.
    #[error("IMAP STORE failed for UID {uid}")]
    ImapStore {
        /// The UID being flagged.
        uid: u32,
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// IMAP logout failed.
    #[error("IMAP logout failed")]
    ImapLogout {
        /// The underlying IMAP error.
        #[source]
        source: async_imap::error::Error,
    },

    /// Failed to parse a fetched message.
    #[error("failed to parse message UID {uid}")]
    ParseMessage {
        /// The message UID.
        uid: u32,
        /// The underlying parse error.
        #[source]
        source: mailparse::MailParseError,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Delivery errors (scoped to one message)
    // ─────────────────────────────────────────────────────────────────────────
    /// The chat API refused the message; retrying will not help.
    #[error("delivery rejected (status {status}): {description}")]
    DeliveryRejected {
        /// HTTP status code of the response.
        status: u16,
        /// Description reported by the API.
        description: String,
    },

    /// Every delivery attempt failed with a transient error.
    #[error("delivery failed after {attempts} attempt(s): {reason}")]
    DeliveryFailed {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the last failure.
        reason: String,
    },

    /// Delivery retries were cut short by shutdown.
    #[error("delivery interrupted by shutdown after {attempts} attempt(s)")]
    DeliveryInterrupted {
        /// Number of attempts made.
        attempts: u32,
    },

    // ─────────────────────────────────────────────────────────────────────────
    // Liveness marker errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Reading or writing the liveness marker failed.
    #[error("liveness marker I/O failed for {}", path.display())]
    LivenessIo {
        /// The marker path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The liveness marker does not contain a timestamp.
    #[error("liveness marker {} is malformed: {content:?}", path.display())]
    LivenessMalformed {
        /// The marker path.
        path: PathBuf,
        /// What was read.
        content: String,
    },
}

impl Error {
    /// Returns `true` if this error represents a transient failure that might succeed on retry.
    ///
    /// Authentication failures are retryable: an operator may fix credentials while the
    /// process keeps running.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self.category() {
            ErrorCategory::Configuration | ErrorCategory::Liveness => false,
            ErrorCategory::Authentication | ErrorCategory::Network | ErrorCategory::Protocol => {
                true
            }
            ErrorCategory::Delivery => matches!(self, Error::DeliveryFailed { .. }),
        }
    }

    /// Returns the error category for logging purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MissingConfig { .. }
            | Error::InvalidConfig { .. }
            | Error::InvalidEmailFormat { .. }
            | Error::InvalidPattern { .. }
            | Error::InvalidDnsName { .. }
            | Error::HttpClient { .. } => ErrorCategory::Configuration,

            Error::ImapLogin { .. } | Error::AuthTimeout { .. } => ErrorCategory::Authentication,

            Error::TcpConnect { .. }
            | Error::TlsConnect { .. }
            | Error::Socks5Connect { .. }
            | Error::ConnectTimeout { .. }
            | Error::SelectTimeout { .. }
            | Error::FetchTimeout { .. }
            | Error::IdleTimeout { .. }
            | Error::ConnectionLost { .. } => ErrorCategory::Network,

            Error::NotConnected
            | Error::ImapCapabilities { .. }
            | Error::SelectFolder { .. }
            | Error::ImapIdle { .. }
            | Error::ImapNoop { .. }
            | Error::ImapSearch { .. }
            | Error::ImapFetch { .. }
            | Error::ImapStore { .. }
            | Error::ImapLogout { .. }
            | Error::ParseMessage { .. } => ErrorCategory::Protocol,

            Error::DeliveryRejected { .. }
            | Error::DeliveryFailed { .. }
            | Error::DeliveryInterrupted { .. } => ErrorCategory::Delivery,

            Error::LivenessIo { .. } | Error::LivenessMalformed { .. } => ErrorCategory::Liveness,
        }
    }

    /// Returns `true` for configuration errors, which must stop the process at startup.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Configuration
    }

    /// Reclassifies an IMAP error as a lost connection when it is an I/O failure.
    pub(crate) fn from_imap(
        source: async_imap::error::Error,
        wrap: impl FnOnce(async_imap::error::Error) -> Error,
    ) -> Error {
        if matches!(
            source,
            async_imap::error::Error::Io(_) | async_imap::error::Error::ConnectionLost
        ) {
            Error::ConnectionLost { source }
        } else {
            wrap(source)
        }
    }
}

/// Error categories for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Startup configuration errors.
    Configuration,
    /// Credentials rejected or login stalled.
    Authentication,
    /// Connectivity errors and timeouts.
    Network,
    /// Unexpected IMAP server behavior.
    Protocol,
    /// Outbound notification failures.
    Delivery,
    /// Liveness marker failures.
    Liveness,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Delivery => write!(f, "delivery"),
            ErrorCategory::Liveness => write!(f, "liveness"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let err = Error::MissingConfig {
            keys: vec!["BOT_TOKEN".into()],
        };
        assert!(!err.is_retryable());
        assert!(err.is_fatal());

        let err = Error::TcpConnect {
            target: "imap.example.com:993".into(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        let err = Error::ImapLogin {
            email: "user@example.com".into(),
            source: async_imap::error::Error::No("bad credentials".into()),
        };
        assert!(err.is_retryable());
        assert_eq!(err.category(), ErrorCategory::Authentication);
    }

    #[test]
    fn test_delivery_errors_are_message_scoped() {
        let rejected = Error::DeliveryRejected {
            status: 400,
            description: "chat not found".into(),
        };
        assert_eq!(rejected.category(), ErrorCategory::Delivery);
        assert!(!rejected.is_retryable());

        let exhausted = Error::DeliveryFailed {
            attempts: 5,
            reason: "status 502".into(),
        };
        assert!(exhausted.is_retryable());
        assert!(!exhausted.is_fatal());
    }

    #[test]
    fn test_missing_config_lists_every_key() {
        let err = Error::MissingConfig {
            keys: vec!["MAILBOX_EMAIL".into(), "CHAT_ID".into()],
        };
        assert_eq!(
            err.to_string(),
            "missing required configuration: MAILBOX_EMAIL, CHAT_ID"
        );
    }

    #[test]
    fn test_io_failures_become_connection_lost() {
        let io = async_imap::error::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe",
        ));
        let err = Error::from_imap(io, |source| Error::ImapIdle { source });
        assert!(matches!(err, Error::ConnectionLost { .. }));
        assert_eq!(err.category(), ErrorCategory::Network);

        let bad = async_imap::error::Error::Bad("unknown command".into());
        let err = Error::from_imap(bad, |source| Error::ImapIdle { source });
        assert!(matches!(err, Error::ImapIdle { .. }));
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn test_stalled_idle_is_network_failure() {
        let err = Error::IdleTimeout {
            command: "DONE",
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "IMAP DONE not completed within 30s");
    }
}
