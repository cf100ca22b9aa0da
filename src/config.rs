//! Configuration for the relay.
//!
//! Resolved once at startup, either from environment-style keys with
//! [`RelayConfig::from_env`] or programmatically with [`RelayConfigBuilder`]:
//!
//! ```
//! use otp_relay::RelayConfig;
//!
//! let config = RelayConfig::builder()
//!     .email("watcher@example.com")
//!     .password("app-password")
//!     .allowed_sender("noreply@service.example")
//!     .bot_token("123456:ABC")
//!     .chat_id("-1001234567890")
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.folder, "INBOX");
//! assert!(!config.mark_as_read);
//! ```

use crate::backoff::BackoffConfig;
use crate::error::{Error, Result};
use crate::filter::normalize_address;
use crate::liveness::DEFAULT_HEARTBEAT_FILE;
use crate::matcher::{RegexMatcher, DEFAULT_CODE_PATTERN};
use crate::proxy::{Socks5Proxy, DEFAULT_SOCKS5_PORT};
use email_address::EmailAddress;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default Telegram Bot API endpoint.
pub const DEFAULT_TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Environment keys that must be present and non-empty.
pub const REQUIRED_KEYS: [&str; 5] = [
    "MAILBOX_EMAIL",
    "MAILBOX_PASSWORD",
    "ALLOWED_SENDER",
    "BOT_TOKEN",
    "CHAT_ID",
];

/// Complete relay configuration.
///
/// Secrets are held as [`SecretString`] and redacted from `Debug` output.
#[derive(Clone)]
pub struct RelayConfig {
    email: EmailAddress,
    password: SecretString,
    /// IMAP server hostname (discovered from the mailbox domain if not set).
    pub imap_host: Option<String>,
    /// IMAP server port (default: 993, implicit TLS).
    pub imap_port: u16,
    /// Folder to watch (default: `INBOX`).
    pub folder: String,
    /// Optional SOCKS5 proxy for the IMAP connection.
    pub proxy: Option<Socks5Proxy>,
    allowed_sender: String,
    pattern: RegexMatcher,
    bot_token: SecretString,
    /// Destination chat identifier.
    pub chat_id: String,
    /// Base URL of the Bot API.
    pub telegram_api_url: String,
    /// Flag delivered messages `\Seen` (default: false).
    pub mark_as_read: bool,
    /// Stop processing the current batch when a delivery fails (default: false).
    pub abort_batch_on_delivery_failure: bool,
    /// Upper bound of one IDLE wait before the connection is re-affirmed.
    pub idle_timeout: Duration,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Per-operation mailbox timeouts.
    pub timeouts: TimeoutConfig,
    /// Notifier retry policy and request timeout.
    pub delivery: DeliveryConfig,
    /// Liveness marker location.
    pub heartbeat_file: PathBuf,
    /// How long a delivered code stays valid; `None` disables expiry.
    pub code_lifetime: Option<Duration>,
    /// How often due expiries are processed.
    pub expiry_check_interval: Duration,
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("email", &self.email.as_str())
            .field("password", &"[REDACTED]")
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("folder", &self.folder)
            .field("proxy", &self.proxy)
            .field("allowed_sender", &self.allowed_sender)
            .field("pattern", &self.pattern.pattern())
            .field("bot_token", &"[REDACTED]")
            .field("chat_id", &self.chat_id)
            .field("telegram_api_url", &self.telegram_api_url)
            .field("mark_as_read", &self.mark_as_read)
            .field(
                "abort_batch_on_delivery_failure",
                &self.abort_batch_on_delivery_failure,
            )
            .field("idle_timeout", &self.idle_timeout)
            .field("backoff", &self.backoff)
            .field("timeouts", &self.timeouts)
            .field("delivery", &self.delivery)
            .field("heartbeat_file", &self.heartbeat_file)
            .field("code_lifetime", &self.code_lifetime)
            .field("expiry_check_interval", &self.expiry_check_interval)
            .finish()
    }
}

impl RelayConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Resolves the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required key is missing or any value is invalid.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolves the configuration from an arbitrary key/value source.
    ///
    /// Empty values count as absent. Every missing required key is reported at once.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required key is missing or any value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let missing: Vec<String> = REQUIRED_KEYS
            .iter()
            .filter(|key| get(**key).is_none())
            .map(|key| (*key).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingConfig { keys: missing });
        }

        let mut builder = Self::builder();
        builder.email = get("MAILBOX_EMAIL");
        builder.password = get("MAILBOX_PASSWORD");
        builder.allowed_sender = get("ALLOWED_SENDER");
        builder.bot_token = get("BOT_TOKEN");
        builder.chat_id = get("CHAT_ID");
        builder.imap_host = get("IMAP_HOST");
        builder.imap_port = parse_key(&get, "IMAP_PORT")?;
        builder.folder = get("IMAP_FOLDER");
        builder.pattern = get("CODE_PATTERN");
        builder.telegram_api_url = get("TELEGRAM_API_URL");
        builder.mark_as_read = parse_bool_key(&get, "MARK_AS_SEEN")?;
        builder.abort_batch_on_delivery_failure =
            parse_bool_key(&get, "ABORT_BATCH_ON_DELIVERY_FAILURE")?;
        builder.heartbeat_file = get("HEARTBEAT_FILE").map(PathBuf::from);
        builder.code_lifetime = parse_key::<u64>(&get, "CODE_LIFETIME_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        builder.expiry_check_interval =
            parse_key::<u64>(&get, "EXPIRY_CHECK_INTERVAL_SECS")?.map(Duration::from_secs);

        if let Some(secs) = parse_key::<u64>(&get, "IDLE_TIMEOUT_SECS")? {
            builder = builder.idle_timeout(Duration::from_secs(secs));
        }

        let mut backoff = BackoffConfig::default();
        if let Some(secs) = parse_key(&get, "RECONNECT_BASE_DELAY_SECS")? {
            backoff.base = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_key(&get, "RECONNECT_MAX_DELAY_SECS")? {
            backoff.max = Duration::from_secs(secs);
        }
        if let Some(factor) = parse_key(&get, "RECONNECT_FACTOR")? {
            backoff.factor = factor;
        }
        if let Some(jitter) = parse_bool_key(&get, "RECONNECT_JITTER")? {
            backoff.jitter = jitter;
        }
        builder = builder.backoff(backoff);

        if let Some(secs) = parse_key(&get, "CONNECT_TIMEOUT_SECS")? {
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }

        let mut delivery = DeliveryConfig::default();
        if let Some(secs) = parse_key(&get, "REQUEST_TIMEOUT_SECS")? {
            delivery.request_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = parse_key(&get, "DELIVERY_MAX_ATTEMPTS")? {
            delivery.max_attempts = attempts;
        }
        if let Some(millis) = parse_key(&get, "DELIVERY_RETRY_DELAY_MS")? {
            delivery.retry_delay = Duration::from_millis(millis);
        }
        builder = builder.delivery(delivery);

        if let Some(host) = get("SOCKS5_PROXY_HOST") {
            let port = parse_key(&get, "SOCKS5_PROXY_PORT")?.unwrap_or(DEFAULT_SOCKS5_PORT);
            let proxy = match (get("SOCKS5_PROXY_USER"), get("SOCKS5_PROXY_PASSWORD")) {
                (Some(user), Some(pass)) => Socks5Proxy::with_auth(host, port, user, pass),
                (None, None) => Socks5Proxy::new(host, port),
                _ => {
                    return Err(invalid(
                        "SOCKS5_PROXY_USER",
                        "proxy user and password must be set together",
                    ))
                }
            };
            builder = builder.proxy(proxy);
        }

        builder.build()
    }

    /// Returns the mailbox address.
    #[must_use]
    pub fn email(&self) -> &str {
        self.email.as_str()
    }

    /// Returns the mailbox password.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns the allowed sender, trimmed and lowercased.
    #[must_use]
    pub fn allowed_sender(&self) -> &str {
        &self.allowed_sender
    }

    /// Returns the compiled extraction pattern.
    #[must_use]
    pub fn code_matcher(&self) -> &RegexMatcher {
        &self.pattern
    }

    /// Returns the bot identity token.
    #[must_use]
    pub fn bot_token(&self) -> &str {
        self.bot_token.expose_secret()
    }

    /// Returns the effective IMAP host, either configured or derived from the mailbox domain.
    #[must_use]
    pub fn effective_imap_host(&self) -> String {
        self.imap_host
            .clone()
            .unwrap_or_else(|| crate::known_servers::imap_host_for(self.email.as_str()))
    }

    /// Returns the IMAP server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.effective_imap_host(), self.imap_port)
    }
}

/// Timeouts bounding individual mailbox operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Establishing the TCP/TLS connection.
    pub connect: Duration,
    /// LOGIN exchange.
    pub auth: Duration,
    /// SELECT/EXAMINE.
    pub select: Duration,
    /// SEARCH plus FETCH of new messages. Also bounds STORE, NOOP, and the IDLE and DONE commands.
    pub fetch: Duration,
    /// LOGOUT during close.
    pub logout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            auth: Duration::from_secs(30),
            select: Duration::from_secs(10),
            fetch: Duration::from_secs(30),
            logout: Duration::from_secs(5),
        }
    }
}

/// Notifier delivery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Timeout of a single HTTP request.
    pub request_timeout: Duration,
    /// Attempts per code, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub retry_delay: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    email: Option<String>,
    password: Option<String>,
    imap_host: Option<String>,
    imap_port: Option<u16>,
    folder: Option<String>,
    proxy: Option<Socks5Proxy>,
    allowed_sender: Option<String>,
    pattern: Option<String>,
    bot_token: Option<String>,
    chat_id: Option<String>,
    telegram_api_url: Option<String>,
    mark_as_read: Option<bool>,
    abort_batch_on_delivery_failure: Option<bool>,
    idle_timeout: Option<Duration>,
    backoff: Option<BackoffConfig>,
    timeouts: Option<TimeoutConfig>,
    delivery: Option<DeliveryConfig>,
    heartbeat_file: Option<PathBuf>,
    code_lifetime: Option<Duration>,
    expiry_check_interval: Option<Duration>,
}

impl RelayConfigBuilder {
    /// Sets the mailbox address (required).
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the mailbox password (required).
    ///
    /// For Gmail/Outlook, use an app-specific password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the IMAP server hostname explicitly.
    #[must_use]
    pub fn imap_host(mut self, host: impl Into<String>) -> Self {
        self.imap_host = Some(host.into());
        self
    }

    /// Sets the IMAP server port.
    #[must_use]
    pub fn imap_port(mut self, port: u16) -> Self {
        self.imap_port = Some(port);
        self
    }

    /// Sets the folder to watch.
    #[must_use]
    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Routes the IMAP connection through a SOCKS5 proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: Socks5Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Sets the only sender whose messages are relayed (required).
    #[must_use]
    pub fn allowed_sender(mut self, sender: impl Into<String>) -> Self {
        self.allowed_sender = Some(sender.into());
        self
    }

    /// Sets the extraction pattern.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Sets the bot identity token (required).
    #[must_use]
    pub fn bot_token(mut self, token: impl Into<String>) -> Self {
        self.bot_token = Some(token.into());
        self
    }

    /// Sets the destination chat identifier (required).
    #[must_use]
    pub fn chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Overrides the Bot API base URL.
    #[must_use]
    pub fn telegram_api_url(mut self, url: impl Into<String>) -> Self {
        self.telegram_api_url = Some(url.into());
        self
    }

    /// Flags delivered messages `\Seen`.
    #[must_use]
    pub fn mark_as_read(mut self, enabled: bool) -> Self {
        self.mark_as_read = Some(enabled);
        self
    }

    /// Stops the current batch when a delivery fails.
    #[must_use]
    pub fn abort_batch_on_delivery_failure(mut self, enabled: bool) -> Self {
        self.abort_batch_on_delivery_failure = Some(enabled);
        self
    }

    /// Sets the IDLE wait timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the reconnect backoff.
    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Sets all mailbox timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .connect = timeout;
        self
    }

    /// Sets the notifier delivery settings.
    #[must_use]
    pub fn delivery(mut self, delivery: DeliveryConfig) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Sets the liveness marker location.
    #[must_use]
    pub fn heartbeat_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.heartbeat_file = Some(path.into());
        self
    }

    /// Enables expiry of delivered codes after `lifetime`.
    #[must_use]
    pub fn code_lifetime(mut self, lifetime: Duration) -> Self {
        self.code_lifetime = Some(lifetime);
        self
    }

    /// Sets how often due expiries are processed.
    #[must_use]
    pub fn expiry_check_interval(mut self, interval: Duration) -> Self {
        self.expiry_check_interval = Some(interval);
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a required field is missing or any value is invalid.
    pub fn build(self) -> Result<RelayConfig> {
        let required = [
            ("MAILBOX_EMAIL", &self.email),
            ("MAILBOX_PASSWORD", &self.password),
            ("ALLOWED_SENDER", &self.allowed_sender),
            ("BOT_TOKEN", &self.bot_token),
            ("CHAT_ID", &self.chat_id),
        ];
        let missing: Vec<String> = required
            .iter()
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(key, _)| (*key).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingConfig { keys: missing });
        }

        let email = validate_email("MAILBOX_EMAIL", self.email.as_deref().unwrap_or_default())?;
        let sender_raw = self.allowed_sender.unwrap_or_default();
        validate_email("ALLOWED_SENDER", sender_raw.trim())?;

        let pattern_raw = self
            .pattern
            .unwrap_or_else(|| DEFAULT_CODE_PATTERN.to_string());
        let pattern = RegexMatcher::new(&pattern_raw).map_err(|source| Error::InvalidPattern {
            pattern: pattern_raw.clone(),
            source,
        })?;

        let backoff = self.backoff.unwrap_or_default();
        if backoff.base.is_zero() {
            return Err(invalid("RECONNECT_BASE_DELAY_SECS", "must be greater than zero"));
        }
        if backoff.max < backoff.base {
            return Err(invalid(
                "RECONNECT_MAX_DELAY_SECS",
                "must not be smaller than the base delay",
            ));
        }
        if backoff.factor == 0 {
            return Err(invalid("RECONNECT_FACTOR", "must be at least 1"));
        }

        let idle_timeout = self.idle_timeout.unwrap_or(Duration::from_secs(25 * 60));
        if idle_timeout.is_zero() {
            return Err(invalid("IDLE_TIMEOUT_SECS", "must be greater than zero"));
        }

        let delivery = self.delivery.unwrap_or_default();
        if delivery.max_attempts == 0 {
            return Err(invalid("DELIVERY_MAX_ATTEMPTS", "must be at least 1"));
        }

        let expiry_check_interval = self
            .expiry_check_interval
            .unwrap_or(Duration::from_secs(10));
        if expiry_check_interval.is_zero() {
            return Err(invalid("EXPIRY_CHECK_INTERVAL_SECS", "must be greater than zero"));
        }

        let telegram_api_url = self
            .telegram_api_url
            .unwrap_or_else(|| DEFAULT_TELEGRAM_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(telegram_api_url.starts_with("https://") || telegram_api_url.starts_with("http://")) {
            return Err(invalid("TELEGRAM_API_URL", "must be an http(s) URL"));
        }

        Ok(RelayConfig {
            email,
            password: SecretString::from(self.password.unwrap_or_default()),
            imap_host: self.imap_host,
            imap_port: self.imap_port.unwrap_or(993),
            folder: self.folder.unwrap_or_else(|| "INBOX".to_string()),
            proxy: self.proxy,
            allowed_sender: normalize_address(&sender_raw),
            pattern,
            bot_token: SecretString::from(self.bot_token.unwrap_or_default()),
            chat_id: self.chat_id.unwrap_or_default().trim().to_string(),
            telegram_api_url,
            mark_as_read: self.mark_as_read.unwrap_or(false),
            abort_batch_on_delivery_failure: self.abort_batch_on_delivery_failure.unwrap_or(false),
            idle_timeout,
            backoff,
            timeouts: self.timeouts.unwrap_or_default(),
            delivery,
            heartbeat_file: self
                .heartbeat_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HEARTBEAT_FILE)),
            code_lifetime: self.code_lifetime.filter(|lifetime| !lifetime.is_zero()),
            expiry_check_interval,
        })
    }
}

/// Validates an email address format.
fn validate_email(key: &str, email: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(email, email_address::Options::default()).map_err(|_| {
        Error::InvalidEmailFormat {
            key: key.to_string(),
            email: email.to_string(),
        }
    })
}

fn invalid(key: &str, message: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_key<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| invalid(key, &format!("cannot parse '{raw}'")))
        })
        .transpose()
}

fn parse_bool_key(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    get(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &format!("expected a boolean, got '{raw}'"))),
        })
        .transpose()
}
