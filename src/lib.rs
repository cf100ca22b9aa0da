//! # otp-relay
//!
//! Watches one IMAP folder and forwards one-time codes from a single trusted
//! sender to a Telegram chat.
//!
//! The relay keeps a long-lived IMAP session in IDLE, reconnecting with
//! exponential backoff whenever the session fails. New mail from the allowed
//! sender is matched against a capture pattern and the first match is posted
//! to the chat, strictly in arrival order. A liveness marker file is refreshed
//! on every healthy iteration for an external health check.
//!
//! ## Quick Start
//!
//! ```no_run
//! use otp_relay::{ImapMailbox, RelayConfig, TelegramNotifier, Watcher};
//!
//! # async fn example() -> otp_relay::Result<()> {
//! let config = RelayConfig::builder()
//!     .email("watcher@gmail.com")
//!     .password("app-password")
//!     .allowed_sender("noreply@service.example")
//!     .bot_token("123456:ABC")
//!     .chat_id("-1001234567890")
//!     .build()?;
//!
//! let (trigger, shutdown) = otp_relay::shutdown::channel();
//! let notifier = TelegramNotifier::new(&config)?;
//! let watcher = Watcher::new(&config, ImapMailbox::new(config.clone()), &notifier);
//!
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     trigger.trigger();
//! });
//! let summary = watcher.run(shutdown).await;
//! println!("delivered {} codes", summary.delivered);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Pattern Matching
//!
//! The first capture group is the code; a pattern without groups yields the
//! whole match.
//!
//! ```
//! use otp_relay::matcher::{Matcher, RegexMatcher};
//!
//! let matcher = RegexMatcher::new(r"token=([a-f0-9]{8})").unwrap();
//! assert_eq!(
//!     matcher.find_match("click ?token=deadbeef now").as_deref(),
//!     Some("deadbeef")
//! );
//! ```
//!
//! ## Error Handling
//!
//! Errors carry an [`ErrorCategory`]. Configuration errors are fatal at
//! startup; everything session-scoped is retried by the watch loop.
//!
//! ```
//! use otp_relay::Error;
//!
//! fn handle_error(error: &Error) {
//!     if error.is_fatal() {
//!         eprintln!("fix the configuration: {error}");
//!     } else if error.is_retryable() {
//!         eprintln!("transient ({}): {error}", error.category());
//!     }
//! }
//! ```
//!
//! ## Observability
//!
//! The crate uses `tracing` for instrumentation.
//!
//! ### Span Naming Convention
//!
//! - `Watcher::run` - Watch loop lifetime
//! - `ImapMailbox::connect` - Connection and login
//! - `ImapMailbox::fetch_unseen_since` - Search and fetch of new mail
//! - `TelegramNotifier::send` - Delivery of one code
//! - `session::idle` - One IDLE wait
//! - `Connector::connect` - TLS connection
//!
//! ### Standard Fields
//!
//! - `email` - Mailbox address
//! - `imap_host` - IMAP server hostname
//! - `proxy_enabled` - Whether proxy is used
//! - `uid` - Message UID
//! - `from` / `to` - Watch loop state transition

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Public modules
pub mod backoff;
pub mod config;
pub mod error;
pub mod expiry;
pub mod filter;
pub mod known_servers;
pub mod liveness;
pub mod mailbox;
pub mod matcher;
pub mod message;
pub mod notifier;
pub mod proxy;
pub mod shutdown;
pub mod watcher;

// Internal modules
mod client;
mod connection;
mod session;

// Re-exports for ergonomic API
pub use backoff::{Backoff, BackoffConfig};
pub use client::{ImapMailbox, POLL_INTERVAL};
pub use config::{DeliveryConfig, RelayConfig, RelayConfigBuilder, TimeoutConfig};
pub use error::{Error, ErrorCategory, Result};
pub use filter::{CodeFilter, Extraction};
pub use mailbox::{FolderStatus, MailboxSession, Notification};
pub use message::MessageRecord;
pub use notifier::{Delivery, DeliveryContext, Notifier, TelegramNotifier};
pub use proxy::{ProxyAuth, Socks5Proxy};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use watcher::{SessionState, WatchSummary, Watcher};
