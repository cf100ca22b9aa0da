//! IMAP implementation of [`MailboxSession`].
//!
//! [`ImapMailbox`] owns at most one authenticated session. Every network step
//! is bounded by a timeout from [`TimeoutConfig`](crate::config::TimeoutConfig);
//! a failed step leaves the caller to [`close`](MailboxSession::close) and
//! reconnect.

use crate::config::RelayConfig;
use crate::connection::Connector;
use crate::error::{Error, Result};
use crate::mailbox::{FolderStatus, MailboxSession, Notification};
use crate::message::MessageRecord;
use crate::session::{self, IdleOutcome, ImapSession};
use crate::shutdown::Shutdown;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Re-check interval for servers without IDLE.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Mailbox connection over IMAP with TLS.
pub struct ImapMailbox {
    config: RelayConfig,
    connector: Connector,
    session: Option<Box<ImapSession>>,
    idle_supported: bool,
}

impl ImapMailbox {
    /// Creates a disconnected mailbox for `config`.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            connector: Connector::new(),
            session: None,
            idle_supported: false,
        }
    }

    /// Returns `true` while a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    fn session_mut(&mut self) -> Result<&mut ImapSession> {
        self.session.as_deref_mut().ok_or(Error::NotConnected)
    }

    async fn poll(&mut self, timeout: Duration, shutdown: &Shutdown) -> Notification {
        tokio::select! {
            () = tokio::time::sleep(timeout.min(POLL_INTERVAL)) => {}
            () = shutdown.cancelled() => return Notification::Interrupted,
        }

        let noop_timeout = self.config.timeouts.fetch;
        let session = match self.session_mut() {
            Ok(session) => session,
            Err(e) => return Notification::Error(e),
        };
        match tokio::time::timeout(noop_timeout, session::noop(session)).await {
            Ok(Ok(())) => Notification::NewActivity,
            Ok(Err(e)) => Notification::Error(e),
            Err(_) => Notification::Error(Error::FetchTimeout {
                timeout: noop_timeout,
            }),
        }
    }
}

impl MailboxSession for ImapMailbox {
    #[instrument(
        name = "ImapMailbox::connect",
        skip_all,
        fields(
            email = %self.config.email(),
            imap_host = %self.config.effective_imap_host(),
            proxy_enabled = self.config.proxy.is_some()
        )
    )]
    async fn connect(&mut self) -> Result<()> {
        self.close().await;

        let imap_host = self.config.effective_imap_host();
        let target_addr = self.config.server_address();
        let timeouts = self.config.timeouts.clone();

        let tls_stream = tokio::time::timeout(
            timeouts.connect,
            self.connector
                .connect(&imap_host, &target_addr, self.config.proxy.as_ref()),
        )
        .await
        .map_err(|_| Error::ConnectTimeout {
            target: target_addr.clone(),
            timeout: timeouts.connect,
        })??;

        debug!("TLS connection established");

        let email = self.config.email();
        let (session, idle_supported) = tokio::time::timeout(timeouts.auth, async {
            let mut session =
                session::authenticate(tls_stream, email, self.config.password()).await?;
            let idle = session::supports_idle(&mut session).await?;
            Ok::<_, Error>((session, idle))
        })
        .await
        .map_err(|_| Error::AuthTimeout {
            email: email.to_string(),
            timeout: timeouts.auth,
        })??;

        if !idle_supported {
            warn!(
                poll_interval_secs = POLL_INTERVAL.as_secs(),
                "Server does not support IDLE, falling back to polling"
            );
        }
        self.idle_supported = idle_supported;
        self.session = Some(Box::new(session));

        debug!("Authenticated");
        Ok(())
    }

    async fn select_folder(&mut self, folder: &str) -> Result<FolderStatus> {
        let timeout = self.config.timeouts.select;
        let writable = self.config.mark_as_read;
        let session = self.session_mut()?;

        tokio::time::timeout(timeout, session::select_folder(session, folder, writable))
            .await
            .map_err(|_| Error::SelectTimeout {
                folder: folder.to_string(),
                timeout,
            })?
    }

    async fn await_notification(
        &mut self,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Notification {
        if !self.idle_supported {
            return self.poll(timeout, shutdown).await;
        }

        let Some(current) = self.session.take() else {
            return Notification::Error(Error::NotConnected);
        };

        match session::idle(*current, timeout, &self.config.timeouts, shutdown).await {
            Ok(Some((session, outcome))) => {
                self.session = Some(Box::new(session));
                match outcome {
                    IdleOutcome::NewData => Notification::NewActivity,
                    IdleOutcome::Timeout => Notification::TimedOut,
                    IdleOutcome::Interrupted => Notification::Interrupted,
                }
            }
            Ok(None) => {
                debug!("Shutdown while entering or leaving IDLE, dropping connection");
                Notification::Interrupted
            }
            Err(e) => Notification::Error(e),
        }
    }

    #[instrument(name = "ImapMailbox::fetch_unseen_since", skip(self))]
    async fn fetch_unseen_since(&mut self, marker: u32) -> Result<Vec<MessageRecord>> {
        let timeout = self.config.timeouts.fetch;
        let sender = self.config.allowed_sender().to_string();
        let session = self.session_mut()?;

        let sources = tokio::time::timeout(timeout, async {
            let uids = session::search_unseen_from(session, &sender, marker).await?;
            session::fetch_sources(session, &uids).await
        })
        .await
        .map_err(|_| Error::FetchTimeout { timeout })??;

        let records = sources
            .into_iter()
            .filter_map(|(uid, raw)| match MessageRecord::parse(uid, &raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(uid, error = %e, "Skipping unparseable message");
                    None
                }
            })
            .collect();

        Ok(records)
    }

    async fn mark_seen(&mut self, uid: u32) -> Result<()> {
        let timeout = self.config.timeouts.fetch;
        let session = self.session_mut()?;

        tokio::time::timeout(timeout, session::mark_seen(session, uid))
            .await
            .map_err(|_| Error::FetchTimeout { timeout })?
    }

    async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let logout_timeout = self.config.timeouts.logout;

        match tokio::time::timeout(logout_timeout, session::logout(&mut *session)).await {
            Ok(Ok(())) => debug!("Logged out"),
            Ok(Err(e)) => debug!(error = %e, "Logout failed, dropping connection"),
            Err(_) => debug!(
                timeout_secs = logout_timeout.as_secs(),
                "Logout timed out, dropping connection"
            ),
        }
    }
}

impl std::fmt::Debug for ImapMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapMailbox")
            .field("email", &self.config.email())
            .field("imap_host", &self.config.effective_imap_host())
            .field("connected", &self.session.is_some())
            .field("idle_supported", &self.idle_supported)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig::builder()
            .email("watcher@example.com")
            .password("secret")
            .allowed_sender("sender@example.com")
            .bot_token("token")
            .chat_id("1")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let mut mailbox = ImapMailbox::new(config());
        let (_trigger, shutdown) = crate::shutdown::channel();

        assert!(!mailbox.is_connected());
        assert!(matches!(
            mailbox.select_folder("INBOX").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            mailbox.fetch_unseen_since(0).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(mailbox.mark_seen(1).await, Err(Error::NotConnected)));

        mailbox.idle_supported = true;
        assert!(matches!(
            mailbox
                .await_notification(Duration::from_secs(1), &shutdown)
                .await,
            Notification::Error(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut mailbox = ImapMailbox::new(config());
        mailbox.close().await;
        mailbox.close().await;
        assert!(!mailbox.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_interrupted_by_shutdown() {
        let mut mailbox = ImapMailbox::new(config());
        let (trigger, shutdown) = crate::shutdown::channel();
        trigger.trigger();

        let notification = mailbox
            .await_notification(Duration::from_secs(600), &shutdown)
            .await;
        assert!(matches!(notification, Notification::Interrupted));
    }

    #[tokio::test]
    async fn test_debug_hides_password() {
        let mailbox = ImapMailbox::new(config());
        let debug_str = format!("{mailbox:?}");
        assert!(debug_str.contains("watcher@example.com"));
        assert!(!debug_str.contains("secret"));
    }
}
