//! The watch loop: a supervised state machine over one [`MailboxSession`].
//!
//! ```text
//! Disconnected --connect ok--> Authenticated --select ok--> Idling
//! Idling --new activity--> Fetching --records processed--> Idling
//! Idling --timed out--> Idling
//! any failure --> Disconnected (after backoff)
//! shutdown --> Closing --> Terminated
//! ```
//!
//! Every selection is followed by one fetch pass so mail that arrived while
//! disconnected is picked up. The UID marker survives reconnects; it is
//! rebased when the folder's UIDVALIDITY changes.

use crate::backoff::Backoff;
use crate::config::RelayConfig;
use crate::error::{Error, ErrorCategory};
use crate::expiry::ExpirySchedule;
use crate::filter::CodeFilter;
use crate::liveness::Heartbeat;
use crate::mailbox::{FolderStatus, MailboxSession, Notification};
use crate::message::MessageRecord;
use crate::notifier::{DeliveryContext, Notifier};
use crate::shutdown::Shutdown;
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Watch loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection; waiting out backoff or about to connect.
    Disconnected,
    /// Connection attempt in progress.
    Connecting,
    /// Logged in, folder not yet selected.
    Authenticated,
    /// Waiting for server activity.
    Idling,
    /// Retrieving and processing new messages.
    Fetching,
    /// Shutdown requested; releasing the connection.
    Closing,
    /// Finished.
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Idling => "idling",
            Self::Fetching => "fetching",
            Self::Closing => "closing",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Counters reported when the loop terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    /// Codes delivered.
    pub delivered: u64,
    /// Codes whose delivery failed.
    pub delivery_failures: u64,
    /// Transitions into `Disconnected` after a failure.
    pub reconnects: u64,
}

/// Highest processed UID within one UIDVALIDITY epoch.
#[derive(Debug, Clone, Copy, Default)]
struct UidMarker {
    last_uid: u32,
    uid_validity: Option<u32>,
}

impl UidMarker {
    fn rebase(&mut self, status: &FolderStatus) {
        match (self.uid_validity, status.uid_validity) {
            (Some(known), Some(current)) if known != current => {
                let rebased = status.uid_next.map_or(0, |next| next.saturating_sub(1));
                warn!(
                    previous_validity = known,
                    current_validity = current,
                    previous_marker = self.last_uid,
                    marker = rebased,
                    "Folder UIDVALIDITY changed, rebasing marker"
                );
                self.last_uid = rebased;
            }
            _ => {}
        }
        if status.uid_validity.is_some() {
            self.uid_validity = status.uid_validity;
        }
    }

    fn advance(&mut self, uid: u32) {
        self.last_uid = self.last_uid.max(uid);
    }
}

/// Supervises a mailbox session and relays extracted codes.
pub struct Watcher<M, N> {
    mailbox: M,
    notifier: N,
    filter: CodeFilter,
    folder: String,
    idle_timeout: Duration,
    mark_as_read: bool,
    abort_batch_on_failure: bool,
    backoff: Backoff,
    heartbeat: Heartbeat,
    expiry: Option<ExpirySchedule>,
    state: SessionState,
    marker: UidMarker,
    summary: WatchSummary,
}

impl<M: MailboxSession, N: Notifier> Watcher<M, N> {
    /// Creates a watcher in the `Disconnected` state.
    #[must_use]
    pub fn new(config: &RelayConfig, mailbox: M, notifier: N) -> Self {
        Self {
            mailbox,
            notifier,
            filter: CodeFilter::new(config.allowed_sender(), config.code_matcher().clone()),
            folder: config.folder.clone(),
            idle_timeout: config.idle_timeout,
            mark_as_read: config.mark_as_read,
            abort_batch_on_failure: config.abort_batch_on_delivery_failure,
            backoff: Backoff::new(config.backoff.clone()),
            heartbeat: Heartbeat::new(&config.heartbeat_file),
            expiry: None,
            state: SessionState::Disconnected,
            marker: UidMarker::default(),
            summary: WatchSummary::default(),
        }
    }

    /// Schedules delivered codes for expiry.
    #[must_use]
    pub fn with_expiry(mut self, schedule: ExpirySchedule) -> Self {
        self.expiry = Some(schedule);
        self
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs until `shutdown` fires, then closes the session.
    ///
    /// Session failures never end the loop; they lead to a reconnect after backoff.
    #[instrument(name = "Watcher::run", skip_all, fields(folder = %self.folder))]
    pub async fn run(mut self, shutdown: Shutdown) -> WatchSummary {
        info!(
            allowed_sender = %self.filter.allowed_sender(),
            idle_timeout_secs = self.idle_timeout.as_secs(),
            mark_as_read = self.mark_as_read,
            "Watch loop started"
        );

        let mut catch_up = false;
        while !shutdown.is_triggered() {
            let flow = match self.state {
                SessionState::Disconnected | SessionState::Connecting => {
                    self.connect(&shutdown).await
                }
                SessionState::Authenticated => {
                    let flow = self.select(&shutdown).await;
                    catch_up = self.state == SessionState::Idling;
                    flow
                }
                SessionState::Idling if catch_up => {
                    catch_up = false;
                    self.set_state(SessionState::Fetching);
                    ControlFlow::Continue(())
                }
                SessionState::Idling => self.idle(&shutdown).await,
                SessionState::Fetching => self.fetch(&shutdown).await,
                SessionState::Closing | SessionState::Terminated => ControlFlow::Break(()),
            };
            if flow.is_break() {
                break;
            }
        }

        self.set_state(SessionState::Closing);
        self.mailbox.close().await;
        self.set_state(SessionState::Terminated);

        info!(
            delivered = self.summary.delivered,
            delivery_failures = self.summary.delivery_failures,
            reconnects = self.summary.reconnects,
            "Watch loop stopped"
        );
        self.summary
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "Session state changed");
            self.state = next;
        }
    }

    async fn connect(&mut self, shutdown: &Shutdown) -> ControlFlow<()> {
        self.set_state(SessionState::Connecting);
        match shutdown.run_until_cancelled(self.mailbox.connect()).await {
            None => ControlFlow::Break(()),
            Some(Ok(())) => {
                self.backoff.reset();
                self.set_state(SessionState::Authenticated);
                ControlFlow::Continue(())
            }
            Some(Err(e)) => self.fail(e, shutdown).await,
        }
    }

    async fn select(&mut self, shutdown: &Shutdown) -> ControlFlow<()> {
        match shutdown
            .run_until_cancelled(self.mailbox.select_folder(&self.folder))
            .await
        {
            None => ControlFlow::Break(()),
            Some(Ok(status)) => {
                self.marker.rebase(&status);
                debug!(
                    exists = status.exists,
                    marker = self.marker.last_uid,
                    "Folder selected"
                );
                self.set_state(SessionState::Idling);
                ControlFlow::Continue(())
            }
            Some(Err(e)) => self.fail(e, shutdown).await,
        }
    }

    async fn idle(&mut self, shutdown: &Shutdown) -> ControlFlow<()> {
        match self
            .mailbox
            .await_notification(self.idle_timeout, shutdown)
            .await
        {
            Notification::NewActivity => {
                self.set_state(SessionState::Fetching);
                ControlFlow::Continue(())
            }
            Notification::TimedOut => {
                debug!("Idle wait timed out, connection re-affirmed");
                self.beat();
                ControlFlow::Continue(())
            }
            Notification::Interrupted => ControlFlow::Break(()),
            Notification::Error(e) => self.fail(e, shutdown).await,
        }
    }

    async fn fetch(&mut self, shutdown: &Shutdown) -> ControlFlow<()> {
        let marker = self.marker.last_uid;
        match shutdown
            .run_until_cancelled(self.mailbox.fetch_unseen_since(marker))
            .await
        {
            None => ControlFlow::Break(()),
            Some(Ok(records)) => {
                debug!(count = records.len(), marker, "Fetched new messages");
                self.process(records, shutdown).await;
                if shutdown.is_triggered() {
                    return ControlFlow::Break(());
                }
                self.set_state(SessionState::Idling);
                self.beat();
                ControlFlow::Continue(())
            }
            Some(Err(e)) => self.fail(e, shutdown).await,
        }
    }

    /// Filters and delivers records one at a time, in order.
    async fn process(&mut self, records: Vec<MessageRecord>, shutdown: &Shutdown) {
        let total = records.len();
        for (index, record) in records.into_iter().enumerate() {
            if shutdown.is_triggered() {
                debug!(remaining = total - index, "Shutdown requested, leaving batch");
                return;
            }

            let uid = record.uid;
            let Some(extraction) = self.filter.evaluate(&record) else {
                self.marker.advance(uid);
                continue;
            };
            info!(uid, received_at = %extraction.received_at, "Code extracted");

            let context = DeliveryContext {
                uid,
                received_at: extraction.received_at,
            };
            match self
                .notifier
                .send(&extraction.code, &context, shutdown)
                .await
            {
                Ok(delivery) => {
                    self.summary.delivered += 1;
                    info!(
                        uid,
                        attempts = delivery.attempts,
                        message_id = ?delivery.message_id,
                        "Code delivered"
                    );
                    if let (Some(expiry), Some(message_id)) = (&self.expiry, delivery.message_id)
                    {
                        expiry.schedule(message_id, extraction.received_at);
                    }
                    if self.mark_as_read {
                        if let Err(e) = self.mailbox.mark_seen(uid).await {
                            warn!(uid, error = %e, "Failed to mark message as seen");
                        }
                    }
                    self.marker.advance(uid);
                }
                Err(Error::DeliveryInterrupted { attempts }) => {
                    self.summary.delivery_failures += 1;
                    warn!(uid, attempts, "Delivery interrupted by shutdown");
                    return;
                }
                Err(e) => {
                    self.summary.delivery_failures += 1;
                    error!(uid, error = %e, retryable = e.is_retryable(), "Code delivery failed");

                    if self.abort_batch_on_failure {
                        // Transient failures stay behind the marker and are retried on the next fetch.
                        if !e.is_retryable() {
                            self.marker.advance(uid);
                        }
                        warn!(remaining = total - index - 1, "Aborting batch after delivery failure");
                        return;
                    }
                    self.marker.advance(uid);
                }
            }
        }
    }

    /// Tears down the session and waits out the backoff delay.
    async fn fail(&mut self, error: Error, shutdown: &Shutdown) -> ControlFlow<()> {
        let category = error.category();
        if category == ErrorCategory::Authentication {
            error!(error = %error, %category, "Authentication failed");
        } else {
            warn!(error = %error, %category, state = %self.state, "Session failed");
        }

        self.mailbox.close().await;
        self.set_state(SessionState::Disconnected);
        self.summary.reconnects += 1;

        let delay = self.backoff.next_delay();
        warn!(
            attempt = self.backoff.retries(),
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting after delay"
        );

        match shutdown
            .run_until_cancelled(tokio::time::sleep(delay))
            .await
        {
            Some(()) => ControlFlow::Continue(()),
            None => ControlFlow::Break(()),
        }
    }

    fn beat(&self) {
        if let Err(e) = self.heartbeat.beat() {
            warn!(error = %e, "Failed to update liveness marker");
        }
    }
}

impl<M, N> std::fmt::Debug for Watcher<M, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("folder", &self.folder)
            .field("state", &self.state)
            .field("marker", &self.marker)
            .field("backoff", &self.backoff)
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(uid_validity: u32, uid_next: u32) -> FolderStatus {
        FolderStatus {
            uid_validity: Some(uid_validity),
            uid_next: Some(uid_next),
            exists: 0,
        }
    }

    #[test]
    fn test_marker_kept_for_same_validity() {
        let mut marker = UidMarker::default();
        marker.rebase(&status(10, 50));
        assert_eq!(marker.last_uid, 0);

        marker.advance(42);
        marker.rebase(&status(10, 60));
        assert_eq!(marker.last_uid, 42);
    }

    #[test]
    fn test_marker_rebased_on_validity_change() {
        let mut marker = UidMarker::default();
        marker.rebase(&status(10, 50));
        marker.advance(49);

        marker.rebase(&status(11, 7));
        assert_eq!(marker.last_uid, 6);
        assert_eq!(marker.uid_validity, Some(11));
    }

    #[test]
    fn test_marker_never_moves_backwards() {
        let mut marker = UidMarker::default();
        marker.advance(5);
        marker.advance(3);
        assert_eq!(marker.last_uid, 5);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idling.to_string(), "idling");
        assert_eq!(SessionState::Terminated.to_string(), "terminated");
    }
}
