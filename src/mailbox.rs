//! The mailbox seam between the watch loop and the IMAP transport.
//!
//! [`crate::ImapMailbox`] is the production implementation; tests drive the
//! watcher with scripted fakes.

use crate::error::{Error, Result};
use crate::message::MessageRecord;
use crate::shutdown::Shutdown;
use std::time::Duration;

/// Result of waiting for server activity.
#[derive(Debug)]
pub enum Notification {
    /// The server reported a change in the folder.
    NewActivity,
    /// The wait reached its bound without activity.
    TimedOut,
    /// Shutdown was requested during the wait.
    Interrupted,
    /// The wait failed; the connection must be re-established.
    Error(Error),
}

/// Folder state reported on selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FolderStatus {
    /// UIDVALIDITY of the folder, if reported.
    pub uid_validity: Option<u32>,
    /// Predicted next UID, if reported.
    pub uid_next: Option<u32>,
    /// Number of messages in the folder.
    pub exists: u32,
}

/// A live mailbox connection.
///
/// One connection at a time: `connect` replaces any previous one and
/// `close` is safe to call when nothing is open.
#[allow(async_fn_in_trait)]
pub trait MailboxSession {
    /// Opens the transport and authenticates.
    async fn connect(&mut self) -> Result<()>;

    /// Selects the watched folder.
    async fn select_folder(&mut self, folder: &str) -> Result<FolderStatus>;

    /// Blocks until activity, `timeout`, or shutdown.
    async fn await_notification(&mut self, timeout: Duration, shutdown: &Shutdown)
        -> Notification;

    /// Returns unseen messages from the allowed sender with a UID above
    /// `marker`, in ascending UID order.
    async fn fetch_unseen_since(&mut self, marker: u32) -> Result<Vec<MessageRecord>>;

    /// Flags one message `\Seen`.
    async fn mark_seen(&mut self, uid: u32) -> Result<()>;

    /// Releases the connection. Idempotent.
    async fn close(&mut self);
}
