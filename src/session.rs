//! Internal IMAP session operations.
//!
//! Thin wrappers over async-imap that attach error context and log each
//! exchange. Timeouts are applied by the caller, except around IDLE, which
//! bounds its own commands.

use crate::config::TimeoutConfig;
use crate::connection::TlsStream;
use crate::error::{Error, Result};
use crate::mailbox::FolderStatus;
use crate::shutdown::Shutdown;
use async_imap::extensions::idle::{Handle, IdleResponse};
use async_imap::imap_proto::Response;
use async_imap::types::UnsolicitedResponse;
use async_imap::Session;
use futures::TryStreamExt;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

/// Type alias for IMAP session over TLS.
pub(crate) type ImapSession = Session<TlsStream>;

/// Byte streams an IMAP session can run over.
pub(crate) trait ImapStream: AsyncRead + AsyncWrite + Unpin + Debug + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Debug + Send> ImapStream for T {}

/// How an IDLE wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleOutcome {
    NewData,
    Timeout,
    Interrupted,
}

/// Logs in over an established stream.
#[instrument(name = "session::authenticate", skip_all, fields(email = %email))]
pub(crate) async fn authenticate<S: ImapStream>(
    stream: S,
    email: &str,
    password: &str,
) -> Result<Session<S>> {
    let client = async_imap::Client::new(stream);

    debug!("Authenticating to IMAP server");

    client
        .login(email, password)
        .await
        .map_err(|(source, _client)| {
            Error::from_imap(source, |source| Error::ImapLogin {
                email: email.to_string(),
                source,
            })
        })
}

/// Returns `true` if the server advertises the IDLE extension.
#[instrument(name = "session::supports_idle", skip_all)]
pub(crate) async fn supports_idle<S: ImapStream>(session: &mut Session<S>) -> Result<bool> {
    let capabilities = session
        .capabilities()
        .await
        .map_err(|source| Error::from_imap(source, |source| Error::ImapCapabilities { source }))?;

    let idle = capabilities.has_str("IDLE");
    debug!(idle, "Queried server capabilities");
    Ok(idle)
}

/// Opens `folder`, read-write when `writable`, otherwise with EXAMINE.
#[instrument(name = "session::select", skip(session), fields(folder = %folder))]
pub(crate) async fn select_folder<S: ImapStream>(
    session: &mut Session<S>,
    folder: &str,
    writable: bool,
) -> Result<FolderStatus> {
    let result = if writable {
        session.select(folder).await
    } else {
        session.examine(folder).await
    };
    let mailbox = result.map_err(|source| {
        Error::from_imap(source, |source| Error::SelectFolder {
            folder: folder.to_string(),
            source,
        })
    })?;

    let status = FolderStatus {
        uid_validity: mailbox.uid_validity,
        uid_next: mailbox.uid_next,
        exists: mailbox.exists,
    };
    debug!(
        uid_validity = ?status.uid_validity,
        uid_next = ?status.uid_next,
        exists = status.exists,
        "Folder opened"
    );
    Ok(status)
}

/// Searches unseen messages from `sender` with a UID above `after_uid`, ascending.
#[instrument(name = "session::search_unseen", skip(session))]
pub(crate) async fn search_unseen_from<S: ImapStream>(
    session: &mut Session<S>,
    sender: &str,
    after_uid: u32,
) -> Result<Vec<u32>> {
    let query = unseen_query(sender, after_uid);
    let uids = session
        .uid_search(&query)
        .await
        .map_err(|source| Error::from_imap(source, |source| Error::ImapSearch { source }))?;

    // `n:*` always matches the highest UID, even when it is below `n`.
    let mut uids: Vec<u32> = uids.into_iter().filter(|uid| *uid > after_uid).collect();
    uids.sort_unstable();

    debug!(uid_count = uids.len(), "Search complete");
    Ok(uids)
}

/// Fetches full message sources without setting `\Seen`.
#[instrument(name = "session::fetch", skip_all, fields(uid_count = uids.len()))]
pub(crate) async fn fetch_sources<S: ImapStream>(
    session: &mut Session<S>,
    uids: &[u32],
) -> Result<Vec<(u32, Vec<u8>)>> {
    if uids.is_empty() {
        return Ok(Vec::new());
    }

    let uid_set = uid_set(uids);
    let wrap = |source| {
        Error::from_imap(source, |source| Error::ImapFetch {
            uid_set: uid_set.clone(),
            source,
        })
    };

    let fetches: Vec<async_imap::types::Fetch> = session
        .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
        .await
        .map_err(wrap)?
        .try_collect()
        .await
        .map_err(wrap)?;

    let mut sources: Vec<(u32, Vec<u8>)> = fetches
        .iter()
        .filter_map(|fetch| Some((fetch.uid?, fetch.body()?.to_vec())))
        .collect();
    sources.sort_unstable_by_key(|(uid, _)| *uid);

    debug!(fetched = sources.len(), "Fetched message sources");
    Ok(sources)
}

/// Sets `\Seen` on one message.
#[instrument(name = "session::mark_seen", skip(session))]
pub(crate) async fn mark_seen<S: ImapStream>(session: &mut Session<S>, uid: u32) -> Result<()> {
    let wrap = |source| Error::from_imap(source, |source| Error::ImapStore { uid, source });

    let _updates: Vec<async_imap::types::Fetch> = session
        .uid_store(uid.to_string(), r"+FLAGS (\Seen)")
        .await
        .map_err(wrap)?
        .try_collect()
        .await
        .map_err(wrap)?;

    Ok(())
}

/// Sends NOOP so the server reports pending changes.
pub(crate) async fn noop<S: ImapStream>(session: &mut Session<S>) -> Result<()> {
    session
        .noop()
        .await
        .map_err(|source| Error::from_imap(source, |source| Error::ImapNoop { source }))
}

/// Enters IDLE until new data, `timeout`, or shutdown, then leaves it.
///
/// Changes reported outside the wait (during earlier commands, before the
/// server accepted IDLE, or while leaving it) count as new data. The IDLE
/// command and its DONE must complete within `limits.fetch`; after a
/// shutdown interrupted the wait, DONE gets `limits.logout` instead.
///
/// IDLE consumes the session; it is handed back only if DONE succeeds.
/// Returns `None` when shutdown interrupts IDLE or DONE, abandoning the
/// connection.
#[instrument(name = "session::idle", skip_all, fields(timeout = ?timeout))]
pub(crate) async fn idle<S: ImapStream>(
    session: Session<S>,
    timeout: Duration,
    limits: &TimeoutConfig,
    shutdown: &Shutdown,
) -> Result<Option<(Session<S>, IdleOutcome)>> {
    let pending = session.unsolicited_responses.clone();
    if drain_new_mail(|| pending.try_recv().ok()) {
        debug!("Changes reported before IDLE, skipping wait");
        return Ok(Some((session, IdleOutcome::NewData)));
    }

    let mut handle = session.idle();
    if bounded("IDLE", limits.fetch, Some(shutdown), handle.init())
        .await?
        .is_none()
    {
        return Ok(None);
    }
    debug!("Entered IDLE");

    let mut outcome = if drain_new_mail(|| pending.try_recv().ok()) {
        IdleOutcome::NewData
    } else {
        wait_for_activity(&mut handle, timeout, shutdown).await?
    };

    let left = if outcome == IdleOutcome::Interrupted {
        bounded("DONE", limits.logout, None, handle.done()).await?
    } else {
        bounded("DONE", limits.fetch, Some(shutdown), handle.done()).await?
    };
    let Some(session) = left else {
        return Ok(None);
    };
    if drain_new_mail(|| pending.try_recv().ok()) && outcome == IdleOutcome::Timeout {
        outcome = IdleOutcome::NewData;
    }

    debug!(?outcome, "Left IDLE");
    Ok(Some((session, outcome)))
}

/// Waits inside IDLE. The deadline covers the whole wait; server keepalives do not extend it.
async fn wait_for_activity<S: ImapStream>(
    handle: &mut Handle<S>,
    timeout: Duration,
    shutdown: &Shutdown,
) -> Result<IdleOutcome> {
    let (wait, stop) = handle.wait_with_timeout(timeout);
    tokio::pin!(wait);

    let cut_short = tokio::select! {
        response = &mut wait => return response.map(classify).map_err(idle_error),
        () = tokio::time::sleep(timeout) => IdleOutcome::Timeout,
        () = shutdown.cancelled() => IdleOutcome::Interrupted,
    };

    drop(stop);
    match wait.await.map_err(idle_error)? {
        IdleResponse::NewData(_) => Ok(IdleOutcome::NewData),
        IdleResponse::Timeout | IdleResponse::ManualInterrupt => Ok(cut_short),
    }
}

fn classify(response: IdleResponse) -> IdleOutcome {
    match response {
        IdleResponse::NewData(_) => IdleOutcome::NewData,
        IdleResponse::Timeout => IdleOutcome::Timeout,
        IdleResponse::ManualInterrupt => IdleOutcome::Interrupted,
    }
}

/// Runs one IDLE-related command under `limit`, racing `shutdown` if given.
/// `None` means shutdown won.
async fn bounded<T>(
    command: &'static str,
    limit: Duration,
    shutdown: Option<&Shutdown>,
    future: impl Future<Output = async_imap::error::Result<T>>,
) -> Result<Option<T>> {
    let future = tokio::time::timeout(limit, future);
    let finished = match shutdown {
        Some(shutdown) => shutdown.run_until_cancelled(future).await,
        None => Some(future.await),
    };
    match finished {
        None => Ok(None),
        Some(Err(_)) => Err(Error::IdleTimeout {
            command,
            timeout: limit,
        }),
        Some(Ok(result)) => result.map(Some).map_err(idle_error),
    }
}

fn idle_error(source: async_imap::error::Error) -> Error {
    Error::from_imap(source, |source| Error::ImapIdle { source })
}

/// Empties the unsolicited response queue; `true` if any entry signals new or changed mail.
fn drain_new_mail(mut next: impl FnMut() -> Option<UnsolicitedResponse>) -> bool {
    let mut new_mail = false;
    while let Some(response) = next() {
        match response {
            UnsolicitedResponse::Exists(count) => {
                debug!(count, "Unsolicited EXISTS");
                new_mail = true;
            }
            UnsolicitedResponse::Other(ref data) if matches!(data.parsed(), Response::Fetch(..)) => {
                debug!("Unsolicited FETCH");
                new_mail = true;
            }
            _ => {}
        }
    }
    new_mail
}

/// Logs out from IMAP session.
#[instrument(name = "session::logout", skip(session))]
pub(crate) async fn logout<S: ImapStream>(session: &mut Session<S>) -> Result<()> {
    debug!("Logging out");

    session
        .logout()
        .await
        .map_err(|source| Error::ImapLogout { source })
}

/// Builds the UID SEARCH query for unseen mail from `sender` after `after_uid`.
fn unseen_query(sender: &str, after_uid: u32) -> String {
    let escaped = sender.replace('\\', "\\\\").replace('"', "\\\"");
    format!("UNSEEN FROM \"{escaped}\" UID {}:*", after_uid.saturating_add(1))
}

/// Joins UIDs into an IMAP sequence set.
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
