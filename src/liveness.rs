//! Liveness marker read by the external health check.
//!
//! The marker file holds a single Unix timestamp in seconds. Writes go to a
//! sibling temporary file which is then renamed over the marker, so a
//! concurrent reader sees either the old or the new value.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::trace;

/// Default marker location.
pub const DEFAULT_HEARTBEAT_FILE: &str = "/tmp/otp-relay.heartbeat";

/// Writes the liveness marker.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    path: PathBuf,
}

impl Heartbeat {
    /// Creates a heartbeat writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the marker path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrites the marker with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LivenessIo`] if the marker cannot be written.
    pub fn beat(&self) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let staging = self.staging_path();

        std::fs::write(&staging, now.timestamp().to_string())
            .and_then(|()| std::fs::rename(&staging, &self.path))
            .map_err(|source| Error::LivenessIo {
                path: self.path.clone(),
                source,
            })?;

        trace!(path = %self.path.display(), timestamp = now.timestamp(), "Liveness marker updated");
        Ok(now)
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

/// Reads the time recorded in a marker file.
///
/// # Errors
///
/// Returns [`Error::LivenessIo`] if the file cannot be read and
/// [`Error::LivenessMalformed`] if it does not hold a timestamp.
pub fn read_marker(path: &Path) -> Result<DateTime<Utc>> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::LivenessIo {
        path: path.to_path_buf(),
        source,
    })?;

    content
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| Error::LivenessMalformed {
            path: path.to_path_buf(),
            content: content.trim().to_string(),
        })
}

/// Age of the marker relative to `now`. A marker from the future counts as fresh.
///
/// # Errors
///
/// See [`read_marker`].
pub fn marker_age(path: &Path, now: DateTime<Utc>) -> Result<Duration> {
    let recorded = read_marker(path)?;
    Ok((now - recorded).to_std().unwrap_or(Duration::ZERO))
}
