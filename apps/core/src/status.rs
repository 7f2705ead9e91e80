//! Status protocol - how a content directory's pipeline state is encoded on disk.
//!
//! State lives in hidden marker entries inside the content directory:
//! `.dupe`, `.uploading`, `.uploaded`, `.failed`. Markers are checked in that
//! fixed priority order, so a worker that crashes mid-transition and leaves
//! two markers behind resolves to the more exceptional one.
//!
//! Nothing in here touches the index; callers update the cache themselves.

use anyhow::{Context, Result};
use filetime::FileTime;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::EngineError;

/// Pipeline state of one content directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No marker present (unprocessed).
    #[default]
    None,
    Uploading,
    Uploaded,
    Dupe,
    Failed,
}

/// Marker names in priority order (first match wins).
const MARKERS: [(Status, &str); 4] = [
    (Status::Dupe, ".dupe"),
    (Status::Uploading, ".uploading"),
    (Status::Uploaded, ".uploaded"),
    (Status::Failed, ".failed"),
];

/// Markers left behind by older workers; only removed on reset.
const LEGACY_MARKERS: [&str; 1] = [".processing"];

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Dupe => "dupe",
            Self::Failed => "failed",
        }
    }

    /// Name of the marker entry encoding this status, if any.
    pub fn marker_name(&self) -> Option<&'static str> {
        MARKERS
            .iter()
            .find(|(status, _)| status == self)
            .map(|(_, marker)| *marker)
    }

    /// Terminal statuses are not expected to change without outside help,
    /// so their directories are no longer watched.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Uploaded | Self::Dupe | Self::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "uploading" => Ok(Self::Uploading),
            "uploaded" => Ok(Self::Uploaded),
            "dupe" => Ok(Self::Dupe),
            "failed" => Ok(Self::Failed),
            _ => Err(EngineError::UnknownStatus(s.to_string())),
        }
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Derive the status of `dir` from the markers present inside it.
///
/// A marker whose presence cannot be checked counts as absent.
pub fn derive_state(dir: &Path) -> Status {
    for (status, marker) in MARKERS.iter() {
        let path = dir.join(marker);
        match path.try_exists() {
            Ok(true) => return *status,
            Ok(false) => {}
            Err(e) => warn!("[StatusProtocol] Cannot check {}: {}", path.display(), e),
        }
    }
    Status::None
}

/// Classify an entry name created inside a content directory.
///
/// Only exact marker names count; `release.dupe` is content, not a marker.
pub fn classify_marker(file_name: &OsStr) -> Option<Status> {
    MARKERS
        .iter()
        .find(|(_, marker)| OsStr::new(marker) == file_name)
        .map(|(status, _)| *status)
}

/// Replace whatever markers `dir` carries with the single marker for `new`.
///
/// `Status::None` removes every marker and creates nothing. The directory's
/// own access and modification times survive the change.
pub fn set_state(dir: &Path, new: Status) -> Result<()> {
    let guard = TimestampGuard::capture(dir)?;

    for (status, marker) in MARKERS {
        if status != new {
            remove_marker(&dir.join(marker))?;
        }
    }

    if let Some(marker) = new.marker_name() {
        let marker_path = dir.join(marker);
        fs::create_dir_all(&marker_path)
            .with_context(|| format!("Cannot create marker: {}", marker_path.display()))?;
        debug!("[StatusProtocol] Created marker {}", marker_path.display());
    }

    guard.restore()
}

/// Remove every marker, legacy ones included. Timestamps are preserved.
pub fn clear_state(dir: &Path) -> Result<()> {
    let guard = TimestampGuard::capture(dir)?;

    let all = MARKERS
        .iter()
        .map(|(_, marker)| *marker)
        .chain(LEGACY_MARKERS);
    for marker in all {
        remove_marker(&dir.join(marker))?;
    }

    guard.restore()
}

fn remove_marker(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| format!("Cannot inspect marker: {}", path.display()))
        }
    };

    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
    .with_context(|| format!("Cannot remove marker: {}", path.display()))?;

    debug!("[StatusProtocol] Removed marker {}", path.display());
    Ok(true)
}

/// Snapshot of a directory's atime/mtime, put back on `restore` or on drop.
///
/// Adding or removing a child entry bumps the parent's mtime; external tools
/// key off the content directory's own mtime, so every marker mutation runs
/// inside one of these.
#[derive(Debug)]
pub struct TimestampGuard {
    dir: PathBuf,
    atime: FileTime,
    mtime: FileTime,
    armed: bool,
}

impl TimestampGuard {
    pub fn capture(dir: &Path) -> Result<Self> {
        let meta = fs::metadata(dir)
            .with_context(|| format!("Cannot read timestamps of {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            atime: FileTime::from_last_access_time(&meta),
            mtime: FileTime::from_last_modification_time(&meta),
            armed: true,
        })
    }

    /// Restore now and report failure to the caller.
    pub fn restore(mut self) -> Result<()> {
        self.armed = false;
        filetime::set_file_times(&self.dir, self.atime, self.mtime)
            .with_context(|| format!("Cannot restore timestamps of {}", self.dir.display()))
    }
}

impl Drop for TimestampGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = filetime::set_file_times(&self.dir, self.atime, self.mtime) {
                warn!(
                    "[StatusProtocol] Cannot restore timestamps of {}: {}",
                    self.dir.display(),
                    e
                );
            }
        }
    }
}
