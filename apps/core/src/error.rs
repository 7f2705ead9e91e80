//! Operator-facing errors.
//!
//! Most of the crate returns `anyhow::Result` with context attached at the
//! I/O and database boundaries. The variants here are the failures an
//! operator has to act on (bad configuration, unknown names), so callers can
//! `downcast_ref::<EngineError>()` to tell them apart from transient noise.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("watched root does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("watched root is not a directory: {0}")]
    RootNotDirectory(PathBuf),

    #[error("watched root is not configured")]
    RootNotConfigured,

    #[error("reconciliation interval must be greater than zero (got {0:?})")]
    InvalidInterval(Duration),

    #[error("unknown status '{0}'")]
    UnknownStatus(String),

    #[error("directory '{0}' is not tracked under the watched root")]
    UnknownDirectory(String),
}
