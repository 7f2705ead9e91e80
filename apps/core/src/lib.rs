//! markerwatch Core Library
//!
//! Keeps a SQLite index of the content directories under one watched root,
//! each tagged with the pipeline status its marker subdirectories encode.
//! Provides the following capabilities:
//! - Derive and mutate status through hidden marker entries (`.dupe`, `.uploading`, ...)
//! - Bootstrap the index from disk at startup
//! - Keep it live with a root watcher and one watcher per unfinished directory
//! - Prune records of deleted directories on a slow reconciliation cadence
//!
//! Pipeline: Bootstrap (full scan) -> Watch (events) -> Reconcile (periodic) -> Read (index)

pub mod config;
pub mod engine;
pub mod error;
pub mod reconciler;
pub mod scanner;
pub mod status;
pub mod storage;
pub mod watcher;

// Re-export main types
pub use config::Config;
pub use engine::{apply_reset, apply_status, Engine};
pub use error::EngineError;
pub use reconciler::{reconcile_once, ReconcileReport, Reconciler};
pub use scanner::{load_all, load_one, snapshot, LoadedDirectory, ScanSummary};
pub use status::{classify_marker, clear_state, derive_state, set_state, Status, TimestampGuard};
pub use storage::{records_to_json, DirectoryRecord, IndexStore, UpdateOutcome, UpsertOutcome};
pub use watcher::{FileWatcher, RootWatcher, WatcherRegistry};
