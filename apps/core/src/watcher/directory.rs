//! Per-directory watcher: follows marker changes inside one content directory.
//!
//! Lifecycle is `Watching -> Stopping -> Stopped`. The registry registers the
//! OS watch and routes this directory's events into the worker's channel.
//! The worker leaves its loop when a terminal marker shows up, when the
//! directory itself is deleted, or when the registry asks it to stop. A
//! worker that stops on its own only reports `Finished`; the reaper drops
//! the OS watch and joins the thread, so the worker never waits on itself.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::registry::ReaperMessage;
use super::{changes, FsChange, WatchMessage};
use crate::status::{classify_marker, derive_state, Status};
use crate::storage::{IndexStore, UpdateOutcome};

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Stopped by the registry; the stopper joins us.
    Requested,
    Terminal(Status),
    Deleted,
    Disconnected,
}

struct Worker {
    id: u64,
    path: PathBuf,
    name: String,
    store: Arc<IndexStore>,
    rx: Receiver<WatchMessage>,
    reaper: Sender<ReaperMessage>,
}

/// Spawn the worker for `path`. The caller has already registered the OS watch.
pub(crate) fn spawn(
    id: u64,
    path: &Path,
    name: String,
    store: Arc<IndexStore>,
    reaper: Sender<ReaperMessage>,
) -> Result<(Sender<WatchMessage>, JoinHandle<()>)> {
    let (tx, rx) = channel();

    let worker = Worker {
        id,
        path: path.to_path_buf(),
        name,
        store,
        rx,
        reaper,
    };

    let thread = thread::Builder::new()
        .name(format!("watch-{}", id))
        .spawn(move || worker.run())
        .context("Cannot spawn directory watcher thread")?;

    Ok((tx, thread))
}

impl Worker {
    fn run(self) {
        let exit = self.watch_loop();
        debug!("[DirectoryWatcher] {} stopped ({:?})", self.name, exit);

        if exit != Exit::Requested {
            let _ = self.reaper.send(ReaperMessage::Finished {
                path: self.path.clone(),
                id: self.id,
            });
        }
    }

    fn watch_loop(&self) -> Exit {
        // A marker may have appeared between the bootstrap scan and the subscription.
        if let Some(exit) = self.apply(derive_state(&self.path)) {
            return exit;
        }

        while let Ok(message) = self.rx.recv() {
            match message {
                WatchMessage::Stop => return Exit::Requested,
                WatchMessage::Fs(Err(e)) => {
                    warn!("[DirectoryWatcher] Watch error for {}: {}", self.name, e);
                }
                WatchMessage::Fs(Ok(event)) => {
                    for change in changes(&event) {
                        if let Some(exit) = self.handle(change) {
                            return exit;
                        }
                    }
                }
            }
        }

        Exit::Disconnected
    }

    fn handle(&self, change: FsChange) -> Option<Exit> {
        match change {
            FsChange::Removed(path) if path == self.path => {
                info!("[DirectoryWatcher] {} was removed", self.name);
                Some(Exit::Deleted)
            }
            FsChange::Created(path) => {
                let status = self.marker_in_dir(&path)?;
                match path.try_exists() {
                    Ok(true) => {
                        info!("[DirectoryWatcher] .{} marker detected in {}", status, self.name);
                        self.apply(status)
                    }
                    // Gone again before we got here; the disk decides.
                    _ => self.rederive(),
                }
            }
            FsChange::Removed(path) => {
                self.marker_in_dir(&path)?;
                self.rederive()
            }
        }
    }

    /// Status of `path` if it is a marker directly inside the watched directory.
    fn marker_in_dir(&self, path: &Path) -> Option<Status> {
        if path.parent() != Some(self.path.as_path()) {
            return None;
        }
        path.file_name().and_then(classify_marker)
    }

    fn rederive(&self) -> Option<Exit> {
        if !self.path.is_dir() {
            return Some(Exit::Deleted);
        }
        self.apply(derive_state(&self.path))
    }

    fn apply(&self, status: Status) -> Option<Exit> {
        match self.store.update_status(&self.name, status) {
            Ok(UpdateOutcome::Updated) => {
                info!("[DirectoryWatcher] {} is now {}", self.name, status);
            }
            Ok(UpdateOutcome::Unchanged) => {}
            Ok(UpdateOutcome::Missing) => {
                debug!("[DirectoryWatcher] {} no longer indexed", self.name);
            }
            Err(e) => {
                warn!("[DirectoryWatcher] Cannot update {}: {:#}", self.name, e);
            }
        }

        if status.is_terminal() {
            info!("[DirectoryWatcher] Stopping watcher for {} ({})", self.name, status);
            Some(Exit::Terminal(status))
        } else {
            None
        }
    }
}
