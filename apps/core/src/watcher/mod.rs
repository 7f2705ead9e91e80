//! File System Watchers
//!
//! Event-driven monitoring of the watched root and of every content directory
//! that has not reached a terminal state yet. The root has its own notify
//! watcher; the content directories share one owned by the registry. Notify
//! callbacks only forward events into a channel, so no index or registry work
//! ever runs on the notify thread.

pub mod directory;
pub mod registry;
pub mod root;

pub use registry::WatcherRegistry;
pub use root::RootWatcher;

use anyhow::Result;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;

/// Message delivered to a watcher worker thread.
#[derive(Debug)]
pub enum WatchMessage {
    /// Event (or backend error) from notify.
    Fs(notify::Result<Event>),
    /// Unsubscribe and exit.
    Stop,
}

/// Non-recursive OS watches that forward into one channel.
///
/// Dropping it deregisters every watch it holds.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Create a watcher whose events are sent to `tx`.
    pub fn new(tx: Sender<WatchMessage>) -> Result<Self> {
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = tx.send(WatchMessage::Fs(res));
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        Ok(Self { watcher })
    }

    /// Start watching a directory (immediate children only).
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher.watch(path, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    /// Stop watching a directory. Fails if the kernel already dropped the watch.
    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher.unwatch(path)?;
        Ok(())
    }
}

/// What happened to one path, with renames split into their two halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FsChange {
    Created(PathBuf),
    Removed(PathBuf),
}

/// Reduce a notify event to the create/remove changes the watchers act on.
pub(crate) fn changes(event: &Event) -> Vec<FsChange> {
    let paths = event.paths.iter().cloned();
    match event.kind {
        EventKind::Create(_) => paths.map(FsChange::Created).collect(),
        EventKind::Remove(_) => paths.map(FsChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(FsChange::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(FsChange::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            FsChange::Removed(event.paths[0].clone()),
            FsChange::Created(event.paths[1].clone()),
        ],
        // Backends that cannot tell the halves apart: ask the filesystem.
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .map(|p| {
                if p.exists() {
                    FsChange::Created(p)
                } else {
                    FsChange::Removed(p)
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}
