//! Root watcher: tracks content directories appearing in and vanishing from
//! the watched root.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::{changes, FileWatcher, FsChange, WatchMessage, WatcherRegistry};
use crate::scanner::{entry_name, is_trackable, load_one};
use crate::storage::IndexStore;

pub struct RootWatcher {
    stop_tx: Sender<WatchMessage>,
    thread: Option<JoinHandle<()>>,
}

impl RootWatcher {
    /// Subscribe to `root` and start handling its events.
    pub fn start(
        root: &Path,
        store: Arc<IndexStore>,
        registry: Arc<WatcherRegistry>,
    ) -> Result<Self> {
        let (tx, rx) = channel();

        let mut watcher = FileWatcher::new(tx.clone())?;
        watcher
            .watch(root)
            .with_context(|| format!("Cannot watch root {}", root.display()))?;

        let worker = RootWorker {
            root: root.to_path_buf(),
            store,
            registry,
        };
        let thread = thread::Builder::new()
            .name("watch-root".to_string())
            .spawn(move || {
                worker.run(rx);
                drop(watcher);
            })
            .context("Cannot spawn root watcher thread")?;

        info!("[RootWatcher] Watching {}", root.display());
        Ok(Self {
            stop_tx: tx,
            thread: Some(thread),
        })
    }

    /// Stop and join the worker. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop_tx.send(WatchMessage::Stop);
            if thread.join().is_err() {
                warn!("[RootWatcher] Worker thread panicked");
            }
            debug!("[RootWatcher] Stopped");
        }
    }
}

impl Drop for RootWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct RootWorker {
    root: PathBuf,
    store: Arc<IndexStore>,
    registry: Arc<WatcherRegistry>,
}

impl RootWorker {
    fn run(&self, rx: Receiver<WatchMessage>) {
        while let Ok(message) = rx.recv() {
            let event = match message {
                WatchMessage::Stop => return,
                WatchMessage::Fs(Ok(event)) => event,
                WatchMessage::Fs(Err(e)) => {
                    warn!("[RootWatcher] Watch error: {}", e);
                    continue;
                }
            };

            for change in changes(&event) {
                match change {
                    FsChange::Removed(path) if path == self.root => {
                        error!(
                            "[RootWatcher] Root {} was removed; no longer watching it",
                            self.root.display()
                        );
                        return;
                    }
                    FsChange::Created(path) if self.is_child(&path) => self.on_created(&path),
                    FsChange::Removed(path) if self.is_child(&path) => self.on_removed(&path),
                    _ => {}
                }
            }
        }
    }

    fn is_child(&self, path: &Path) -> bool {
        path.parent() == Some(self.root.as_path())
    }

    fn on_created(&self, path: &Path) {
        let loaded = match load_one(path, &self.store) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return,
            Err(e) => {
                warn!("[RootWatcher] Cannot index {}: {:#}", path.display(), e);
                return;
            }
        };

        info!("[RootWatcher] New directory {} ({})", loaded.name, loaded.status);
        if loaded.status.is_terminal() {
            return;
        }
        if let Err(e) = self.registry.start_if_absent(path) {
            warn!("[RootWatcher] Cannot watch {}: {:#}", loaded.name, e);
        }
    }

    fn on_removed(&self, path: &Path) {
        let Some(name) = entry_name(path) else {
            return;
        };

        // Hidden or reserved entries are never indexed, but a stray watcher is still stopped.
        if is_trackable(&name) {
            match self.store.delete(&name) {
                Ok(true) => info!("[RootWatcher] Removed {} from index", name),
                Ok(false) => {}
                Err(e) => warn!("[RootWatcher] Cannot remove {}: {:#}", name, e),
            }
        }
        self.registry.stop(path);
    }
}
