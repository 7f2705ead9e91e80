//! Registry of live per-directory watchers.
//!
//! All directory watches share one notify watcher (one inotify instance on
//! Linux), owned here. A router thread hands each event to the worker of the
//! directory it belongs to. The OS watches and the path -> worker map sit
//! behind a single mutex, so duplicate starts for the same directory collapse
//! into one. Workers that stop on their own (terminal marker, directory
//! deleted) report to a reaper thread, which unwatches and joins them.
//! Threads are always joined outside the lock.

use anyhow::{Context, Result};
use notify::Event;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

use super::{directory, FileWatcher, WatchMessage};
use crate::scanner::entry_name;
use crate::storage::IndexStore;

type SharedTable = Arc<Mutex<WatchTable>>;

/// Sent to the reaper thread.
#[derive(Debug)]
pub(crate) enum ReaperMessage {
    /// A watcher left its loop by itself.
    Finished { path: PathBuf, id: u64 },
    Shutdown,
}

/// Handle to one running directory watcher.
struct WatcherHandle {
    /// Distinguishes a restarted watcher from the one it replaced.
    id: u64,
    tx: Sender<WatchMessage>,
    thread: JoinHandle<()>,
}

impl WatcherHandle {
    fn stop_and_join(self) {
        // The worker may already be gone; a failed send is fine.
        let _ = self.tx.send(WatchMessage::Stop);
        self.join();
    }

    fn join(self) {
        if self.thread.join().is_err() {
            warn!("[WatcherRegistry] Watcher thread {} panicked", self.id);
        }
    }
}

/// OS watches plus the workers they feed.
struct WatchTable {
    fs: FileWatcher,
    handles: HashMap<PathBuf, WatcherHandle>,
}

impl WatchTable {
    /// Remove the worker for `path` and drop its OS watch.
    fn take(&mut self, path: &Path) -> Option<WatcherHandle> {
        let handle = self.handles.remove(path)?;
        if let Err(e) = self.fs.unwatch(path) {
            // The kernel drops the watch itself when the directory is deleted.
            debug!("[WatcherRegistry] Unwatch {}: {}", path.display(), e);
        }
        Some(handle)
    }

    /// Workers an event concerns: the directory itself or the parent of a child entry.
    fn targets(&self, event: &Event) -> Vec<&WatcherHandle> {
        let mut targets: Vec<&WatcherHandle> = Vec::new();
        for path in &event.paths {
            let handle = self
                .handles
                .get(path)
                .or_else(|| path.parent().and_then(|parent| self.handles.get(parent)));
            if let Some(handle) = handle {
                if !targets.iter().any(|t| t.id == handle.id) {
                    targets.push(handle);
                }
            }
        }
        targets
    }
}

/// Keeps at most one watcher per content directory.
pub struct WatcherRegistry {
    store: Arc<IndexStore>,
    table: SharedTable,
    next_id: AtomicU64,
    router_tx: Sender<WatchMessage>,
    reaper_tx: Sender<ReaperMessage>,
    background: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WatcherRegistry {
    pub fn new(store: Arc<IndexStore>) -> Result<Self> {
        let (router_tx, router_rx) = channel();
        let (reaper_tx, reaper_rx) = channel();

        let table: SharedTable = Arc::new(Mutex::new(WatchTable {
            fs: FileWatcher::new(router_tx.clone())?,
            handles: HashMap::new(),
        }));

        let routes = Arc::clone(&table);
        let router = thread::Builder::new()
            .name("watch-router".to_string())
            .spawn(move || route(routes, router_rx))
            .context("Cannot spawn watcher router thread")?;

        let reaped = Arc::clone(&table);
        let reaper = thread::Builder::new()
            .name("watch-reaper".to_string())
            .spawn(move || reap(reaped, reaper_rx))
            .context("Cannot spawn watcher reaper thread")?;

        Ok(Self {
            store,
            table,
            next_id: AtomicU64::new(1),
            router_tx,
            reaper_tx,
            background: Mutex::new(vec![router, reaper]),
            closed: AtomicBool::new(false),
        })
    }

    /// Start a watcher on `path` unless a live one is already running.
    ///
    /// A worker that has already exited but was not reaped yet counts as
    /// absent and is replaced. Returns `true` if a new watcher was started.
    pub fn start_if_absent(&self, path: &Path) -> Result<bool> {
        let Some(name) = entry_name(path) else {
            return Ok(false);
        };

        let (result, stale) = {
            let mut table = self.table.lock();
            if self.closed.load(Ordering::SeqCst) {
                debug!("[WatcherRegistry] Closed, not watching {}", name);
                return Ok(false);
            }

            let finished = table.handles.get(path).map(|h| h.thread.is_finished());
            let stale = match finished {
                Some(false) => return Ok(false),
                Some(true) => table.take(path),
                None => None,
            };
            (self.spawn_locked(&mut table, path, name), stale)
        };

        if let Some(stale) = stale {
            stale.join();
        }
        result.map(|()| true)
    }

    fn spawn_locked(&self, table: &mut WatchTable, path: &Path, name: String) -> Result<()> {
        table
            .fs
            .watch(path)
            .with_context(|| format!("Cannot watch {}", path.display()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let spawned = directory::spawn(
            id,
            path,
            name.clone(),
            Arc::clone(&self.store),
            self.reaper_tx.clone(),
        );
        match spawned {
            Ok((tx, thread)) => {
                table
                    .handles
                    .insert(path.to_path_buf(), WatcherHandle { id, tx, thread });
                info!("[WatcherRegistry] Watching {}", name);
                Ok(())
            }
            Err(e) => {
                let _ = table.fs.unwatch(path);
                Err(e)
            }
        }
    }

    /// Stop and join the watcher on `path`, if any.
    ///
    /// Returns `true` if a watcher was registered.
    pub fn stop(&self, path: &Path) -> bool {
        let handle = self.table.lock().take(path);
        match handle {
            Some(handle) => {
                handle.stop_and_join();
                debug!("[WatcherRegistry] Stopped watcher for {}", path.display());
                true
            }
            None => false,
        }
    }

    /// Stop every watcher, the router and the reaper. Later starts are refused.
    pub fn stop_all(&self) {
        let drained: Vec<WatcherHandle> = {
            let mut table = self.table.lock();
            self.closed.store(true, Ordering::SeqCst);
            let paths: Vec<PathBuf> = table.handles.keys().cloned().collect();
            paths.iter().filter_map(|path| table.take(path)).collect()
        };

        if !drained.is_empty() {
            info!("[WatcherRegistry] Stopping {} watcher(s)", drained.len());
        }
        for handle in drained {
            handle.stop_and_join();
        }

        let background: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        if background.is_empty() {
            return;
        }
        let _ = self.router_tx.send(WatchMessage::Stop);
        let _ = self.reaper_tx.send(ReaperMessage::Shutdown);
        for thread in background {
            if thread.join().is_err() {
                warn!("[WatcherRegistry] Background thread panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().handles.is_empty()
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.table.lock().handles.contains_key(path)
    }

    /// Paths with a registered watcher, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.table.lock().handles.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl Drop for WatcherRegistry {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn route(table: SharedTable, rx: Receiver<WatchMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            WatchMessage::Stop => break,
            WatchMessage::Fs(Err(e)) => warn!("[WatcherRegistry] Watch error: {}", e),
            WatchMessage::Fs(Ok(event)) => {
                let table = table.lock();
                for handle in table.targets(&event) {
                    let _ = handle.tx.send(WatchMessage::Fs(Ok(event.clone())));
                }
            }
        }
    }
}

fn reap(table: SharedTable, rx: Receiver<ReaperMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            ReaperMessage::Shutdown => break,
            ReaperMessage::Finished { path, id } => {
                let handle = {
                    let mut table = table.lock();
                    // A newer watcher may already own this path.
                    let is_current = table.handles.get(&path).is_some_and(|h| h.id == id);
                    if is_current {
                        table.take(&path)
                    } else {
                        None
                    }
                };
                if let Some(handle) = handle {
                    handle.join();
                    debug!("[WatcherRegistry] Reaped watcher for {}", path.display());
                }
            }
        }
    }
}
