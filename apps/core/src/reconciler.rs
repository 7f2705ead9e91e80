//! Reconciler - periodically prunes index rows whose directory is gone.
//!
//! The watchers keep the index current while they see every event; this is
//! the safety net for deletions that happened while nothing was listening.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::scanner::disk_directory_names;
use crate::storage::IndexStore;

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Index rows looked at.
    pub checked: usize,
    /// Orphans deleted from the index.
    pub removed: Vec<String>,
}

/// Delete every index row whose name has no directory under `root`.
///
/// Fails without touching the index if `root` cannot be listed.
pub fn reconcile_once(root: &Path, store: &IndexStore) -> Result<ReconcileReport> {
    prune_missing(root, store, store.names()?)
}

/// Delete the names in `indexed` that have no directory under `root`.
///
/// The index must be read before the disk: a directory created in between
/// is then on disk but not in `indexed`, and survives.
fn prune_missing(
    root: &Path,
    store: &IndexStore,
    indexed: BTreeSet<String>,
) -> Result<ReconcileReport> {
    let on_disk = disk_directory_names(root)?;

    let mut report = ReconcileReport {
        checked: indexed.len(),
        removed: Vec::new(),
    };
    for name in indexed.difference(&on_disk) {
        if store.delete(name)? {
            info!("[Reconciler] Removed orphan {}", name);
            report.removed.push(name.clone());
        }
    }

    debug!(
        "[Reconciler] Checked {} entries, removed {}",
        report.checked,
        report.removed.len()
    );
    Ok(report)
}

/// Background thread running `reconcile_once` on a fixed interval.
pub struct Reconciler {
    cycles: Arc<AtomicU64>,
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Start the loop. The first cycle runs right away.
    pub fn spawn(root: PathBuf, store: Arc<IndexStore>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(EngineError::InvalidInterval(interval).into());
        }

        let (stop_tx, stop_rx) = channel::<()>();
        let cycles = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&cycles);

        let thread = thread::Builder::new()
            .name("reconciler".to_string())
            .spawn(move || loop {
                match reconcile_once(&root, &store) {
                    Ok(_) => {}
                    // Root unreadable (unmounted, permissions): skip this cycle.
                    Err(e) => warn!("[Reconciler] Cycle skipped: {:#}", e),
                }
                counter.fetch_add(1, Ordering::SeqCst);

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("Cannot spawn reconciler thread")?;

        info!("[Reconciler] Running every {:?}", interval);
        Ok(Self {
            cycles,
            stop_tx,
            thread: Some(thread),
        })
    }

    /// Number of completed cycles, including skipped ones.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Stop and join the loop. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.stop_tx.send(());
            if thread.join().is_err() {
                warn!("[Reconciler] Thread panicked");
            }
        }
    }
}

impl Drop for Reconciler {
    fn drop(&mut self) {
        self.stop();
    }
}
