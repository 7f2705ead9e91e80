//! Engine - wires the index, bootstrapper, watchers and reconciler together.
//!
//! Startup order:
//! 1. validate and canonicalize the root
//! 2. open the index
//! 3. start the root watcher
//! 4. bootstrap every directory already on disk
//! 5. start watchers for the non-terminal ones
//! 6. start the reconciler
//!
//! The root watcher goes up before the bootstrap scan so that a directory
//! created mid-scan is seen by at least one of the two; the upsert and
//! `start_if_absent` absorb the duplicate.

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::EngineError;
use crate::reconciler::{reconcile_once, ReconcileReport, Reconciler};
use crate::scanner::{ensure_root, is_trackable, load_all, load_one};
use crate::status::{clear_state, derive_state, set_state, Status};
use crate::storage::{DirectoryRecord, IndexStore, UpdateOutcome};
use crate::watcher::{RootWatcher, WatcherRegistry};

pub struct Engine {
    root: PathBuf,
    store: Arc<IndexStore>,
    registry: Arc<WatcherRegistry>,
    root_watcher: Option<RootWatcher>,
    reconciler: Option<Reconciler>,
}

impl Engine {
    /// Start from a validated config.
    pub fn start(config: &Config) -> Result<Self> {
        config.validate()?;
        Self::start_with(
            config.root()?,
            &config.index_path,
            config.reconcile_interval(),
        )
    }

    pub fn start_with(root: &Path, index_path: &Path, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(EngineError::InvalidInterval(interval).into());
        }
        ensure_root(root)?;
        // Event paths are built from the watched path; keep one spelling of it.
        let root = root
            .canonicalize()
            .with_context(|| format!("Cannot resolve watched root: {}", root.display()))?;

        let store = Arc::new(IndexStore::open(index_path)?);
        if store.is_fresh() {
            info!("[Engine] Building index from scratch");
        }
        let registry = Arc::new(WatcherRegistry::new(Arc::clone(&store))?);
        let root_watcher = RootWatcher::start(&root, Arc::clone(&store), Arc::clone(&registry))?;

        let summary = load_all(&root, &store)?;
        for dir in summary.pending() {
            if let Err(e) = registry.start_if_absent(&dir.path) {
                warn!("[Engine] Cannot watch {}: {:#}", dir.name, e);
            }
        }

        let reconciler = Reconciler::spawn(root.clone(), Arc::clone(&store), interval)?;

        info!(
            "[Engine] Started on {} ({} directories, {} watched)",
            root.display(),
            summary.loaded.len(),
            registry.len()
        );

        Ok(Self {
            root,
            store,
            registry,
            root_watcher: Some(root_watcher),
            reconciler: Some(reconciler),
        })
    }

    /// Canonical watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WatcherRegistry> {
        &self.registry
    }

    /// Cached records, insertion order.
    pub fn list_all(&self) -> Result<Vec<DirectoryRecord>> {
        self.store.list_all()
    }

    /// Run one orphan sweep now, outside the reconciler's schedule.
    pub fn reconcile_now(&self) -> Result<ReconcileReport> {
        reconcile_once(&self.root, &self.store)
    }

    /// Completed background reconciliation cycles.
    pub fn reconcile_cycles(&self) -> u64 {
        self.reconciler.as_ref().map_or(0, Reconciler::cycles)
    }

    /// Force `name` into `status` on disk and in the index.
    ///
    /// A non-terminal status gets a watcher again.
    pub fn set_status(&self, name: &str, status: Status) -> Result<()> {
        self.with_watcher_paused(name, |path| mark(&self.store, path, name, status))
    }

    /// Drop every marker (legacy ones too) from `name`.
    pub fn reset_status(&self, name: &str) -> Result<()> {
        self.with_watcher_paused(name, |path| unmark(&self.store, path, name))
    }

    /// Run a marker mutation with no watcher on the directory.
    ///
    /// A live watcher could still hold events from before the mutation and
    /// write a stale status afterwards, so it is stopped and joined first.
    /// A new one starts if the directory ends up non-terminal, even when the
    /// mutation failed halfway.
    fn with_watcher_paused(
        &self,
        name: &str,
        mutate: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<()> {
        let path = content_path(&self.root, name)?;
        self.registry.stop(&path);

        let result = mutate(&path);
        if !derive_state(&path).is_terminal() {
            self.registry.start_if_absent(&path)?;
        }
        result
    }

    /// Stop every background thread. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(mut root_watcher) = self.root_watcher.take() {
            root_watcher.stop();
        }
        self.registry.stop_all();
        if let Some(mut reconciler) = self.reconciler.take() {
            reconciler.stop();
            info!("[Engine] Stopped");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Set markers and index row for `name` without a running engine.
///
/// Returns the directory path.
pub fn apply_status(root: &Path, store: &IndexStore, name: &str, status: Status) -> Result<PathBuf> {
    let path = content_path(root, name)?;
    mark(store, &path, name, status)?;
    Ok(path)
}

/// Clear every marker of `name` without a running engine.
pub fn apply_reset(root: &Path, store: &IndexStore, name: &str) -> Result<PathBuf> {
    let path = content_path(root, name)?;
    unmark(store, &path, name)?;
    Ok(path)
}

fn mark(store: &IndexStore, path: &Path, name: &str, status: Status) -> Result<()> {
    set_state(path, status)?;
    record_status(store, path, name, status)?;
    info!("[Engine] {} set to {}", name, status);
    Ok(())
}

fn unmark(store: &IndexStore, path: &Path, name: &str) -> Result<()> {
    clear_state(path)?;
    record_status(store, path, name, Status::None)?;
    info!("[Engine] {} reset", name);
    Ok(())
}

fn record_status(store: &IndexStore, path: &Path, name: &str, status: Status) -> Result<()> {
    if store.update_status(name, status)? == UpdateOutcome::Missing {
        debug!("[Engine] {} was not indexed yet, loading it", name);
        load_one(path, store)?;
    }
    Ok(())
}

/// Resolve `name` to a tracked content directory directly under `root`.
fn content_path(root: &Path, name: &str) -> Result<PathBuf> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    let path = root.join(name);
    if !single || !is_trackable(name) || !path.is_dir() {
        return Err(EngineError::UnknownDirectory(name.to_string()).into());
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, PathBuf, IndexStore)> {
        let dir = TempDir::new()?;
        let root = dir.path().join("root");
        fs::create_dir(&root)?;
        let store = IndexStore::open(&dir.path().join("index.db"))?;
        Ok((dir, root, store))
    }

    #[test]
    fn test_content_path_rejects_bad_names() -> Result<()> {
        let (_dir, root, _store) = setup()?;
        fs::create_dir(root.join("Movie"))?;
        fs::create_dir(root.join(".hidden"))?;
        fs::create_dir(root.join("COMPLETE"))?;
        fs::write(root.join("notes.txt"), "x")?;

        assert_eq!(content_path(&root, "Movie")?, root.join("Movie"));
        for name in ["", "..", "../root", "Movie/.dupe", ".hidden", "COMPLETE", "notes.txt", "Nope"] {
            let err = content_path(&root, name).unwrap_err();
            assert!(
                matches!(err.downcast_ref::<EngineError>(), Some(EngineError::UnknownDirectory(_))),
                "{name:?} should be rejected"
            );
        }
        Ok(())
    }

    #[test]
    fn test_apply_status_indexes_unknown_directory() -> Result<()> {
        let (_dir, root, store) = setup()?;
        fs::create_dir(root.join("Show"))?;

        apply_status(&root, &store, "Show", Status::Failed)?;
        assert_eq!(derive_state(&root.join("Show")), Status::Failed);
        assert_eq!(store.get("Show")?.expect("record").status, Status::Failed);
        Ok(())
    }

    #[test]
    fn test_apply_reset_clears_markers() -> Result<()> {
        let (_dir, root, store) = setup()?;
        let show = root.join("Show");
        fs::create_dir(&show)?;
        fs::create_dir(show.join(".processing"))?;
        apply_status(&root, &store, "Show", Status::Dupe)?;

        apply_reset(&root, &store, "Show")?;
        assert_eq!(derive_state(&show), Status::None);
        assert!(!show.join(".processing").exists());
        assert_eq!(store.get("Show")?.expect("record").status, Status::None);
        Ok(())
    }

    #[test]
    fn test_start_rejects_bad_config() -> Result<()> {
        let (dir, root, _store) = setup()?;
        let index = dir.path().join("engine.db");

        let err = Engine::start_with(&root, &index, Duration::ZERO).err().expect("error");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidInterval(_))
        ));

        let err = Engine::start_with(&dir.path().join("missing"), &index, Duration::from_secs(60))
            .err()
            .expect("error");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::RootMissing(_))
        ));
        Ok(())
    }
}
