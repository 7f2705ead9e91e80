//! Bootstrapper - walks the watched root and loads directory states into the index.
//!
//! `load_all` is the only full walk the engine needs; after startup the
//! watchers keep the index current and `load_one` handles single new
//! directories.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, SubsecRound};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::status::{derive_state, Status};
use crate::storage::{DirectoryRecord, IndexStore, UpsertOutcome};

/// Root-level names that are never content directories.
pub const RESERVED_NAMES: [&str; 1] = ["COMPLETE"];

/// Whether a root-level entry name can be a tracked content directory.
pub fn is_trackable(name: &str) -> bool {
    !name.starts_with('.') && !RESERVED_NAMES.contains(&name)
}

/// A directory that was loaded into the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDirectory {
    pub path: PathBuf,
    pub name: String,
    pub status: Status,
    pub outcome: UpsertOutcome,
}

/// Result of a full bootstrap pass.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub loaded: Vec<LoadedDirectory>,
    /// Entries that could not be read and were left for a later pass.
    pub skipped: usize,
}

impl ScanSummary {
    pub fn inserted(&self) -> usize {
        self.count(UpsertOutcome::Inserted)
    }

    pub fn updated(&self) -> usize {
        self.count(UpsertOutcome::Updated)
    }

    fn count(&self, outcome: UpsertOutcome) -> usize {
        self.loaded.iter().filter(|d| d.outcome == outcome).count()
    }

    /// Loaded directories that still need a watcher.
    pub fn pending(&self) -> impl Iterator<Item = &LoadedDirectory> {
        self.loaded.iter().filter(|d| !d.status.is_terminal())
    }
}

/// Check that the watched root exists and is a directory.
pub fn ensure_root(root: &Path) -> Result<()> {
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::RootNotDirectory(root.to_path_buf()).into()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(EngineError::RootMissing(root.to_path_buf()).into())
        }
        Err(e) => Err(e).with_context(|| format!("Cannot read watched root: {}", root.display())),
    }
}

/// Load every trackable directory under `root` into the index.
pub fn load_all(root: &Path, store: &IndexStore) -> Result<ScanSummary> {
    ensure_root(root)?;
    debug!("[Bootstrapper] Loading directories from {}", root.display());

    let entries = fs::read_dir(root)
        .with_context(|| format!("Cannot list watched root: {}", root.display()))?;

    let mut summary = ScanSummary::default();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("[Bootstrapper] Cannot read entry in {}: {}", root.display(), e);
                summary.skipped += 1;
                continue;
            }
        };

        let path = entry.path();
        match load_one(&path, store) {
            Ok(Some(loaded)) => summary.loaded.push(loaded),
            Ok(None) => {}
            Err(e) => {
                warn!("[Bootstrapper] Skipping {}: {:#}", path.display(), e);
                summary.skipped += 1;
            }
        }
    }

    info!(
        "[Bootstrapper] {} directories processed ({} new, {} updated, {} skipped)",
        summary.loaded.len(),
        summary.inserted(),
        summary.updated(),
        summary.skipped
    );
    Ok(summary)
}

/// Load one directory. Returns `None` when `path` is not a trackable directory.
pub fn load_one(path: &Path, store: &IndexStore) -> Result<Option<LoadedDirectory>> {
    let Some(name) = entry_name(path) else {
        return Ok(None);
    };
    if !is_trackable(&name) {
        return Ok(None);
    }

    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        // Gone again before we got to it; the delete event will follow.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Cannot stat {}", path.display())),
    };
    if !meta.is_dir() {
        return Ok(None);
    }

    let status = derive_state(path);
    let outcome = store.upsert(&name, status, creation_date(&meta))?;

    Ok(Some(LoadedDirectory {
        path: path.to_path_buf(),
        name,
        status,
        outcome,
    }))
}

/// Records computed straight from disk, newest first. Bypasses the index.
pub fn snapshot(root: &Path) -> Result<Vec<DirectoryRecord>> {
    ensure_root(root)?;

    let mut records = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry_name(&path) else {
            continue;
        };
        if !is_trackable(&name) {
            continue;
        }
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => meta,
            _ => continue,
        };
        records.push(DirectoryRecord {
            name,
            status: derive_state(&path),
            creation_date: creation_date(&meta),
        });
    }

    sort_newest_first(&mut records);
    Ok(records)
}

pub fn sort_newest_first(records: &mut [DirectoryRecord]) {
    records.sort_by(|a, b| {
        b.creation_date
            .cmp(&a.creation_date)
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Names of every directory directly under `root` (hidden ones included).
pub fn disk_directory_names(root: &Path) -> Result<BTreeSet<String>> {
    let entries = fs::read_dir(root)
        .with_context(|| format!("Cannot list watched root: {}", root.display()))?;

    let mut names = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry_name(&entry.path()) {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Directory creation time as local wall-clock seconds.
///
/// Falls back to mtime on filesystems that do not record birth time.
pub fn creation_date(meta: &fs::Metadata) -> NaiveDateTime {
    let time = meta
        .created()
        .or_else(|_| meta.modified())
        .unwrap_or_else(|_| SystemTime::now());
    let local: DateTime<Local> = time.into();
    local.naive_local().trunc_subsecs(0)
}

/// UTF-8 base name of `path`; non-UTF-8 names cannot be index keys.
pub(crate) fn entry_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?;
    match file_name.to_str() {
        Some(name) => Some(name.to_string()),
        None => {
            warn!("[Bootstrapper] Ignoring non UTF-8 name: {}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> Result<(TempDir, PathBuf, IndexStore)> {
        let tmp = TempDir::new()?;
        let root = tmp.path().join("data");
        fs::create_dir(&root)?;
        let store = IndexStore::open(&tmp.path().join("index").join("directories.db"))?;
        Ok((tmp, root, store))
    }

    #[test]
    fn test_trackable_names() {
        assert!(is_trackable("Movie.2024.1080p"));
        assert!(!is_trackable(".uploading"));
        assert!(!is_trackable(".hidden"));
        assert!(!is_trackable("COMPLETE"));
    }

    #[test]
    fn test_load_all_matches_disk_state() -> Result<()> {
        let (_tmp, root, store) = setup()?;
        fs::create_dir(root.join("ReleaseA"))?;
        fs::create_dir_all(root.join("ReleaseB").join(".dupe"))?;
        fs::create_dir_all(root.join("ReleaseC").join(".uploading"))?;
        fs::create_dir(root.join(".trash"))?;
        fs::create_dir(root.join("COMPLETE"))?;
        fs::write(root.join("notes.txt"), "not a directory")?;

        let summary = load_all(&root, &store)?;
        assert_eq!(summary.loaded.len(), 3);
        assert_eq!(summary.inserted(), 3);

        let names = store.names()?;
        let expected: BTreeSet<String> = ["ReleaseA", "ReleaseB", "ReleaseC"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);

        for record in store.list_all()? {
            assert_eq!(record.status, derive_state(&root.join(&record.name)));
        }

        let pending: Vec<&str> = summary.pending().map(|d| d.name.as_str()).collect();
        assert!(pending.contains(&"ReleaseA"));
        assert!(pending.contains(&"ReleaseC"));
        assert!(!pending.contains(&"ReleaseB"));
        Ok(())
    }

    #[test]
    fn test_load_all_twice_is_idempotent() -> Result<()> {
        let (_tmp, root, store) = setup()?;
        fs::create_dir(root.join("ReleaseA"))?;

        load_all(&root, &store)?;
        let before = store.get("ReleaseA")?;
        let summary = load_all(&root, &store)?;

        assert_eq!(summary.inserted(), 0);
        assert_eq!(summary.updated(), 0);
        assert_eq!(store.count()?, 1);
        assert_eq!(store.get("ReleaseA")?, before);
        Ok(())
    }

    #[test]
    fn test_load_all_picks_up_status_change() -> Result<()> {
        let (_tmp, root, store) = setup()?;
        fs::create_dir(root.join("ReleaseA"))?;
        load_all(&root, &store)?;

        fs::create_dir(root.join("ReleaseA").join(".failed"))?;
        let summary = load_all(&root, &store)?;

        assert_eq!(summary.updated(), 1);
        assert_eq!(store.get("ReleaseA")?.map(|r| r.status), Some(Status::Failed));
        Ok(())
    }

    #[test]
    fn test_missing_root_is_config_error() -> Result<()> {
        let (tmp, _root, store) = setup()?;
        let missing = tmp.path().join("nope");

        let err = load_all(&missing, &store).expect_err("missing root must fail");
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::RootMissing(_))
        ));
        Ok(())
    }

    #[test]
    fn test_load_one_ignores_files_and_reserved() -> Result<()> {
        let (_tmp, root, store) = setup()?;
        fs::write(root.join("file.nfo"), "")?;
        fs::create_dir(root.join("COMPLETE"))?;

        assert!(load_one(&root.join("file.nfo"), &store)?.is_none());
        assert!(load_one(&root.join("COMPLETE"), &store)?.is_none());
        assert!(load_one(&root.join("vanished"), &store)?.is_none());
        assert_eq!(store.count()?, 0);
        Ok(())
    }

    #[test]
    fn test_snapshot_reads_disk() -> Result<()> {
        let (_tmp, root, _store) = setup()?;
        fs::create_dir_all(root.join("ReleaseA").join(".uploaded"))?;
        fs::create_dir(root.join("ReleaseB"))?;
        fs::create_dir(root.join(".hidden"))?;

        let records = snapshot(&root)?;
        assert_eq!(records.len(), 2);
        let a = records.iter().find(|r| r.name == "ReleaseA").expect("ReleaseA listed");
        assert_eq!(a.status, Status::Uploaded);
        Ok(())
    }

    #[test]
    fn test_sort_newest_first() {
        let at = |s: &str| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").expect("date");
        let mut records = vec![
            DirectoryRecord { name: "old".into(), status: Status::None, creation_date: at("2024-01-01 00:00:00") },
            DirectoryRecord { name: "new".into(), status: Status::None, creation_date: at("2024-06-01 00:00:00") },
        ];
        sort_newest_first(&mut records);
        assert_eq!(records[0].name, "new");
    }

    #[test]
    fn test_disk_directory_names_include_hidden() -> Result<()> {
        let (_tmp, root, _store) = setup()?;
        fs::create_dir(root.join("ReleaseA"))?;
        fs::create_dir(root.join(".hidden"))?;
        fs::write(root.join("file"), "")?;

        let names = disk_directory_names(&root)?;
        assert_eq!(names.len(), 2);
        assert!(names.contains("ReleaseA"));
        Ok(())
    }
}
