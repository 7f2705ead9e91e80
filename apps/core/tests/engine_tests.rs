//! End-to-end tests for the engine against the real notify backend.
//!
//! Filesystem events arrive asynchronously, so every assertion about watcher
//! effects polls with a generous deadline.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use markerwatch_core::{
    derive_state, reconcile_once, set_state, Engine, IndexStore, Status, WatcherRegistry,
};

const DEADLINE: Duration = Duration::from_secs(15);
const RECONCILE: Duration = Duration::from_secs(3600);

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    done()
}

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    index: PathBuf,
}

fn fixture() -> Result<Fixture> {
    let dir = TempDir::new()?;
    let root = dir.path().join("incoming");
    fs::create_dir(&root)?;
    let root = root.canonicalize()?;
    let index = dir.path().join("state").join("directories.db");
    Ok(Fixture {
        _dir: dir,
        root,
        index,
    })
}

fn status_of(engine: &Engine, name: &str) -> Option<Status> {
    engine.store().get(name).ok().flatten().map(|r| r.status)
}

fn mkdir(path: &Path) -> Result<()> {
    fs::create_dir(path)?;
    Ok(())
}

#[test]
fn test_release_lifecycle() -> Result<()> {
    let fx = fixture()?;
    let mut engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;
    let release = fx.root.join("ReleaseA");

    mkdir(&release)?;
    assert!(wait_until(|| status_of(&engine, "ReleaseA") == Some(Status::None)));
    assert!(wait_until(|| engine.registry().is_watching(&release)));

    mkdir(&release.join(".uploading"))?;
    assert!(wait_until(|| status_of(&engine, "ReleaseA") == Some(Status::Uploading)));
    assert!(engine.registry().is_watching(&release));

    mkdir(&release.join(".uploaded"))?;
    assert!(wait_until(|| status_of(&engine, "ReleaseA") == Some(Status::Uploaded)));
    assert!(wait_until(|| !engine.registry().is_watching(&release)));

    fs::remove_dir_all(&release)?;
    assert!(wait_until(|| status_of(&engine, "ReleaseA").is_none()));

    engine.shutdown();
    Ok(())
}

#[test]
fn test_existing_dupe_is_not_watched() -> Result<()> {
    let fx = fixture()?;
    let release = fx.root.join("ReleaseB");
    mkdir(&release)?;
    mkdir(&release.join(".dupe"))?;
    let pending = fx.root.join("ReleaseC");
    mkdir(&pending)?;

    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;

    assert_eq!(status_of(&engine, "ReleaseB"), Some(Status::Dupe));
    assert_eq!(status_of(&engine, "ReleaseC"), Some(Status::None));
    assert!(!engine.registry().is_watching(&release));
    assert!(engine.registry().is_watching(&pending));
    Ok(())
}

#[test]
fn test_hidden_and_reserved_names_skipped() -> Result<()> {
    let fx = fixture()?;
    mkdir(&fx.root.join(".partial"))?;
    mkdir(&fx.root.join("COMPLETE"))?;
    fs::write(fx.root.join("readme.txt"), "not a directory")?;

    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;
    mkdir(&fx.root.join("Visible"))?;

    assert!(wait_until(|| status_of(&engine, "Visible").is_some()));
    let names: Vec<String> = engine.list_all()?.into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Visible".to_string()]);
    Ok(())
}

#[test]
fn test_orphans_healed_after_downtime() -> Result<()> {
    let fx = fixture()?;
    for name in ["A", "B"] {
        mkdir(&fx.root.join(name))?;
    }

    {
        let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;
        assert_eq!(engine.store().count()?, 2);
    }

    // Deleted while nothing was listening.
    fs::remove_dir(fx.root.join("B"))?;

    let store = IndexStore::open(&fx.index)?;
    assert!(!store.is_fresh());
    let report = reconcile_once(&fx.root, &store)?;
    assert_eq!(report.removed, vec!["B".to_string()]);
    assert_eq!(store.names()?.into_iter().collect::<Vec<_>>(), vec!["A".to_string()]);
    Ok(())
}

#[test]
fn test_background_reconciler_prunes() -> Result<()> {
    let fx = fixture()?;
    let store = IndexStore::open(&fx.index)?;
    store.upsert(
        "Ghost",
        Status::Uploaded,
        chrono::Local::now().naive_local(),
    )?;
    drop(store);

    let engine = Engine::start_with(&fx.root, &fx.index, Duration::from_millis(200))?;
    assert!(wait_until(|| engine.reconcile_cycles() >= 1));
    assert!(wait_until(|| status_of(&engine, "Ghost").is_none()));
    Ok(())
}

#[test]
fn test_watcher_start_is_idempotent() -> Result<()> {
    let fx = fixture()?;
    let store = std::sync::Arc::new(IndexStore::open(&fx.index)?);
    let registry = WatcherRegistry::new(store)?;
    let release = fx.root.join("ReleaseD");
    mkdir(&release)?;

    let started: Vec<bool> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| registry.start_if_absent(&release)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("thread").expect("start"))
            .collect()
    });

    assert_eq!(started.iter().filter(|s| **s).count(), 1);
    assert_eq!(registry.len(), 1);
    registry.stop_all();
    assert!(registry.is_empty());
    Ok(())
}

#[test]
fn test_marker_removal_rederives() -> Result<()> {
    let fx = fixture()?;
    let release = fx.root.join("ReleaseE");
    mkdir(&release)?;
    mkdir(&release.join(".uploading"))?;

    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;
    assert_eq!(status_of(&engine, "ReleaseE"), Some(Status::Uploading));
    assert!(engine.registry().is_watching(&release));

    fs::remove_dir(release.join(".uploading"))?;
    assert!(wait_until(|| status_of(&engine, "ReleaseE") == Some(Status::None)));
    assert!(engine.registry().is_watching(&release));
    Ok(())
}

#[test]
fn test_set_and_reset_status() -> Result<()> {
    let fx = fixture()?;
    let release = fx.root.join("ReleaseF");
    mkdir(&release)?;
    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;

    engine.set_status("ReleaseF", Status::Uploaded)?;
    assert_eq!(derive_state(&release), Status::Uploaded);
    assert_eq!(status_of(&engine, "ReleaseF"), Some(Status::Uploaded));
    assert!(wait_until(|| !engine.registry().is_watching(&release)));

    engine.reset_status("ReleaseF")?;
    assert_eq!(derive_state(&release), Status::None);
    assert_eq!(status_of(&engine, "ReleaseF"), Some(Status::None));
    assert!(engine.registry().is_watching(&release));

    assert!(engine.set_status("Missing", Status::Dupe).is_err());
    Ok(())
}

#[test]
fn test_rename_relabels() -> Result<()> {
    let fx = fixture()?;
    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;

    let before = fx.root.join("Old.Name");
    mkdir(&before)?;
    assert!(wait_until(|| status_of(&engine, "Old.Name").is_some()));

    let after = fx.root.join("New.Name");
    fs::rename(&before, &after)?;
    assert!(wait_until(|| status_of(&engine, "New.Name").is_some()));
    assert!(wait_until(|| status_of(&engine, "Old.Name").is_none()));
    assert!(wait_until(|| engine.registry().is_watching(&after)));
    assert!(wait_until(|| !engine.registry().is_watching(&before)));

    set_state(&after, Status::Failed)?;
    assert!(wait_until(|| status_of(&engine, "New.Name") == Some(Status::Failed)));
    Ok(())
}

#[test]
fn test_repeated_set_then_reset_settles_on_none() -> Result<()> {
    let fx = fixture()?;
    let release = fx.root.join("ReleaseG");
    mkdir(&release)?;
    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;

    for _ in 0..10 {
        engine.set_status("ReleaseG", Status::Uploaded)?;
        engine.reset_status("ReleaseG")?;
    }

    // Give any event still in flight time to land.
    thread::sleep(Duration::from_millis(500));
    assert_eq!(derive_state(&release), Status::None);
    assert_eq!(status_of(&engine, "ReleaseG"), Some(Status::None));
    assert!(engine.registry().is_watching(&release));
    assert_eq!(engine.registry().len(), 1);
    Ok(())
}

#[test]
fn test_deleting_watched_directories() -> Result<()> {
    let fx = fixture()?;
    let idle = fx.root.join("ReleaseH");
    let busy = fx.root.join("ReleaseI");
    mkdir(&idle)?;
    mkdir(&busy)?;
    mkdir(&busy.join(".uploading"))?;

    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;
    assert!(engine.registry().is_watching(&idle));
    assert!(engine.registry().is_watching(&busy));

    fs::remove_dir_all(&idle)?;
    fs::remove_dir_all(&busy)?;

    assert!(wait_until(|| status_of(&engine, "ReleaseH").is_none()));
    assert!(wait_until(|| status_of(&engine, "ReleaseI").is_none()));
    assert!(wait_until(|| !engine.registry().is_watching(&idle)));
    assert!(wait_until(|| !engine.registry().is_watching(&busy)));
    assert!(engine.registry().is_empty());
    Ok(())
}

#[test]
fn test_hundreds_of_directories_watched() -> Result<()> {
    let fx = fixture()?;
    for i in 0..300 {
        mkdir(&fx.root.join(format!("Release{i:03}")))?;
    }

    let engine = Engine::start_with(&fx.root, &fx.index, RECONCILE)?;
    assert_eq!(engine.store().count()?, 300);
    assert_eq!(engine.registry().len(), 300);

    let last = fx.root.join("Release299");
    set_state(&last, Status::Dupe)?;
    assert!(wait_until(|| status_of(&engine, "Release299") == Some(Status::Dupe)));
    assert!(wait_until(|| engine.registry().len() == 299));
    Ok(())
}
