//! Integration tests for ConfigMap style directory mounts.

#![cfg(feature = "directory")]

use hotswap_flags::prelude::*;
use hotswap_flags::sources::DATA_MARKER;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config() -> WatcherConfig {
    WatcherConfig {
        stop_grace_ms: 1_000,
        debounce_ms: 20,
        ..WatcherConfig::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn write_snapshot(root: &Path, name: &str, files: &[(&str, &str)]) {
    let snapshot = root.join(name);
    fs::create_dir(&snapshot).unwrap();
    for (file, content) in files {
        fs::write(snapshot.join(file), content).unwrap();
    }
}

#[cfg(unix)]
fn point_data_at(root: &Path, snapshot: &str) {
    let tmp = root.join("..data_tmp");
    std::os::unix::fs::symlink(root.join(snapshot), &tmp).unwrap();
    fs::rename(&tmp, root.join(DATA_MARKER)).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_configmap_swap_updates_dynamic_flags() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_snapshot(root, "..2024_01_01_snap_a", &[("x", "1\n"), ("mode", "blue")]);
    write_snapshot(root, "..2024_01_02_snap_b", &[("x", "2\n"), ("mode", "green")]);
    point_data_at(root, "..2024_01_01_snap_a");

    let registry = Arc::new(FlagRegistry::new());
    let x = registry.dynamic("x", 0i32, "").unwrap();
    let mode = registry
        .static_flag("mode", String::from("none"), "")
        .unwrap();

    let source = DirectorySource::new(root.join(DATA_MARKER));
    let watcher = Reconciler::with_config(registry, Arc::new(source), fast_config());

    watcher.initialize().await.unwrap();
    assert_eq!(*x.get(), 1);
    assert_eq!(mode.get().as_str(), "blue");

    watcher.start().unwrap();
    // Give the watch a moment to be armed before swapping.
    tokio::time::sleep(Duration::from_millis(100)).await;
    point_data_at(root, "..2024_01_02_snap_b");

    wait_until(|| *x.get() == 2).await;
    assert_eq!(mode.get().as_str(), "blue");
    assert!(watcher.cursor() >= 1);

    watcher.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_mount_root_swap_updates_dynamic_flags() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write_snapshot(root, "..2024_01_01_snap_a", &[("x", "1"), ("mode", "blue")]);
    write_snapshot(root, "..2024_01_02_snap_b", &[("x", "2"), ("mode", "green")]);
    point_data_at(root, "..2024_01_01_snap_a");
    for file in ["x", "mode"] {
        std::os::unix::fs::symlink(Path::new(DATA_MARKER).join(file), root.join(file)).unwrap();
    }

    let registry = Arc::new(FlagRegistry::new());
    let x = registry.dynamic("x", 0i32, "").unwrap();
    let mode = registry
        .static_flag("mode", String::from("none"), "")
        .unwrap();

    let watcher = Reconciler::with_config(registry, Arc::new(DirectorySource::new(root)), fast_config());

    watcher.initialize().await.unwrap();
    assert_eq!(*x.get(), 1);
    assert_eq!(mode.get().as_str(), "blue");

    watcher.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    point_data_at(root, "..2024_01_02_snap_b");

    wait_until(|| *x.get() == 2).await;
    assert_eq!(mode.get().as_str(), "blue");
    assert!(watcher.cursor() >= 1);

    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_plain_directory_file_updates() {
    let temp_dir = TempDir::new().unwrap();
    let dir = temp_dir.path().join("flags");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("interval"), "10s").unwrap();

    let registry = Arc::new(FlagRegistry::new());
    let interval = registry
        .dynamic("interval", Duration::from_secs(1), "Poll interval")
        .unwrap();

    let watcher = Reconciler::with_config(
        registry,
        Arc::new(DirectorySource::new(&dir)),
        fast_config(),
    );
    watcher.initialize().await.unwrap();
    assert_eq!(*interval.get(), Duration::from_secs(10));
    watcher.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    fs::write(dir.join("interval"), "250ms").unwrap();
    wait_until(|| *interval.get() == Duration::from_millis(250)).await;

    // Read-only source: a rejected value is logged and left in place.
    fs::write(dir.join("interval"), "soon").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*interval.get(), Duration::from_millis(250));
    assert_eq!(fs::read_to_string(dir.join("interval")).unwrap(), "soon");

    watcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_missing_directory_fails_initialize() {
    let registry = Arc::new(FlagRegistry::new());
    let watcher = Reconciler::new(
        registry,
        Arc::new(DirectorySource::new("/nonexistent/flags/..data")),
    );

    assert!(matches!(
        watcher.initialize().await,
        Err(FlagError::Source(SourceError::Io(_)))
    ));
    assert_eq!(watcher.state(), WatcherState::Uninitialized);
}
